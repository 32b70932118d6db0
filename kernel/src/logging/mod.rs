// kernel/src/logging/mod.rs
//
// 役割:
// - カーネル全体のログ出口。レベル付きの 1 行ログを出す。
//
// やること:
// - bare-metal: VGA テキスト画面と COM1 の両方へ出す（VGA は無効化できる）
// - host のテスト: stderr へ出す（cargo test の出力で追えるように）
//
// やらないこと:
// - バッファリングや非同期化（ログは同期で出してよい）
// - 致命時の出力（ロックを取らない緊急出力は panic.rs / fault 経路が持つ）
//
// 設計方針:
// - ログ 1 行のためにロックを待たない。#PF は VGA を書いている途中にも入るので、
//   取れなければ VGA は諦めて COM1（ロック無し）だけに出す

#[cfg(target_os = "none")]
mod serial;
#[cfg(target_os = "none")]
mod vga;

#[cfg(target_os = "none")]
pub use serial::SerialWriter;

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use spin::Mutex;

static VGA_ENABLED: AtomicBool = AtomicBool::new(true);

static SKIPPED_LINES: AtomicU64 = AtomicU64::new(0);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Level {
    Info,
    Warn,
    Error,
}

impl Level {
    fn prefix(self) -> &'static str {
        match self {
            Level::Info => "[INFO] ",
            Level::Warn => "[WARN] ",
            Level::Error => "[ERROR] ",
        }
    }
}

pub fn init() {
    #[cfg(target_os = "none")]
    {
        vga::init();
        serial::init();
    }
}

/// VGA が壊れた画面を出すときは COM1 だけにする
pub fn set_vga_enabled(enabled: bool) {
    VGA_ENABLED.store(enabled, Ordering::Relaxed);
}

pub fn is_vga_enabled() -> bool {
    VGA_ENABLED.load(Ordering::Relaxed)
}

/// ロック競合で VGA に出せなかった行数
pub fn skipped_lines() -> u64 {
    SKIPPED_LINES.load(Ordering::Relaxed)
}

/// 取れたときだけ `f` を走らせる。取れなければ数えて None。
#[cfg_attr(all(not(test), not(target_os = "none")), allow(dead_code))]
pub(crate) fn try_with<T, R>(lock: &Mutex<T>, f: impl FnOnce(&mut T) -> R) -> Option<R> {
    match lock.try_lock() {
        Some(mut guard) => Some(f(&mut guard)),
        None => {
            SKIPPED_LINES.fetch_add(1, Ordering::Relaxed);
            None
        }
    }
}

pub fn info(msg: &str) {
    emit(Level::Info, format_args!("{}", msg));
}

pub fn warn(msg: &str) {
    emit(Level::Warn, format_args!("{}", msg));
}

pub fn error(msg: &str) {
    emit(Level::Error, format_args!("{}", msg));
}

pub fn info_u64(label: &str, value: u64) {
    info_kv(label, value);
}

pub fn info_kv(key: &str, value: u64) {
    if key.is_empty() {
        emit(Level::Info, format_args!("{}", value));
    } else {
        emit(Level::Info, format_args!("{} = {}", key, value));
    }
}

/// アドレス用（0x + 16 桁）
pub fn info_hex(key: &str, value: u64) {
    emit(Level::Info, format_args!("{} = {:#018x}", key, value));
}

pub fn info_fmt(args: fmt::Arguments<'_>) {
    emit(Level::Info, args);
}

pub fn warn_fmt(args: fmt::Arguments<'_>) {
    emit(Level::Warn, args);
}

pub fn error_fmt(args: fmt::Arguments<'_>) {
    emit(Level::Error, args);
}

fn emit(level: Level, args: fmt::Arguments<'_>) {
    #[cfg(target_os = "none")]
    {
        if is_vga_enabled() {
            vga::write_prefixed_line(level, args);
        }
        serial::write_prefixed_line(level.prefix(), args);
    }

    #[cfg(all(test, not(target_os = "none")))]
    {
        std::eprintln!("{}{}", level.prefix(), args);
    }

    #[cfg(all(not(test), not(target_os = "none")))]
    {
        let _ = (level, args);
    }
}
