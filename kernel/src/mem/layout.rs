// kernel/src/mem/layout.rs
//
// x86_64 仮想アドレスレイアウト（固定ゾーン）
//
// 目的:
// - RegionTable::init が切り出す固定ゾーンの位置と大きさをここに集約する。
// - 値を変えるときはここだけを触ればよいようにする。
//
// 想定レイアウト（アドレス順）:
//
//   0x0000_0000_0000_0000 .. image_base           null guard（image_base != 0 のときだけ）
//   image_base .. image_base + image_length        カーネルイメージ
//   align_up(image end) .. 0x0000_7000_0000_0000   Free（ここから前詰めで切り出す）
//   0x0000_7000_0000_0000 .. 0x0000_8000_0000_0000 デバイス窓
//   0x0000_8000_0000_0000 .. 0xffff_8000_0000_0000 non-canonical hole
//   0xffff_8000_0000_0000 .. 0xffff_ff00_0000_0000 heap
//   0xffff_ff80_0000_0000 .. 0xffff_ffff_ffff_ffff ページテーブル窓（PML4[511]）

use crate::arch::virt_layout::{PAGE_TABLE_WINDOW_BASE, PML4_SLOT_SIZE};

/// null guard の最大長
pub const NULL_GUARD_MAX: u64 = 0x1000;

/// Free アリーナの終端（ここから先はデバイス窓）
pub const FREE_END: u64 = 0x0000_7000_0000_0000;

pub const DEVICES_START: u64 = 0x0000_7000_0000_0000;
pub const DEVICES_LENGTH: u64 = 0x0000_1000_0000_0000;

pub const NONCANONICAL_START: u64 = 0x0000_8000_0000_0000;
pub const NONCANONICAL_LENGTH: u64 = 0xffff_0000_0000_0000;

pub const HEAP_START: u64 = 0xffff_8000_0000_0000;
pub const HEAP_LENGTH: u64 = 0x0000_7f00_0000_0000;

pub const PAGE_TABLES_START: u64 = PAGE_TABLE_WINDOW_BASE;
pub const PAGE_TABLES_LENGTH: u64 = PML4_SLOT_SIZE;

/// スレッドスタックの既定長と guard 長
pub const DEFAULT_STACK_SIZE: u64 = 0x8000;
pub const STACK_GUARD_SIZE: u64 = 0x1000;
