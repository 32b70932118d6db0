// kernel/src/panic.rs
//
// no_std カーネル用 panic ハンドラ。
// - 挙動は「緊急出力（ロック無し） → CPU 停止」に固定する。
// - logging はロックを取るので使わない（panic がロック保持中に起きることがある）
// - 二重 panic は即停止

use core::panic::PanicInfo;
use core::sync::atomic::{AtomicBool, Ordering};

use x86_64::instructions::interrupts;

use crate::arch::{self, interrupts::emergency_write_hex_u64, interrupts::emergency_write_str};

static PANIC_IN_PROGRESS: AtomicBool = AtomicBool::new(false);

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    interrupts::disable();

    if PANIC_IN_PROGRESS.swap(true, Ordering::AcqRel) {
        emergency_write_str("[PANIC] re-entered => halt\n");
        return arch::halt_loop();
    }

    emergency_write_str("[PANIC] kernel panic\n");

    if let Some(loc) = info.location() {
        emergency_write_str("[PANIC] ");
        emergency_write_str(loc.file());
        emergency_write_str(" line=");
        emergency_write_hex_u64(loc.line() as u64);
        emergency_write_str(" col=");
        emergency_write_hex_u64(loc.column() as u64);
        emergency_write_str("\n");
    } else {
        emergency_write_str("[PANIC] location unknown\n");
    }

    arch::halt_loop()
}
