// kernel/src/arch/mod.rs
//
// アーキ依存部。unsafe をできるだけここに閉じ込める方針。
// - paging: MemoryBus とページテーブル窓（host テストでも使う）
// - virt_layout: 再帰スロットと窓のアドレス計算
// - gdt / interrupts: bare-metal のみ

pub mod paging;
pub mod virt_layout;

#[cfg(target_os = "none")]
pub mod gdt;
#[cfg(target_os = "none")]
pub mod interrupts;

/// GDT/TSS（fault スタックプールを含む）と IDT をロードする
#[cfg(target_os = "none")]
pub fn init() {
    gdt::init();
    interrupts::init();
}

/// CPU を停止させるループ
#[cfg(target_os = "none")]
pub fn halt_loop() -> ! {
    loop {
        x86_64::instructions::hlt();
    }
}
