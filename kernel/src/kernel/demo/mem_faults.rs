// kernel/src/kernel/demo/mem_faults.rs
//
// 役割:
// - demand paging を実際の #PF で確かめる。
//   - pf_demo: heap の read（ゼロページ）→ write（専用ページ）、スタック領域の伸長
//   - pf_demo_stack_overflow: スタックの guard に書いて致命ダンプを出す（戻らない）
//
// 方針:
// - 触るのは 1 回ずつ。結果は translate() で確かめてログに出す
// - ここでは停止しない（致命なら #PF handler が止める）

use crate::arch::paging::MemoryBus;
use crate::kernel::Kernel;

pub fn run<B: MemoryBus>(kernel: &Kernel<'_, B>) {
    #[cfg(all(feature = "pf_demo", target_os = "none"))]
    pf_demo(kernel);

    #[cfg(all(feature = "pf_demo_stack_overflow", target_os = "none"))]
    stack_overflow(kernel);

    let _ = kernel;
}

#[cfg(all(feature = "pf_demo", target_os = "none"))]
fn pf_demo<B: MemoryBus>(kernel: &Kernel<'_, B>) {
    use crate::logging;
    use crate::mem::addr::{VirtAddr, PAGE_SIZE};
    use crate::mem::layout::{DEFAULT_STACK_SIZE, STACK_GUARD_SIZE};
    use crate::mem::regions::RegionKind;
    use crate::mm::PhysicalPageSource;

    let Some(heap) = kernel.regions.heap() else {
        logging::warn("pf_demo: no heap region");
        return;
    };
    let va = VirtAddr(heap.start.0 + PAGE_SIZE);

    let before = unsafe { core::ptr::read_volatile(va.0 as *const u64) };
    let shared = kernel.ptm.translate(va).map(|t| t.phys);
    logging::info_fmt(format_args!(
        "pf_demo: heap read {:#x} -> {:#x} (zero page: {})",
        va.0,
        before,
        shared.is_some() && shared == kernel.ptm.zero_page()
    ));

    unsafe { core::ptr::write_volatile(va.0 as *mut u64, 0x5a5a) };
    let private = kernel.ptm.translate(va).map(|t| t.phys.0).unwrap_or(0);
    logging::info_fmt(format_args!("pf_demo: heap write -> phys {:#x}", private));

    match kernel
        .regions
        .alloc(DEFAULT_STACK_SIZE, PAGE_SIZE, "pf_demo stack", STACK_GUARD_SIZE, RegionKind::Stack, false)
    {
        Ok(stack) => {
            // 上端から 2 ページ分だけ伸ばす
            let top = stack.end() - 8;
            for i in 0..2 {
                let p = top - i * PAGE_SIZE;
                unsafe { core::ptr::write_volatile(p as *mut u64, i) };
            }
            logging::info_fmt(format_args!(
                "pf_demo: stack {:#x}..{:#x} grew 2 pages, free pages {}",
                stack.usable_start().0,
                stack.end(),
                kernel.pmem().free_pages()
            ));
        }
        Err(e) => logging::warn_fmt(format_args!("pf_demo: stack region: {}", e)),
    }
}

#[cfg(all(feature = "pf_demo_stack_overflow", target_os = "none"))]
fn stack_overflow<B: MemoryBus>(kernel: &Kernel<'_, B>) {
    use crate::logging;
    use crate::mem::addr::PAGE_SIZE;
    use crate::mem::layout::{DEFAULT_STACK_SIZE, STACK_GUARD_SIZE};
    use crate::mem::regions::RegionKind;

    match kernel
        .regions
        .alloc(DEFAULT_STACK_SIZE, PAGE_SIZE, "overflow stack", STACK_GUARD_SIZE, RegionKind::Stack, false)
    {
        Ok(stack) => {
            logging::info_fmt(format_args!("pf_demo_stack_overflow: touching guard at {:#x}", stack.start.0));
            unsafe { core::ptr::write_volatile(stack.start.0 as *mut u64, 0) };
            logging::error("pf_demo_stack_overflow: guard write returned");
        }
        Err(e) => logging::warn_fmt(format_args!("pf_demo_stack_overflow: stack region: {}", e)),
    }
}
