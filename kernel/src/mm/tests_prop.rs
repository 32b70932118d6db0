// kernel/src/mm/tests_prop.rs
//
// 物理ページ供給元とページテーブル管理の性質テスト。
// - 保存則: 空き + 使用中 = これまでに入れたページ数（高位の release は使用中のまま残る）
// - 2 段階確保: push したときのリンクが pop 後の head になる
// - map の冪等性

#![cfg(test)]

use std::vec::Vec;

use proptest::prelude::*;

use super::pmem::BITMAP_CEILING;
use super::sim::SimMachine;
use super::{PageTableManager, PhysRange, PhysicalPageSource, Pmem};
use crate::arch::paging::PageTableView;
use crate::arch::virt_layout::PAGE_TABLE_WINDOW_BASE;
use crate::mem::addr::{PhysAddr, VirtAddr, PAGE_SIZE};
use crate::mem::paging::{MapTarget, PageFlags};

#[derive(Clone, Copy, Debug)]
enum Op {
    Alloc,
    Release(usize),
}

fn arb_ops() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![
            3 => Just(Op::Alloc),
            2 => any::<usize>().prop_map(Op::Release),
        ],
        0..120,
    )
}

/// 高位ページを sim 上の scratch 経由で積む
fn push_high(sim: &SimMachine, pmem: &Pmem, pages: &[u64]) {
    let ptm = PageTableManager::new(PageTableView::new(sim, VirtAddr(PAGE_TABLE_WINDOW_BASE)), pmem);
    let scratch = VirtAddr(0x7f00_0000);
    for &p in pages {
        ptm.map(scratch, MapTarget::Frame(PhysAddr(p)), PageFlags::WRITABLE).unwrap();
        let mut stack = pmem.stack().lock();
        unsafe { stack.push_mapped(PhysAddr(p), scratch, sim) };
    }
    ptm.unmap(scratch);
    pmem.mark_stack_ready();
}

/// 候補ページを「物理 = 仮想」の窓で確定させる（sim の物理メモリを直接読む）
fn commit_through_window(sim: &SimMachine, pmem: &Pmem) -> Option<PhysAddr> {
    let ptm = PageTableManager::new(PageTableView::new(sim, VirtAddr(PAGE_TABLE_WINDOW_BASE)), pmem);
    let va = VirtAddr(0x7e00_0000);
    let offer = pmem.begin_alloc().ok()?;
    let phys = offer.addr();
    // テーブルは push_high の時点で作ってあるので、ここでは葉の張り替えだけ
    ptm.view().write_entry(
        1,
        va,
        crate::mem::paging::PageTableEntry::new(phys, PageFlags::PRESENT | PageFlags::WRITABLE),
    );
    Some(unsafe { pmem.end_alloc(offer, va, sim) })
}

proptest! {
    #[test]
    fn free_plus_allocated_is_conserved(low in 1u64..40, high in 0u64..40, ops in arb_ops()) {
        let sim = SimMachine::new();
        let pmem = Pmem::new();
        // scratch / 窓用のテーブル 4 段分を余分に入れておく
        pmem.add_boot_range(PhysRange::new(PhysAddr(0x10_0000), (low + 4) * PAGE_SIZE));
        let pages: Vec<u64> = (0..high).map(|i| BITMAP_CEILING + i * PAGE_SIZE).collect();
        push_high(&sim, &pmem, &pages);
        commit_window_tables(&sim, &pmem);

        let total = pmem.free_pages();
        let mut allocated: Vec<PhysAddr> = Vec::new();

        for op in ops {
            match op {
                Op::Alloc => {
                    if let Some(p) = commit_through_window(&sim, &pmem) {
                        prop_assert!(!allocated.contains(&p));
                        allocated.push(p);
                    }
                }
                Op::Release(i) if !allocated.is_empty() => {
                    let i = i % allocated.len();
                    let p = allocated[i];
                    pmem.release(p);
                    if p.0 < BITMAP_CEILING {
                        allocated.swap_remove(i);
                    }
                }
                Op::Release(_) => {}
            }
            prop_assert_eq!(pmem.free_pages() + allocated.len() as u64, total);
        }
    }

    #[test]
    fn push_then_pop_round_trips_the_links(count in 1usize..24, stride in 1u64..8) {
        let sim = SimMachine::new();
        let pmem = Pmem::new();
        pmem.add_boot_range(PhysRange::new(PhysAddr(0x10_0000), 8 * PAGE_SIZE));
        let pages: Vec<u64> = (0..count as u64).map(|i| BITMAP_CEILING + i * stride * PAGE_SIZE).collect();
        push_high(&sim, &pmem, &pages);
        commit_window_tables(&sim, &pmem);
        // 低位を使い切ってスタックだけにする
        while pmem.bitmap_free() > 0 {
            let offer = pmem.begin_alloc().unwrap();
            let _ = unsafe { pmem.end_alloc(offer, VirtAddr(0), &sim) };
        }

        for expected in pages.iter().rev() {
            let head_before = pmem.stack().lock().head();
            prop_assert_eq!(head_before, Some(PhysAddr(*expected)));
            let link = sim.phys_read(PhysAddr(*expected));

            let got = commit_through_window(&sim, &pmem).unwrap();
            prop_assert_eq!(got, PhysAddr(*expected));
            let head_after = pmem.stack().lock().head().map_or(0, |p| p.0);
            prop_assert_eq!(head_after, link);
        }
        prop_assert_eq!(pmem.stack_depth(), 0);
    }

    #[test]
    fn mapping_twice_is_the_same_as_once(page in 0u64..0x1000, frame in 0x200u64..0x10000, writable in any::<bool>()) {
        let sim = SimMachine::new();
        let pmem = Pmem::new();
        pmem.add_boot_range(PhysRange::new(PhysAddr(0x10_0000), 8 * PAGE_SIZE));
        let ptm = PageTableManager::new(PageTableView::new(&sim, VirtAddr(PAGE_TABLE_WINDOW_BASE)), &pmem);

        let va = VirtAddr(0xffff_8000_0000_0000 + page * PAGE_SIZE);
        let flags = if writable { PageFlags::WRITABLE } else { PageFlags::empty() };
        let target = MapTarget::Frame(PhysAddr(frame * PAGE_SIZE));

        let first = ptm.map(va, target, flags).unwrap();
        let after_once = (ptm.is_mapped(va), ptm.translate(va), pmem.free_pages());
        let second = ptm.map(va, target, flags).unwrap();
        let after_twice = (ptm.is_mapped(va), ptm.translate(va), pmem.free_pages());

        prop_assert_eq!(first, second);
        prop_assert_eq!(after_once, after_twice);
        prop_assert!(after_once.0);
    }
}

/// commit_through_window が使う仮想ページの上位段を先に作っておく
fn commit_window_tables(sim: &SimMachine, pmem: &Pmem) {
    let ptm = PageTableManager::new(PageTableView::new(sim, VirtAddr(PAGE_TABLE_WINDOW_BASE)), pmem);
    let va = VirtAddr(0x7e00_0000);
    let p = ptm.map(va, MapTarget::Allocate, PageFlags::WRITABLE).unwrap();
    ptm.unmap(va);
    pmem.release(p);
}
