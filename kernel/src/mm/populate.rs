// kernel/src/mm/populate.rs
//
// 役割:
// - 高位（ビットマップの CEILING 以上）の空き物理ページを Pmem のスタックへ積む。
//
// やること:
// - 1 枚の scratch 仮想ページ（Region 名 "pmem_temp_page"）に各ページを順に貼り、
//   先頭 8byte に現在の head を書いてから push する
// - CEILING 未満の部分はビットマップへ戻す
// - 終わったらスタック準備完了にして ready イベントを立てる（待っているスレッドは次の polling で起きる）
//
// やらないこと:
// - スレッドとして走らせること（呼び出し側が populate 専用スレッドや boot 経路から呼ぶ）
//
// 設計方針:
// - scratch の map は stack のロックを持たずに行う（map が上位段のためにページを取るかもしれない）

use core::fmt;

use crate::arch::paging::MemoryBus;
use crate::kernel::event::EventTable;
use crate::logging;
use crate::mem::addr::{PhysAddr, VirtAddr, PAGE_SIZE};
use crate::mem::paging::{MapTarget, PageFlags};
use crate::mem::regions::{RegionError, RegionTable};

use super::pmem::{Pmem, BITMAP_CEILING};
use super::{MapError, PageTableManager, PhysRange};

pub const SCRATCH_REGION_NAME: &str = "pmem_temp_page";

const MAX_BATCH: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PopulateError {
    NothingToAdd,
    Map(MapError),
    Region(RegionError),
}

impl From<MapError> for PopulateError {
    fn from(e: MapError) -> Self {
        PopulateError::Map(e)
    }
}

impl From<RegionError> for PopulateError {
    fn from(e: RegionError) -> Self {
        PopulateError::Region(e)
    }
}

impl fmt::Display for PopulateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PopulateError::NothingToAdd => write!(f, "populate found no free pages to add"),
            PopulateError::Map(e) => write!(f, "populate: {}", e),
            PopulateError::Region(e) => write!(f, "populate: scratch page: {}", e),
        }
    }
}

fn scratch_page(pmem: &Pmem, regions: &RegionTable) -> Result<VirtAddr, RegionError> {
    if let Some(va) = pmem.scratch().get() {
        return Ok(*va);
    }
    let va = regions.alloc_address(PAGE_SIZE, PAGE_SIZE, SCRATCH_REGION_NAME)?;
    Ok(*pmem.scratch().call_once(|| va))
}

/// scratch ページを確保し、その上位段のテーブルをここで作っておく。
///
/// ビットマップにページが残っているうちに呼ぶこと（以後の populate は物理ページを要求しない）。
pub fn prepare_scratch<B: MemoryBus>(
    ptm: &PageTableManager<'_, B, Pmem>,
    regions: &RegionTable,
) -> Result<VirtAddr, PopulateError> {
    let scratch = scratch_page(ptm.pages(), regions)?;
    ptm.map(scratch, MapTarget::ZeroPage, PageFlags::empty())?;
    ptm.unmap(scratch);
    Ok(scratch)
}

/// `ranges` の空きページを Pmem に加える。戻り値はスタックに積んだページ数。
pub fn populate<B: MemoryBus>(
    ptm: &PageTableManager<'_, B, Pmem>,
    regions: &RegionTable,
    events: &EventTable,
    ranges: &[PhysRange],
) -> Result<u64, PopulateError> {
    let pmem = ptm.pages();
    let scratch = scratch_page(pmem, regions)?;

    logging::info("mm::populate: start");

    let mut low = 0;
    let mut pushed = 0;
    for range in ranges.iter().filter(|r| r.is_usable()) {
        low += pmem.release_low_pages(*range);

        for page in range.pages().filter(|p| p.0 >= BITMAP_CEILING) {
            push_one(ptm, scratch, page)?;
            pushed += 1;
        }
    }
    ptm.unmap(scratch);

    if pushed == 0 && low == 0 {
        logging::error("mm::populate: nothing to add");
        return Err(PopulateError::NothingToAdd);
    }

    pmem.mark_stack_ready();
    if let Some(ev) = pmem.ready_event() {
        // ready イベントは Pmem が作られた時点から生きている
        let _ = events.set(ev);
    }

    logging::info_u64("mm::populate: pushed", pushed);
    logging::info_u64("mm::populate: released low", low);
    Ok(pushed)
}

/// ブート時に Pmem が預かった高位範囲をまとめて populate する
pub fn populate_pending<B: MemoryBus>(
    ptm: &PageTableManager<'_, B, Pmem>,
    regions: &RegionTable,
    events: &EventTable,
) -> Result<u64, PopulateError> {
    let mut batch = [PhysRange::new(PhysAddr(0), 0); MAX_BATCH];
    let mut n = 0;
    while n < MAX_BATCH {
        match ptm.pages().take_pending() {
            Some(r) => {
                batch[n] = r;
                n += 1;
            }
            None => break,
        }
    }
    populate(ptm, regions, events, &batch[..n])
}

fn push_one<B: MemoryBus>(
    ptm: &PageTableManager<'_, B, Pmem>,
    scratch: VirtAddr,
    page: PhysAddr,
) -> Result<(), MapError> {
    ptm.map(scratch, MapTarget::Frame(page), PageFlags::WRITABLE)?;

    let mut stack = ptm.pages().stack().lock();
    // Safety: page は直前に scratch へ書き込み可能で貼った
    unsafe { stack.push_mapped(page, scratch, ptm.view().bus()) };
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::paging::PageTableView;
    use crate::arch::virt_layout::PAGE_TABLE_WINDOW_BASE;
    use crate::mm::sim::SimMachine;
    use crate::mm::PhysicalPageSource;

    const HEAP: u64 = 0xffff_8000_0000_0000;

    fn regions() -> RegionTable {
        let r = RegionTable::new();
        r.init(VirtAddr(0x20_0000), 0x10_0000).unwrap();
        r
    }

    #[test]
    fn pushes_high_pages_and_signals_readiness() {
        let sim = SimMachine::new();
        let pmem = Pmem::new();
        let events = EventTable::new();
        let ready = events.create_plain().unwrap();
        pmem.enable_blocking(ready);
        pmem.add_boot_range(PhysRange::new(PhysAddr(0x10_0000), 3 * PAGE_SIZE));

        let table = regions();
        let ptm = PageTableManager::new(PageTableView::new(&sim, VirtAddr(PAGE_TABLE_WINDOW_BASE)), &pmem);

        let high = PhysRange::new(PhysAddr(BITMAP_CEILING), 4 * PAGE_SIZE);
        assert_eq!(populate(&ptm, &table, &events, &[high]), Ok(4));

        assert!(pmem.is_stack_ready());
        assert!(events.is_set(ready, 0, &crate::kernel::event::NoProbe));
        assert_eq!(pmem.stack_depth(), 4);
        assert_eq!(pmem.bitmap_free(), 0);

        // 各ページの先頭には 1 つ前に積んだページが書かれている
        assert_eq!(sim.phys_read(PhysAddr(BITMAP_CEILING)), 0);
        assert_eq!(sim.phys_read(PhysAddr(BITMAP_CEILING + 3 * PAGE_SIZE)), BITMAP_CEILING + 2 * PAGE_SIZE);

        let scratch = *pmem.scratch().get().unwrap();
        assert!(!ptm.is_mapped(scratch));
        let region = table.find(scratch).unwrap();
        assert_eq!(region.name, SCRATCH_REGION_NAME);
    }

    #[test]
    fn stack_pages_feed_table_building_and_leaves() {
        let sim = SimMachine::new();
        let pmem = Pmem::new();
        let events = EventTable::new();
        pmem.add_boot_range(PhysRange::new(PhysAddr(0x10_0000), 3 * PAGE_SIZE));
        let table = regions();
        let ptm = PageTableManager::new(PageTableView::new(&sim, VirtAddr(PAGE_TABLE_WINDOW_BASE)), &pmem);

        populate(&ptm, &table, &events, &[PhysRange::new(PhysAddr(BITMAP_CEILING), 6 * PAGE_SIZE)]).unwrap();
        assert_eq!(pmem.free_pages(), 6);

        // ヒープ側の 3 段 + 葉はすべてスタックから来る
        let leaf = ptm.map(VirtAddr(HEAP), MapTarget::Allocate, PageFlags::WRITABLE).unwrap();
        assert_eq!(leaf, PhysAddr(BITMAP_CEILING + 2 * PAGE_SIZE));
        assert_eq!(pmem.free_pages(), 2);
        assert_eq!(pmem.stack().lock().head(), Some(PhysAddr(BITMAP_CEILING + PAGE_SIZE)));

        // 新しいテーブルはリンクを読まれた後でゼロにされている
        assert_eq!(sim.phys_read(PhysAddr(BITMAP_CEILING + 5 * PAGE_SIZE)), 0);
        sim.write(VirtAddr(HEAP + 0x40), 9).unwrap();
        assert_eq!(sim.read(VirtAddr(HEAP + 0x40)).unwrap(), 9);
        assert_eq!(sim.read(VirtAddr(HEAP)).unwrap(), 0);
    }

    #[test]
    fn low_ranges_go_to_the_bitmap() {
        let sim = SimMachine::new();
        let pmem = Pmem::new();
        pmem.add_boot_range(PhysRange::new(PhysAddr(0x10_0000), 3 * PAGE_SIZE));
        let events = EventTable::new();
        let table = regions();
        let ptm = PageTableManager::new(PageTableView::new(&sim, VirtAddr(PAGE_TABLE_WINDOW_BASE)), &pmem);

        assert_eq!(populate(&ptm, &table, &events, &[PhysRange::new(PhysAddr(0x40_0000), 5 * PAGE_SIZE)]), Ok(0));
        assert_eq!(pmem.bitmap_free(), 5);
        assert!(pmem.is_stack_ready());
    }

    #[test]
    fn nothing_to_add_is_an_error() {
        let sim = SimMachine::new();
        let pmem = Pmem::new();
        pmem.add_boot_range(PhysRange::new(PhysAddr(0x10_0000), 3 * PAGE_SIZE));
        let events = EventTable::new();
        let table = regions();
        let ptm = PageTableManager::new(PageTableView::new(&sim, VirtAddr(PAGE_TABLE_WINDOW_BASE)), &pmem);

        assert_eq!(populate(&ptm, &table, &events, &[]), Err(PopulateError::NothingToAdd));
        assert!(!pmem.is_stack_ready());
    }

    #[test]
    fn pending_boot_ranges_are_drained() {
        let sim = SimMachine::new();
        let pmem = Pmem::new();
        pmem.add_boot_range(PhysRange::new(PhysAddr(BITMAP_CEILING - 3 * PAGE_SIZE), 5 * PAGE_SIZE));
        let events = EventTable::new();
        let table = regions();
        let ptm = PageTableManager::new(PageTableView::new(&sim, VirtAddr(PAGE_TABLE_WINDOW_BASE)), &pmem);

        assert_eq!(populate_pending(&ptm, &table, &events), Ok(2));
        assert_eq!(pmem.take_pending(), None);
        assert_eq!(pmem.stack_depth(), 2);
    }

    #[test]
    fn prepared_scratch_lets_populate_run_on_an_empty_bitmap() {
        let sim = SimMachine::new();
        let pmem = Pmem::new();
        let events = EventTable::new();
        pmem.add_boot_range(PhysRange::new(PhysAddr(0x10_0000), 4 * PAGE_SIZE));
        let table = regions();
        let ptm = PageTableManager::new(PageTableView::new(&sim, VirtAddr(PAGE_TABLE_WINDOW_BASE)), &pmem);

        // 3 段 + ゼロページで低位を使い切る
        let scratch = prepare_scratch(&ptm, &table).unwrap();
        assert_eq!(pmem.bitmap_free(), 0);
        assert!(ptm.zero_page().is_some());
        assert!(!ptm.is_mapped(scratch));

        let high = PhysRange::new(PhysAddr(BITMAP_CEILING), 2 * PAGE_SIZE);
        assert_eq!(populate(&ptm, &table, &events, &[high]), Ok(2));
        assert_eq!(*pmem.scratch().get().unwrap(), scratch);
    }

    #[test]
    fn scratch_needs_an_initialised_region_table() {
        let sim = SimMachine::new();
        let pmem = Pmem::new();
        let events = EventTable::new();
        let ptm = PageTableManager::new(PageTableView::new(&sim, VirtAddr(PAGE_TABLE_WINDOW_BASE)), &pmem);

        let err = populate(&ptm, &RegionTable::new(), &events, &[]).unwrap_err();
        assert!(matches!(err, PopulateError::Region(_)));
    }
}
