// src/kernel/mod.rs
//
// demand-kernel: Region 表 + 物理ページ供給 + ページテーブル + #PF 処理 + 協調スケジューラ
//
// - event / thread / delta_queue / sched: スレッドとイベント、優先度付き run-queue
// - fault / fault_stack / unwind: #PF の分類と demand map、入れ子 fault 用スタック、致命時ダンプ
// - Kernel: ブート時に組み立てた部品への参照の束（どこからでも届くグローバルは持たない）
//
// [設計上の不変条件]
//
// 1. ロック順
//    - sched → events。Pmem は stack → bitmap。PageTableManager は自分のロックを持たない。
//    - fault 処理中に物理ページ待ちで止まるときは、どのロックも持っていない。
//
// 2. 物理ページ
//    - CEILING 未満はビットマップ、以上はスタック。両方に載るページは無い。
//    - populate は物理ページを要求しない（scratch の上位段は init_memory が先に作る）。
//
// 3. スレッド
//    - 各スレッドは run-queue / sleep キュー / blocking リストのどれか 1 つにだけ居る（Released ならどこにも居ない）。
//    - 起床は get_next_thread の呼び出し境界でだけ起きる。

pub mod delta_queue;
pub mod demo;
pub mod event;
pub mod fault;
pub mod fault_stack;
pub mod sched;
pub mod thread;
pub mod trace;
pub mod unwind;

#[cfg(target_os = "none")]
pub mod entry;
#[cfg(target_os = "none")]
pub mod state_ref;

use core::fmt;

use crate::arch::paging::MemoryBus;
use crate::logging;
use crate::mem::addr::VirtAddr;
use crate::mem::regions::{RegionError, RegionTable};
use crate::mm::populate::{self, PopulateError};
use crate::mm::{MapError, PageTableManager, PhysRange, Pmem};

use self::event::{EventError, EventTable};
use self::fault::{FatalFault, FaultDispatcher, FaultRecord, Resolved};
use self::sched::{SchedError, Scheduler};
use self::thread::ThreadId;
use self::unwind::SymbolLookup;

/// タイマ 1 回分（ns）
pub const TICK: u64 = 1_000_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootError {
    Region(RegionError),
    Event(EventError),
    Map(MapError),
    Populate(PopulateError),
    Sched(SchedError),
}

impl From<RegionError> for BootError {
    fn from(e: RegionError) -> Self {
        BootError::Region(e)
    }
}

impl From<EventError> for BootError {
    fn from(e: EventError) -> Self {
        BootError::Event(e)
    }
}

impl From<MapError> for BootError {
    fn from(e: MapError) -> Self {
        BootError::Map(e)
    }
}

impl From<PopulateError> for BootError {
    fn from(e: PopulateError) -> Self {
        match e {
            PopulateError::Region(r) => BootError::Region(r),
            PopulateError::Map(m) => BootError::Map(m),
            other => BootError::Populate(other),
        }
    }
}

impl From<SchedError> for BootError {
    fn from(e: SchedError) -> Self {
        BootError::Sched(e)
    }
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootError::Region(e) => write!(f, "boot: {}", e),
            BootError::Event(e) => write!(f, "boot: {}", e),
            BootError::Map(e) => write!(f, "boot: {}", e),
            BootError::Populate(e) => write!(f, "boot: {}", e),
            BootError::Sched(e) => write!(f, "boot: {}", e),
        }
    }
}

/// ブート時のメモリ初期化。
///
/// 1. Region 表の固定ゾーンを作る
/// 2. 空き物理範囲を Pmem へ（低位はすぐ使える、高位は保留）
/// 3. スタック準備完了イベントを作り、以後の枯渇は WouldBlock で返す
/// 4. scratch ページとゼロページを用意し、保留していた高位範囲を populate する
///
/// 戻り値はスタックに積んだページ数（高位メモリが無い機械では 0）。
pub fn init_memory<B: MemoryBus>(
    regions: &RegionTable,
    events: &EventTable,
    ptm: &PageTableManager<'_, B, Pmem>,
    image_base: VirtAddr,
    image_length: u64,
    free: &[PhysRange],
) -> Result<u64, BootError> {
    regions.init(image_base, image_length)?;

    let pmem = ptm.pages();
    let low: u64 = free.iter().map(|r| pmem.add_boot_range(*r)).sum();
    logging::info_u64("kernel::init_memory: low pages", low);

    let ready = events.create_plain()?;
    pmem.enable_blocking(ready);

    let scratch = populate::prepare_scratch(ptm, regions)?;
    logging::info_hex("kernel::init_memory: scratch", scratch.0);

    match populate::populate_pending(ptm, regions, events) {
        Ok(pushed) => Ok(pushed),
        Err(PopulateError::NothingToAdd) => {
            logging::warn("kernel::init_memory: no memory above the bitmap ceiling; page stack stays empty");
            Ok(0)
        }
        Err(e) => Err(e.into()),
    }
}

/// ブート時に組み立てた部品への参照
pub struct Kernel<'a, B: MemoryBus> {
    pub regions: &'a RegionTable,
    pub events: &'a EventTable,
    pub ptm: &'a PageTableManager<'a, B, Pmem>,
    pub sched: &'a Scheduler<'a>,
    pub faults: &'a FaultDispatcher<'a, B, Pmem>,
}

impl<'a, B: MemoryBus> Kernel<'a, B> {
    pub fn pmem(&self) -> &'a Pmem {
        self.ptm.pages()
    }

    /// #PF 1 回分。致命なら `out` へダンプしてから Err を返す（停止は呼び出し側）。
    pub fn on_page_fault(
        &self,
        rec: &FaultRecord,
        out: &mut dyn fmt::Write,
        symbols: &dyn SymbolLookup,
    ) -> Result<Resolved, FatalFault> {
        self.faults.handle(rec).map_err(|fatal| {
            let _ = self.faults.report(&fatal, rec, out, symbols);
            fatal
        })
    }

    pub fn on_timer(&self, elapsed: u64) -> Result<Option<ThreadId>, SchedError> {
        self.sched.timer_tick(elapsed)
    }

    pub fn dump(&self) {
        self.regions.dump();
        self.pmem().dump();
        self.sched.dump_trace();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::paging::PageTableView;
    use crate::arch::virt_layout::PAGE_TABLE_WINDOW_BASE;
    use crate::kernel::event::{EventId, NoProbe};
    use crate::kernel::fault::{FaultCode, PageWaiter};
    use crate::kernel::fault_stack::{FaultStackPool, InterruptStackTable, FAULT_STACK_POOL};
    use crate::kernel::sched::ContextSwitch;
    use crate::kernel::thread::ThreadLocation;
    use crate::kernel::trace::SchedEvent;
    use crate::kernel::unwind::NoSymbols;
    use crate::mem::addr::{PhysAddr, PAGE_SIZE};
    use crate::mem::layout::{DEFAULT_STACK_SIZE, HEAP_START};
    use crate::mem::paging::PageFlags;
    use crate::mm::pmem::BITMAP_CEILING;
    use crate::mm::sim::SimMachine;
    use crate::mm::PhysicalPageSource;
    use core::cell::{Cell, RefCell};
    use std::string::String;
    use std::vec::Vec;

    struct NoIst;
    impl InterruptStackTable for NoIst {
        fn set_fault_stack(&self, _top: VirtAddr) {}
    }

    struct Recorder(RefCell<Vec<(Option<ThreadId>, ThreadId)>>);
    impl ContextSwitch for Recorder {
        fn switch_to(&self, from: Option<ThreadId>, to: ThreadId) {
            self.0.borrow_mut().push((from, to));
        }
    }

    fn tops() -> [VirtAddr; FAULT_STACK_POOL] {
        core::array::from_fn(|i| VirtAddr(0x4000 * (i as u64 + 1)))
    }

    struct Machine {
        sim: SimMachine,
        pmem: Pmem,
        regions: RegionTable,
        events: EventTable,
        switch: Recorder,
    }

    impl Machine {
        fn new() -> Self {
            Machine {
                sim: SimMachine::new(),
                pmem: Pmem::new(),
                regions: RegionTable::new(),
                events: EventTable::new(),
                switch: Recorder(RefCell::new(Vec::new())),
            }
        }

        fn ptm(&self) -> PageTableManager<'_, SimMachine, Pmem> {
            PageTableManager::new(PageTableView::new(&self.sim, VirtAddr(PAGE_TABLE_WINDOW_BASE)), &self.pmem)
        }

        fn boot(&self, ptm: &PageTableManager<'_, SimMachine, Pmem>, low_pages: u64) -> u64 {
            let free = [PhysRange::new(PhysAddr(0x10_0000), low_pages * PAGE_SIZE)];
            init_memory(&self.regions, &self.events, ptm, VirtAddr(0x20_0000), 0x10_0000, &free).unwrap()
        }
    }

    /// sim 上のアクセス。fault したら dispatcher に渡してもう一度だけ試す。
    fn touch<B: MemoryBus>(k: &Kernel<'_, B>, sim: &SimMachine, va: VirtAddr, write: bool) -> Result<u32, FatalFault> {
        let access = |sim: &SimMachine| if write { sim.write(va, 0x5a) } else { sim.read(va).map(|_| ()) };
        let mut faults = 0;
        while let Err(f) = access(sim) {
            faults += 1;
            assert!(faults <= 2, "fault loop at {:?}", f);
            let mut out = String::new();
            k.on_page_fault(&f.into(), &mut out, &NoSymbols)?;
        }
        Ok(faults)
    }

    #[test]
    fn init_memory_prepares_the_zero_page_and_scratch() {
        let m = Machine::new();
        let ptm = m.ptm();
        let free = [
            PhysRange::new(PhysAddr(0x10_0000), 8 * PAGE_SIZE),
            PhysRange::new(PhysAddr(BITMAP_CEILING), 3 * PAGE_SIZE),
        ];
        let pushed = init_memory(&m.regions, &m.events, &ptm, VirtAddr(0x20_0000), 0x10_0000, &free).unwrap();
        assert_eq!(pushed, 3);
        assert!(ptm.zero_page().is_some());
        assert!(m.pmem.is_stack_ready());
        let ready = m.pmem.ready_event().unwrap();
        assert!(m.events.is_set(ready, 0, &NoProbe));
        // 3 段 + ゼロページ
        assert_eq!(m.pmem.bitmap_free(), 4);
        assert_eq!(m.pmem.free_pages(), 7);
    }

    #[test]
    fn init_memory_without_high_memory_still_boots() {
        let m = Machine::new();
        let ptm = m.ptm();
        assert_eq!(m.boot(&ptm, 8), 0);
        assert!(!m.pmem.is_stack_ready());
        assert_eq!(m.pmem.begin_alloc().map(|o| o.addr()).ok(), Some(PhysAddr(0x10_0000 + 4 * PAGE_SIZE)));
    }

    #[test]
    fn demand_heap_growth() {
        let m = Machine::new();
        let ptm = m.ptm();
        m.boot(&ptm, 16);
        let sched = Scheduler::new(&m.events, &NoProbe, &m.switch, &m.regions);
        let ist = NoIst;
        let pool = FaultStackPool::new(tops(), &ist);
        let faults = FaultDispatcher::new(&m.regions, &ptm, &sched, &pool);
        let k = Kernel { regions: &m.regions, events: &m.events, ptm: &ptm, sched: &sched, faults: &faults };

        let h = HEAP_START;
        let va = VirtAddr(h + 0x1000);
        assert!(!ptm.is_mapped(va));

        assert_eq!(touch(&k, &m.sim, va, false), Ok(1));
        assert!(ptm.is_mapped(va));
        let t = ptm.translate(va).unwrap();
        assert_eq!(Some(t.phys), ptm.zero_page());
        assert!(!t.flags.contains(PageFlags::WRITABLE));

        assert_eq!(touch(&k, &m.sim, va, true), Ok(1));
        let private = ptm.translate(va).unwrap();
        assert_ne!(Some(private.phys), ptm.zero_page());
        assert_eq!(touch(&k, &m.sim, va, true), Ok(0));
        assert_eq!(m.sim.read(va), Ok(0x5a));

        // 隣のページはまだゼロページのまま読める
        assert_eq!(touch(&k, &m.sim, VirtAddr(h + 0x2000), false), Ok(1));
        assert_eq!(m.sim.read(VirtAddr(h + 0x2000)), Ok(0));
    }

    #[test]
    fn stack_guard_is_fatal_and_the_rest_grows_on_demand() {
        let m = Machine::new();
        let ptm = m.ptm();
        m.boot(&ptm, 32);
        let sched = Scheduler::new(&m.events, &NoProbe, &m.switch, &m.regions);
        let ist = NoIst;
        let pool = FaultStackPool::new(tops(), &ist);
        let faults = FaultDispatcher::new(&m.regions, &ptm, &sched, &pool);
        let k = Kernel { regions: &m.regions, events: &m.events, ptm: &ptm, sched: &sched, faults: &faults };

        let t = sched.spawn("worker", 5, DEFAULT_STACK_SIZE).unwrap();
        let stack = sched.thread(t).unwrap().stack.unwrap();
        let s = stack.start.0;
        assert_eq!(stack.length, 0x9000);

        for off in [0x1000u64, 0x4ff8, 0x8ff8] {
            assert_eq!(touch(&k, &m.sim, VirtAddr(s + off), true), Ok(1));
        }

        for off in [0u64, 0x800, 0xff8] {
            let fatal = k.faults.handle(&FaultRecord::new(VirtAddr(s + off), FaultCode::WRITE));
            assert_eq!(fatal, Err(FatalFault::StackOverflow { addr: VirtAddr(s + off), region: "worker" }));
        }
        assert!(!ptm.is_mapped(VirtAddr(s)));

        let mut out = String::new();
        let rec = FaultRecord::new(VirtAddr(s + 0x10), FaultCode::WRITE);
        assert!(k.on_page_fault(&rec, &mut out, &NoSymbols).is_err());
        assert!(out.starts_with("FATAL PAGE FAULT: stack overflow"));
        assert!(out.contains("stack trace:"));
    }

    /// 物理ページ待ちで止まったら populate スレッドに切り替わり、補充して yield する
    struct PopulateOnWait<'s> {
        sched: &'s Scheduler<'s>,
        populate_thread: ThreadId,
        run_populate: &'s dyn Fn() -> u64,
        pushed: Cell<u64>,
    }

    impl PageWaiter for PopulateOnWait<'_> {
        fn wait_for_pages(&self, ev: EventId) -> Result<(), SchedError> {
            self.sched.wait_for_pages(ev)?;
            assert_eq!(self.sched.current(), Some(self.populate_thread));
            self.pushed.set((self.run_populate)());
            self.sched.yield_now()?;
            Ok(())
        }
    }

    #[test]
    fn exhaustion_blocks_until_populate_signals() {
        let m = Machine::new();
        let ptm = m.ptm();
        // 低位 4 枚は scratch の 3 段とゼロページで尽きる
        m.boot(&ptm, 4);
        assert_eq!(m.pmem.free_pages(), 0);

        let sched = Scheduler::new(&m.events, &NoProbe, &m.switch, &m.regions);
        let a = sched.spawn("faulter", 5, DEFAULT_STACK_SIZE).unwrap();
        let p = sched.spawn("populate", 3, DEFAULT_STACK_SIZE).unwrap();
        sched.start(a).unwrap();
        sched.start(p).unwrap();
        assert_eq!(sched.start_running(), Some(a));

        let run_populate = || {
            let high = [PhysRange::new(PhysAddr(BITMAP_CEILING), 2 * PAGE_SIZE)];
            populate::populate(&ptm, &m.regions, &m.events, &high).unwrap()
        };
        let waiter = PopulateOnWait { sched: &sched, populate_thread: p, run_populate: &run_populate, pushed: Cell::new(0) };
        let ist = NoIst;
        let pool = FaultStackPool::new(tops(), &ist);
        let faults = FaultDispatcher::new(&m.regions, &ptm, &waiter, &pool);

        // スタックの guard より上（scratch と同じ最下段テーブルに乗る）
        let stack = sched.thread(a).unwrap().stack.unwrap();
        let va = VirtAddr(stack.end() - 8);
        let rec: FaultRecord = m.sim.write(va, 1).unwrap_err().into();

        let resolved = faults.handle(&rec).unwrap();
        assert_eq!(resolved.waits, 1);
        assert_eq!(waiter.pushed.get(), 2);
        assert_eq!(resolved.phys, PhysAddr(BITMAP_CEILING + PAGE_SIZE));
        m.sim.write(va, 1).unwrap();

        assert_eq!(sched.current(), Some(a));
        assert_eq!(sched.location(a), Some(ThreadLocation::Running(5)));
        assert_eq!(*m.switch.0.borrow(), [(None, a), (Some(a), p), (Some(p), a)]);
        assert!(sched.with_trace(|t| {
            let seen: Vec<SchedEvent> = t.iter().collect();
            seen.contains(&SchedEvent::Blocked(a)) && seen.contains(&SchedEvent::Woken(a))
        }));
        assert_eq!(m.pmem.stack_depth(), 1);
    }

    #[test]
    fn timer_ticks_reach_the_scheduler() {
        let m = Machine::new();
        let ptm = m.ptm();
        m.boot(&ptm, 8);
        let sched = Scheduler::new(&m.events, &NoProbe, &m.switch, &m.regions);
        let ist = NoIst;
        let pool = FaultStackPool::new(tops(), &ist);
        let faults = FaultDispatcher::new(&m.regions, &ptm, &sched, &pool);
        let k = Kernel { regions: &m.regions, events: &m.events, ptm: &ptm, sched: &sched, faults: &faults };

        assert_eq!(k.on_timer(TICK), Err(SchedError::NotStarted));
        let boot = sched.adopt("boot", 5).unwrap();
        sched.start_running();
        assert_eq!(k.on_timer(TICK), Ok(Some(boot)));
        assert_eq!(sched.now(), TICK);
    }
}
