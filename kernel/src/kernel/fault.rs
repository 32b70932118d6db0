// kernel/src/kernel/fault.rs
//
// 役割:
// - #PF の入口から呼ばれ、fault アドレスを Region 表で分類して demand map するか致命扱いにする。
//
// やること:
// - Heap / 遅延確保の種別 / guard より上の Stack: 読みは共有ゼロページ、書きは専用ページ
// - Stack の guard 内: StackOverflow
// - どの Region にも無い / 遅延確保しない種別: AddressNotAllowed
// - 読み取り専用（ゼロページ以外）への書き込み: WriteToReadOnly
// - 物理ページ待ち (WouldBlock) は PageWaiter でスレッドを止めてから再試行
// - 致命時のダンプ（種別・アドレス・レジスタ・Region・スタックトレース）を出力先へ書く
//
// やらないこと:
// - 停止（呼び出し元の arch が halt する）
// - プロセス単位の回復（アドレス空間は 1 つだけ）
//
// 設計方針:
// - 入口で FaultStackPool に入り、抜けるときに guard の drop で戻す
// - 一度ダンプを始めたら、以後の fault は FaultWhileUnwinding で即終了（二重の unwind はしない）

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::paging::MemoryBus;
use crate::kernel::event::EventId;
use crate::kernel::fault_stack::FaultStackPool;
use crate::kernel::sched::{SchedError, Scheduler};
use crate::kernel::unwind::{self, SymbolLookup};
use crate::logging;
use crate::mem::addr::{PhysAddr, VirtAddr};
use crate::mem::paging::{MapTarget, PageFlags};
use crate::mem::regions::{Region, RegionKind, RegionTable};
use crate::mm::{MapError, PageTableManager, PhysicalPageSource};

/// 同じ fault で物理ページ待ちを繰り返す上限
pub const MAX_PAGE_WAITS: u32 = 64;

bitflags::bitflags! {
    /// #PF のエラーコード
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct FaultCode: u64 {
        /// 0 なら非 present、1 なら権限違反
        const PRESENT = 1 << 0;
        const WRITE = 1 << 1;
        const USER = 1 << 2;
        const RESERVED = 1 << 3;
        const INSTRUCTION = 1 << 4;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FaultRecord {
    pub addr: VirtAddr,
    pub code: FaultCode,
    pub rip: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rflags: u64,
}

impl FaultRecord {
    pub fn new(addr: VirtAddr, code: FaultCode) -> Self {
        FaultRecord {
            addr,
            code,
            rip: 0,
            rsp: 0,
            rbp: 0,
            rflags: 0,
        }
    }

    pub fn is_write(&self) -> bool {
        self.code.contains(FaultCode::WRITE)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FatalFault {
    StackOverflow { addr: VirtAddr, region: &'static str },
    AddressNotAllowed { addr: VirtAddr, region: Option<&'static str> },
    FaultWhileUnwinding { addr: VirtAddr },
    OutOfFaultStacks { addr: VirtAddr },
    WriteToReadOnly { addr: VirtAddr, region: &'static str },
    OutOfMemory { addr: VirtAddr, region: &'static str },
    SchedulerUnavailable { addr: VirtAddr, region: &'static str },
}

impl FatalFault {
    pub fn addr(&self) -> VirtAddr {
        match *self {
            FatalFault::StackOverflow { addr, .. }
            | FatalFault::AddressNotAllowed { addr, .. }
            | FatalFault::FaultWhileUnwinding { addr }
            | FatalFault::OutOfFaultStacks { addr }
            | FatalFault::WriteToReadOnly { addr, .. }
            | FatalFault::OutOfMemory { addr, .. }
            | FatalFault::SchedulerUnavailable { addr, .. } => addr,
        }
    }

    pub fn region(&self) -> Option<&'static str> {
        match *self {
            FatalFault::StackOverflow { region, .. }
            | FatalFault::WriteToReadOnly { region, .. }
            | FatalFault::OutOfMemory { region, .. }
            | FatalFault::SchedulerUnavailable { region, .. } => Some(region),
            FatalFault::AddressNotAllowed { region, .. } => region,
            FatalFault::FaultWhileUnwinding { .. } | FatalFault::OutOfFaultStacks { .. } => None,
        }
    }

    fn what(&self) -> &'static str {
        match self {
            FatalFault::StackOverflow { .. } => "stack overflow",
            FatalFault::AddressNotAllowed { .. } => "access to an address outside any backed region",
            FatalFault::FaultWhileUnwinding { .. } => "fault while unwinding a previous fault",
            FatalFault::OutOfFaultStacks { .. } => "ran out of virtual fault stacks",
            FatalFault::WriteToReadOnly { .. } => "write to a read-only page",
            FatalFault::OutOfMemory { .. } => "out of physical memory",
            FatalFault::SchedulerUnavailable { .. } => "no scheduler to wait for physical pages",
        }
    }
}

impl fmt::Display for FatalFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {:#x}", self.what(), self.addr().0)?;
        if let Some(name) = self.region() {
            write!(f, " (region {})", name)?;
        }
        Ok(())
    }
}

/// 物理ページの補充を待つ（現在スレッドを止めて他へ切り替える）
pub trait PageWaiter {
    fn wait_for_pages(&self, ev: EventId) -> Result<(), SchedError>;
}

impl PageWaiter for Scheduler<'_> {
    fn wait_for_pages(&self, ev: EventId) -> Result<(), SchedError> {
        self.wait(&[ev])
    }
}

/// スケジューラがまだ無い（ブート初期）
pub struct NoWaiter;

impl PageWaiter for NoWaiter {
    fn wait_for_pages(&self, _ev: EventId) -> Result<(), SchedError> {
        Err(SchedError::NotStarted)
    }
}

/// 解決できた fault
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Resolved {
    pub phys: PhysAddr,
    pub target: MapTarget,
    /// 物理ページ待ちで止まった回数
    pub waits: u32,
}

pub struct FaultDispatcher<'a, B: MemoryBus, S: PhysicalPageSource> {
    regions: &'a RegionTable,
    ptm: &'a PageTableManager<'a, B, S>,
    waiter: &'a dyn PageWaiter,
    stacks: &'a FaultStackPool<'a>,
    unwinding: AtomicBool,
}

impl<'a, B: MemoryBus, S: PhysicalPageSource> FaultDispatcher<'a, B, S> {
    pub fn new(
        regions: &'a RegionTable,
        ptm: &'a PageTableManager<'a, B, S>,
        waiter: &'a dyn PageWaiter,
        stacks: &'a FaultStackPool<'a>,
    ) -> Self {
        FaultDispatcher {
            regions,
            ptm,
            waiter,
            stacks,
            unwinding: AtomicBool::new(false),
        }
    }

    pub fn is_unwinding(&self) -> bool {
        self.unwinding.load(Ordering::SeqCst)
    }

    pub fn handle(&self, rec: &FaultRecord) -> Result<Resolved, FatalFault> {
        let addr = rec.addr;
        if self.is_unwinding() {
            return Err(FatalFault::FaultWhileUnwinding { addr });
        }
        let _stack = self
            .stacks
            .enter()
            .map_err(|_| FatalFault::OutOfFaultStacks { addr })?;

        let (region, target, flags) = self.classify(rec)?;

        let mut waits = 0;
        loop {
            match self.ptm.map(addr, target, flags) {
                Ok(phys) => return Ok(Resolved { phys, target, waits }),
                Err(MapError::WouldBlock(ev)) => {
                    waits += 1;
                    if waits > MAX_PAGE_WAITS {
                        return Err(FatalFault::OutOfMemory { addr, region: region.name });
                    }
                    if waits == 1 {
                        logging::warn_fmt(format_args!(
                            "kernel::fault: waiting for physical pages at {:#x} (event {})",
                            addr.0, ev.0
                        ));
                    }
                    self.waiter
                        .wait_for_pages(ev)
                        .map_err(|_| FatalFault::SchedulerUnavailable { addr, region: region.name })?;
                }
                Err(MapError::OutOfMemory) => {
                    return Err(FatalFault::OutOfMemory { addr, region: region.name })
                }
            }
        }
    }

    fn classify(&self, rec: &FaultRecord) -> Result<(Region, MapTarget, PageFlags), FatalFault> {
        let addr = rec.addr;
        let region = self
            .regions
            .find(addr)
            .ok_or(FatalFault::AddressNotAllowed { addr, region: None })?;

        if region.kind == RegionKind::Stack && region.in_guard(addr) {
            return Err(FatalFault::StackOverflow { addr, region: region.name });
        }
        if !(region.kind.is_lazily_backed() || region.kind == RegionKind::Stack) {
            return Err(FatalFault::AddressNotAllowed { addr, region: Some(region.name) });
        }

        if rec.is_write() && rec.code.contains(FaultCode::PRESENT) {
            if let Some(t) = self.ptm.translate(addr) {
                let on_zero = Some(t.phys.page_base()) == self.ptm.zero_page();
                if !on_zero && !t.flags.contains(PageFlags::WRITABLE) {
                    return Err(FatalFault::WriteToReadOnly { addr, region: region.name });
                }
            }
        }

        if rec.is_write() {
            Ok((region, MapTarget::Allocate, PageFlags::WRITABLE))
        } else {
            Ok((region, MapTarget::ZeroPage, PageFlags::empty()))
        }
    }

    /// 致命 fault のダンプを `out` へ書く。以後の fault は FaultWhileUnwinding になる。
    pub fn report(
        &self,
        fatal: &FatalFault,
        rec: &FaultRecord,
        out: &mut dyn fmt::Write,
        symbols: &dyn SymbolLookup,
    ) -> fmt::Result {
        if matches!(fatal, FatalFault::OutOfFaultStacks { .. }) && !self.stacks.begin_exhaustion_report() {
            return Ok(());
        }
        let already_unwinding = self.unwinding.swap(true, Ordering::SeqCst);

        writeln!(out, "FATAL PAGE FAULT: {}", fatal)?;
        writeln!(
            out,
            "  addr={:#018x} err={:#x} ({} {}{})",
            rec.addr.0,
            rec.code.bits(),
            if rec.is_write() { "write" } else { "read" },
            if rec.code.contains(FaultCode::PRESENT) { "protection" } else { "not-present" },
            if rec.code.contains(FaultCode::INSTRUCTION) { " ifetch" } else { "" },
        )?;
        writeln!(
            out,
            "  rip={:#018x} rsp={:#018x} rbp={:#018x} rflags={:#x}",
            rec.rip, rec.rsp, rec.rbp, rec.rflags
        )?;
        match self.regions.find(rec.addr) {
            Some(r) => writeln!(out, "  region: {}", r)?,
            None => writeln!(out, "  region: none")?,
        }

        if already_unwinding || matches!(fatal, FatalFault::FaultWhileUnwinding { .. }) {
            return writeln!(out, "  (no stack trace: already unwinding)");
        }
        writeln!(out, "  stack trace:")?;
        unwind::write_trace(out, rec.rip, rec.rbp, self.ptm, symbols)
    }
}

#[cfg(test)]
impl From<crate::mm::sim::SimFault> for FaultRecord {
    fn from(f: crate::mm::sim::SimFault) -> Self {
        let mut code = FaultCode::empty();
        if f.write {
            code |= FaultCode::WRITE;
        }
        if f.present {
            code |= FaultCode::PRESENT;
        }
        FaultRecord::new(f.addr, code)
    }
}
