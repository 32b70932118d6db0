// kernel/src/mem/regions.rs
//
// 役割:
// - 64bit 仮想アドレス空間を「名前付き・種別付きの範囲（Region）」の並びとして管理する。
// - スレッドスタック、per-cpu 領域、IPC バッファなどの仮想範囲はすべてここから切り出す。
//
// やること:
// - init(): 固定ゾーン（null guard, image, Free, device, non-canonical, heap, page-table 窓）をアドレス順に作る
// - alloc(): Free の先頭を align して前詰めで切り出し、末尾に追加する
// - find(): アドレスを含む Region を線形探索で返す（fault 経路で使う）
//
// やらないこと:
// - Region の解放（単調に増えるだけのアリーナ）
// - 物理ページの割り当て（demand paging は fault 経路が行う）
//
// 設計方針:
// - Region は Copy な値。表全体は 1 本の spin::Mutex で守る
// - 固定長配列で持つ（ヒープに依存しない）
// - Free 以外の Region 同士は決して重ならない

use core::fmt;

use spin::{Mutex, Once};

use crate::gc::GcHooks;
use crate::logging;
use crate::mem::addr::{align_up, VirtAddr, PAGE_SIZE};
use crate::mem::layout;

pub const MAX_REGIONS: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionKind {
    Image,
    Heap,
    PageTableWindow,
    Stack,
    PerCpuScratch,
    SseState,
    IpcBuffer,
    ModuleSection,
    DeviceMmio,
    Free,
    NonCanonical,
    Other,
}

impl RegionKind {
    /// 初回アクセス時に物理ページを割り当ててよい種別
    pub const fn is_lazily_backed(self) -> bool {
        matches!(
            self,
            RegionKind::Heap
                | RegionKind::PerCpuScratch
                | RegionKind::SseState
                | RegionKind::IpcBuffer
                | RegionKind::ModuleSection
        )
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            RegionKind::Image => "Image",
            RegionKind::Heap => "Heap",
            RegionKind::PageTableWindow => "PageTableWindow",
            RegionKind::Stack => "Stack",
            RegionKind::PerCpuScratch => "PerCpuScratch",
            RegionKind::SseState => "SseState",
            RegionKind::IpcBuffer => "IpcBuffer",
            RegionKind::ModuleSection => "ModuleSection",
            RegionKind::DeviceMmio => "DeviceMmio",
            RegionKind::Free => "Free",
            RegionKind::NonCanonical => "NonCanonical",
            RegionKind::Other => "Other",
        }
    }
}

/// 仮想アドレス範囲 [start, start + length)
///
/// `length` は guard を含む。guard は先頭側 `[start, start + guard_length)` に置かれ、
/// 決してマップされない（Stack ならここへの fault は overflow）。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    pub start: VirtAddr,
    pub length: u64,
    pub guard_length: u64,
    pub kind: RegionKind,
    pub name: &'static str,
    /// 0 = どの CPU でもよい
    pub cpu_affinity: u32,
}

impl Region {
    const fn fixed(start: u64, length: u64, kind: RegionKind, name: &'static str) -> Self {
        Region {
            start: VirtAddr(start),
            length,
            guard_length: 0,
            kind,
            name,
            cpu_affinity: 0,
        }
    }

    /// 排他的な終端（アドレス空間末尾まで届く Region では 0 に巻き戻る）
    pub const fn end(&self) -> u64 {
        self.start.0.wrapping_add(self.length)
    }

    pub const fn contains(&self, addr: VirtAddr) -> bool {
        addr.0 >= self.start.0 && addr.0 - self.start.0 < self.length
    }

    /// guard 範囲に入っているか（contains が前提）
    pub const fn in_guard(&self, addr: VirtAddr) -> bool {
        self.contains(addr) && addr.0 - self.start.0 < self.guard_length
    }

    /// guard を除いた使用可能部分の先頭
    pub const fn usable_start(&self) -> VirtAddr {
        VirtAddr(self.start.0 + self.guard_length)
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<16} {:<15} start={:#018x} len={:#x} guard={:#x}",
            self.name,
            self.kind.as_str(),
            self.start.0,
            self.length,
            self.guard_length
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionError {
    /// Free に収まらない
    OutOfAddressSpace { requested: u64, available: u64 },
    /// 表が満杯
    TableFull,
    /// align が 2 の冪でない
    BadAlignment,
}

impl fmt::Display for RegionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegionError::OutOfAddressSpace { requested, available } => write!(
                f,
                "out of virtual address space (requested {:#x}, available {:#x})",
                requested, available
            ),
            RegionError::TableFull => write!(f, "region table full"),
            RegionError::BadAlignment => write!(f, "alignment is not a power of two"),
        }
    }
}

/// 挿入順（= アドレス空間上の論理順）に並んだ Region 列
struct RegionList {
    slots: [Option<Region>; MAX_REGIONS],
    len: usize,
    free_idx: Option<usize>,
}

impl RegionList {
    const fn new() -> Self {
        RegionList {
            slots: [None; MAX_REGIONS],
            len: 0,
            free_idx: None,
        }
    }

    fn push(&mut self, region: Region) -> Result<usize, RegionError> {
        if self.len >= MAX_REGIONS {
            return Err(RegionError::TableFull);
        }
        let idx = self.len;
        self.slots[idx] = Some(region);
        self.len += 1;
        if region.kind == RegionKind::Free {
            self.free_idx = Some(idx);
        }
        Ok(idx)
    }

    fn iter(&self) -> impl Iterator<Item = &Region> {
        self.slots[..self.len].iter().flatten()
    }
}

pub struct RegionTable {
    inner: Mutex<RegionList>,
    gc: Once<&'static dyn GcHooks>,
}

impl RegionTable {
    pub const fn new() -> Self {
        RegionTable {
            inner: Mutex::new(RegionList::new()),
            gc: Once::new(),
        }
    }

    /// root 登録先の GC を 1 度だけ設定する
    pub fn set_gc_hooks(&self, hooks: &'static dyn GcHooks) {
        self.gc.call_once(|| hooks);
    }

    /// 固定ゾーンをアドレス順に作る。既存の内容は捨てる。
    pub fn init(&self, image_base: VirtAddr, image_length: u64) -> Result<(), RegionError> {
        let mut list = self.inner.lock();
        *list = RegionList::new();

        if image_base.0 != 0 {
            let len = core::cmp::min(layout::NULL_GUARD_MAX, image_base.0);
            list.push(Region::fixed(0, len, RegionKind::NonCanonical, "null"))?;
        }

        list.push(Region::fixed(image_base.0, image_length, RegionKind::Image, "image"))?;

        let image_end = image_base.0.saturating_add(image_length);
        let free_start = align_up(image_end, PAGE_SIZE).unwrap_or(layout::FREE_END);
        let free_len = layout::FREE_END.saturating_sub(free_start);
        list.push(Region::fixed(free_start, free_len, RegionKind::Free, "free"))?;

        list.push(Region::fixed(
            layout::DEVICES_START,
            layout::DEVICES_LENGTH,
            RegionKind::DeviceMmio,
            "devices",
        ))?;
        list.push(Region::fixed(
            layout::NONCANONICAL_START,
            layout::NONCANONICAL_LENGTH,
            RegionKind::NonCanonical,
            "noncanonical",
        ))?;
        list.push(Region::fixed(layout::HEAP_START, layout::HEAP_LENGTH, RegionKind::Heap, "heap"))?;
        list.push(Region::fixed(
            layout::PAGE_TABLES_START,
            layout::PAGE_TABLES_LENGTH,
            RegionKind::PageTableWindow,
            "page tables",
        ))?;

        Ok(())
    }

    /// Free の先頭から `length + guard_length` を切り出す。
    ///
    /// 返す Region の `length` は guard 込み。`gc_roots` なら guard を除いた範囲を GC に登録する。
    pub fn alloc(
        &self,
        length: u64,
        align: u64,
        name: &'static str,
        guard_length: u64,
        kind: RegionKind,
        gc_roots: bool,
    ) -> Result<Region, RegionError> {
        if align == 0 || !align.is_power_of_two() {
            return Err(RegionError::BadAlignment);
        }

        let region = {
            let mut list = self.inner.lock();
            let result = Self::carve(&mut list, length, align, name, guard_length, kind);
            drop(list);

            match result {
                Ok(r) => r,
                Err(e) => {
                    logging::error_fmt(format_args!("mem::regions::alloc: {} failed: {}", name, e));
                    return Err(e);
                }
            }
        };

        if gc_roots {
            if let Some(gc) = self.gc.get() {
                gc.add_roots(region.usable_start(), VirtAddr(region.end()));
            }
        }

        Ok(region)
    }

    fn carve(
        list: &mut RegionList,
        length: u64,
        align: u64,
        name: &'static str,
        guard_length: u64,
        kind: RegionKind,
    ) -> Result<Region, RegionError> {
        let free_idx = list.free_idx.ok_or(RegionError::OutOfAddressSpace {
            requested: length,
            available: 0,
        })?;
        let free = list.slots[free_idx].ok_or(RegionError::OutOfAddressSpace {
            requested: length,
            available: 0,
        })?;
        let free_end = free.end();

        let total = length.checked_add(guard_length);
        let start = align_up(free.start.0, align);
        let (start, total) = match (start, total) {
            (Some(s), Some(t)) if length != 0 && s <= free_end => (s, t),
            _ => {
                return Err(RegionError::OutOfAddressSpace {
                    requested: length.saturating_add(guard_length),
                    available: 0,
                })
            }
        };

        let available = free_end - start;
        if total > available {
            return Err(RegionError::OutOfAddressSpace { requested: total, available });
        }

        if list.len >= MAX_REGIONS {
            return Err(RegionError::TableFull);
        }

        let region = Region {
            start: VirtAddr(start),
            length: total,
            guard_length,
            kind,
            name,
            cpu_affinity: 0,
        };

        let new_free_start = start + total;
        list.slots[free_idx] = Some(Region {
            start: VirtAddr(new_free_start),
            length: free_end - new_free_start,
            ..free
        });
        list.push(region)?;

        Ok(region)
    }

    /// 種別 Other・guard 無しで確保して先頭アドレスだけ返す
    pub fn alloc_address(&self, length: u64, align: u64, name: &'static str) -> Result<VirtAddr, RegionError> {
        self.alloc(length, align, name, 0, RegionKind::Other, false)
            .map(|r| r.start)
    }

    /// `addr` を含む Region（list 順で最初に見つかったもの）
    pub fn find(&self, addr: VirtAddr) -> Option<Region> {
        self.inner.lock().iter().find(|r| r.contains(addr)).copied()
    }

    pub fn heap(&self) -> Option<Region> {
        self.inner
            .lock()
            .iter()
            .find(|r| r.kind == RegionKind::Heap)
            .copied()
    }

    pub fn free_region(&self) -> Option<Region> {
        let list = self.inner.lock();
        list.free_idx.and_then(|i| list.slots[i])
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// list 順に走査する（ロックを持ったまま f を呼ぶので f から表を触らないこと）
    pub fn for_each(&self, mut f: impl FnMut(&Region)) {
        for r in self.inner.lock().iter() {
            f(r);
        }
    }

    pub fn dump(&self) {
        logging::info("mem::regions::dump: start");
        self.for_each(|r| logging::info_fmt(format_args!("  {}", r)));
        logging::info("mem::regions::dump: end");
    }
}

impl Default for RegionTable {
    fn default() -> Self {
        Self::new()
    }
}
