/*!
 * types
 *
 * 役割:
 *   - ブートローダのメモリマップを、カーネル内部で扱う素朴な形に落とす。
 *
 * やること:
 *   - PhysRange: 空き物理範囲 [start, start+length)
 *   - MemoryRegionType: 範囲の種別（Usable 以外は Pmem に渡さない）
 *
 * やらないこと:
 *   - ページ単位の確保/解放（mm::pmem の責務）
 */

use core::fmt;

use crate::mem::addr::{align_down, align_up, PhysAddr, PAGE_SIZE};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryRegionType {
    Usable,
    Reserved,
    Other,
}

impl fmt::Display for MemoryRegionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryRegionType::Usable => write!(f, "Usable"),
            MemoryRegionType::Reserved => write!(f, "Reserved"),
            MemoryRegionType::Other => write!(f, "Other"),
        }
    }
}

/// 物理アドレス範囲
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhysRange {
    pub start: PhysAddr,
    pub length: u64,
    pub region_type: MemoryRegionType,
}

impl PhysRange {
    pub const fn new(start: PhysAddr, length: u64) -> Self {
        PhysRange {
            start,
            length,
            region_type: MemoryRegionType::Usable,
        }
    }

    pub fn with_type(mut self, region_type: MemoryRegionType) -> Self {
        self.region_type = region_type;
        self
    }

    /// 排他的終端（溢れたら u64::MAX で止める）
    pub fn end(&self) -> PhysAddr {
        PhysAddr(self.start.0.saturating_add(self.length))
    }

    pub fn is_usable(&self) -> bool {
        self.region_type == MemoryRegionType::Usable
    }

    /// 範囲に完全に含まれるページの先頭を順に返す
    pub fn pages(&self) -> impl Iterator<Item = PhysAddr> {
        let first = align_up(self.start.0, PAGE_SIZE).unwrap_or(u64::MAX);
        let last = align_down(self.end().0, PAGE_SIZE);
        let count = if last > first { (last - first) / PAGE_SIZE } else { 0 };
        (0..count).map(move |i| PhysAddr(first + i * PAGE_SIZE))
    }
}

impl fmt::Display for PhysRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#x}..{:#x} ({})",
            self.start.0,
            self.end().0,
            self.region_type
        )
    }
}
