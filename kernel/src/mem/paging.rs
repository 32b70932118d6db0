// kernel/src/mem/paging.rs
//
// 役割:
// - x86_64 4段ページテーブルのエントリ表現（ビット定義と物理アドレス部）を定義する。
// - map 要求の「何を貼るか」（具体フレーム / 新規確保 / 共有ゼロページ）を型で表す。
//
// やらないこと:
// - エントリのメモリ上の位置計算（arch::paging::PageTableView）
// - テーブル構築（mm::page_table）

use crate::mem::addr::PhysAddr;

bitflags::bitflags! {
    /// ページテーブルエントリの属性ビット
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        const HUGE = 1 << 7;
        const GLOBAL = 1 << 8;
        const NO_EXEC = 1 << 63;
    }
}

/// エントリ内の物理アドレス部（bits 12..51）
pub const ENTRY_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

/// 上位テーブルを指すエントリは常に present + writable で作る
pub const TABLE_FLAGS: PageFlags = PageFlags::PRESENT.union(PageFlags::WRITABLE);

/// 1 エントリ（64bit）
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct PageTableEntry(pub u64);

impl PageTableEntry {
    pub const fn empty() -> Self {
        PageTableEntry(0)
    }

    pub fn new(phys: PhysAddr, flags: PageFlags) -> Self {
        PageTableEntry((phys.as_u64() & ENTRY_ADDR_MASK) | flags.bits())
    }

    pub fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0)
    }

    pub fn is_present(self) -> bool {
        self.flags().contains(PageFlags::PRESENT)
    }

    pub fn is_writable(self) -> bool {
        self.flags().contains(PageFlags::WRITABLE)
    }

    pub fn addr(self) -> PhysAddr {
        PhysAddr(self.0 & ENTRY_ADDR_MASK)
    }
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "PageTableEntry({:#x}, {:?})", self.addr().as_u64(), self.flags())
    }
}

/// map で貼る物理ページの指定
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapTarget {
    /// この物理フレームをそのまま貼る
    Frame(PhysAddr),
    /// 物理ページを新しく確保して貼る（既存マップがあれば再利用する場合あり）
    Allocate,
    /// 共有ゼロページを貼る（フレームを消費しない）
    ZeroPage,
}

/// map 要求で呼び出し側が指定できる属性
pub const REQUEST_FLAGS: PageFlags = PageFlags::WRITABLE
    .union(PageFlags::WRITE_THROUGH)
    .union(PageFlags::CACHE_DISABLE);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_keeps_address_and_flags_apart() {
        let e = PageTableEntry::new(PhysAddr(0x1234_5000), PageFlags::PRESENT | PageFlags::CACHE_DISABLE);
        assert_eq!(e.0, 0x1234_5011);
        assert_eq!(e.addr(), PhysAddr(0x1234_5000));
        assert!(e.is_present());
        assert!(!e.is_writable());
    }

    #[test]
    fn unaligned_physical_bits_are_dropped() {
        let e = PageTableEntry::new(PhysAddr(0x2fff), TABLE_FLAGS);
        assert_eq!(e.addr(), PhysAddr(0x2000));
        assert_eq!(e.flags(), TABLE_FLAGS);
    }
}
