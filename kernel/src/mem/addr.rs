// src/mem/addr.rs
//
// 役割:
// - 物理アドレス / 仮想アドレスに型を付け、取り違えをコンパイル時に防ぐ。
// やること:
// - ページ境界への切り上げ/切り捨て、48bit canonical 化、4段ページテーブルの index 抽出。
// やらないこと:
// - ページテーブルの読み書き（それは arch::paging の PageTableView の責務）。

use core::fmt;

/// ページサイズ（4KiB 固定）
pub const PAGE_SIZE: u64 = 0x1000;

/// 実装されている仮想アドレス幅
pub const VIRT_ADDR_BITS: u32 = 48;

const VIRT_ADDR_MASK: u64 = (1u64 << VIRT_ADDR_BITS) - 1;

/// 物理アドレス（バイト単位）
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct PhysAddr(pub u64);

/// 仮想アドレス（バイト単位）
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct VirtAddr(pub u64);

/// `value` を `align`（2 の冪）へ切り上げる。溢れたら None。
#[inline]
pub const fn align_up(value: u64, align: u64) -> Option<u64> {
    let mask = align - 1;
    match value.checked_add(mask) {
        Some(v) => Some(v & !mask),
        None => None,
    }
}

#[inline]
pub const fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}

impl PhysAddr {
    pub const fn new(addr: u64) -> Self {
        PhysAddr(addr)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// 下位ビットを切り捨てて、ページ境界に揃える。
    pub const fn page_base(self) -> PhysAddr {
        PhysAddr(align_down(self.0, PAGE_SIZE))
    }

    pub const fn add(self, offset: u64) -> PhysAddr {
        PhysAddr(self.0.wrapping_add(offset))
    }
}

impl VirtAddr {
    pub const fn new(addr: u64) -> Self {
        VirtAddr(addr)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// 48bit canonical への正規化（bit47 を sign-extend）
    pub const fn canonical(self) -> VirtAddr {
        let sign_bit = 1u64 << (VIRT_ADDR_BITS - 1);
        if self.0 & sign_bit != 0 {
            VirtAddr(self.0 | !VIRT_ADDR_MASK)
        } else {
            VirtAddr(self.0 & VIRT_ADDR_MASK)
        }
    }

    pub const fn is_canonical(self) -> bool {
        self.canonical().0 == self.0
    }

    /// 上位 16bit を落とした 48bit 値（テーブル index 計算用）
    pub const fn low48(self) -> u64 {
        self.0 & VIRT_ADDR_MASK
    }

    /// 下位ビットを切り捨てて、ページ境界に揃える。
    pub const fn page_base(self) -> VirtAddr {
        VirtAddr(align_down(self.0, PAGE_SIZE))
    }

    pub const fn page_offset(self) -> u64 {
        self.0 & (PAGE_SIZE - 1)
    }

    pub const fn add(self, offset: u64) -> VirtAddr {
        VirtAddr(self.0.wrapping_add(offset))
    }

    /// level 4 = PML4, 3 = PDPT, 2 = PD, 1 = PT
    pub const fn table_index(self, level: u8) -> usize {
        ((self.low48() >> (12 + 9 * (level as u64 - 1))) & 0x1ff) as usize
    }
}

// --- Debug / Display（ログで見やすくするため 0x... 形式） ---

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_sign_extends_bit_47() {
        assert_eq!(VirtAddr(0x0000_8000_0000_0000).canonical().0, 0xffff_8000_0000_0000);
        assert_eq!(VirtAddr(0x1234_7fff_ffff_f000).canonical().0, 0x0000_7fff_ffff_f000);
        assert!(VirtAddr(0xffff_ff80_0000_0000).is_canonical());
        assert!(!VirtAddr(0x0000_8000_0000_0000).is_canonical());
    }

    #[test]
    fn table_indices_split_the_48_bit_address() {
        let va = VirtAddr(0xffff_ff80_4020_1000);
        assert_eq!(va.table_index(4), 511);
        assert_eq!(va.table_index(3), 1);
        assert_eq!(va.table_index(2), 1);
        assert_eq!(va.table_index(1), 1);
    }

    #[test]
    fn align_up_rejects_overflow() {
        assert_eq!(align_up(0x1001, 0x1000), Some(0x2000));
        assert_eq!(align_up(0x2000, 0x1000), Some(0x2000));
        assert_eq!(align_up(u64::MAX, 0x1000), None);
    }
}
