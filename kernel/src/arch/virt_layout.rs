// kernel/src/arch/virt_layout.rs
//
// 役割:
// - 再帰マッピング（PML4[511] が PML4 自身を指す）で作られる
//   「ページテーブル窓」の仮想アドレス計算を行う純粋関数を提供する。
//
// やること:
// - 各 level のエントリが窓のどこに見えるかの計算
// - あるエントリが指す下位テーブル（または葉ページ）が窓のどこに見えるかの計算
//
// やらないこと:
// - ページテーブルを触る（arch::paging 側の責務）
//
// 設計方針:
// - ここは「アドレス計算だけ」に限定し、副作用を持たせない
// - 窓の base は PML4 スロット境界であれば任意（index はそこから導く）

use crate::mem::addr::VirtAddr;

/// 1つの PML4 エントリがカバーする仮想アドレス範囲（512GiB）
pub const PML4_SLOT_SIZE: u64 = 1u64 << 39;

/// 自己参照に使う PML4 index
pub const RECURSIVE_INDEX: usize = 511;

/// 再帰窓の開始アドレス（PML4 index 511）
pub const PAGE_TABLE_WINDOW_BASE: u64 = pml4_index_base_addr(RECURSIVE_INDEX);

/// 指定アドレスの PML4 index（bits 47..39）
#[inline(always)]
pub const fn pml4_index(addr: u64) -> usize {
    ((addr >> 39) & 0x1ff) as usize
}

/// PML4 index の開始アドレス（slot の base, canonical）
#[inline(always)]
pub const fn pml4_index_base_addr(index: usize) -> u64 {
    VirtAddr((index as u64) << 39).canonical().0
}

/// 再帰窓の幾何。base から自己参照 index を導き、各 level の表の先頭を求める。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowGeometry {
    base: u64,
    r: u64,
}

impl WindowGeometry {
    pub const fn new(base: u64) -> Self {
        let r = pml4_index(base);
        WindowGeometry {
            base: pml4_index_base_addr(r),
            r: r as u64,
        }
    }

    pub const fn base(&self) -> u64 {
        self.base
    }

    pub const fn recursive_index(&self) -> usize {
        self.r as usize
    }

    /// level のエントリ配列が窓内で始まるアドレス
    /// - level 1 (PT) : base
    /// - level 2 (PD) : base + r<<30
    /// - level 3 (PDPT): base + r<<30 + r<<21
    /// - level 4 (PML4): base + r<<30 + r<<21 + r<<12
    pub const fn level_base(&self, level: u8) -> u64 {
        let r = self.r;
        match level {
            1 => self.base,
            2 => self.base | (r << 30),
            3 => self.base | (r << 30) | (r << 21),
            _ => self.base | (r << 30) | (r << 21) | (r << 12),
        }
    }

    /// `va` を解決する level のエントリが見える仮想アドレス
    pub const fn entry_addr(&self, level: u8, va: VirtAddr) -> VirtAddr {
        let shift = 12 + 9 * (level as u64 - 1);
        VirtAddr(self.level_base(level) + ((va.low48() >> shift) << 3))
    }

    /// level のエントリが指す先（level-1 の表, level 1 なら葉ページ自体）が見える仮想アドレス
    pub const fn child_addr(&self, level: u8, va: VirtAddr) -> VirtAddr {
        if level <= 1 {
            return va.page_base();
        }
        VirtAddr(self.entry_addr(level - 1, va).0 & !0xfff)
    }

    pub const fn contains(&self, va: VirtAddr) -> bool {
        va.0 >= self.base && va.0 - self.base < PML4_SLOT_SIZE
    }
}
