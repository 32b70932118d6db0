// src/mm/mod.rs
//
// 物理メモリ管理とページテーブル管理の入り口。
// - PhysicalPageSource: 物理ページを 1 枚ずつ配る/受け取る抽象（2 段階確保つき）
// - Pmem: 既定の実装（低位ビットマップ + 空きページ内リンクのスタック）
// - TwoTierSource: 小ページ/2MiB ブロックの 2 段リングによる別方式
// - PageTableManager: 4段テーブルの構築と 1 ページの map / is_mapped
//
// 2 段階確保の流れ:
//   let offer = pages.begin_alloc()?;       // スタック由来ならロックを持ったまま
//   ...offer.addr() を目的の仮想アドレスにマップ...
//   unsafe { pages.end_alloc(offer, va, bus) }  // va 越しに次リンクを読んでロック解放

pub mod bitmap;
pub mod free_stack;
pub mod page_table;
pub mod pmem;
pub mod populate;
pub mod two_tier;

#[cfg(test)]
pub(crate) mod sim;
#[cfg(test)]
mod tests_prop;

use core::fmt;

use spin::MutexGuard;

use crate::arch::paging::MemoryBus;
use crate::kernel::event::EventId;
use crate::mem::addr::{PhysAddr, VirtAddr};

use self::free_stack::FreeStack;

pub use self::page_table::{MapError, PageTableManager, Translation};
pub use self::pmem::Pmem;
pub use self::two_tier::TwoTierSource;
pub use crate::types::PhysRange;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocError {
    /// 今は無いが、このイベントが立てば補充されている
    WouldBlock(EventId),
    /// 補充の見込みがない
    Exhausted,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::WouldBlock(ev) => write!(f, "no free page yet (wait on event {})", ev.0),
            AllocError::Exhausted => write!(f, "out of physical memory"),
        }
    }
}

/// begin_alloc が差し出した候補ページ。
///
/// スタック由来のときは FreeStack のロックを抱えたままなので、
/// commit されるまで他の CPU は同じページを受け取れない。
#[must_use = "an offered page must be committed with end_alloc"]
pub struct PageOffer<'a> {
    phys: PhysAddr,
    link: Option<MutexGuard<'a, FreeStack>>,
}

impl<'a> PageOffer<'a> {
    /// 中身を読まずに確定できるページ（ビットマップ由来など）
    pub fn immediate(phys: PhysAddr) -> Self {
        PageOffer { phys, link: None }
    }

    pub(crate) fn linked(phys: PhysAddr, guard: MutexGuard<'a, FreeStack>) -> Self {
        PageOffer { phys, link: Some(guard) }
    }

    pub fn addr(&self) -> PhysAddr {
        self.phys
    }

    /// commit 時にページの中身（次リンク）を読む必要があるか
    pub fn is_linked(&self) -> bool {
        self.link.is_some()
    }

    /// # Safety
    /// `self.addr()` のページが `mapped_at` に読めるようマップされていること
    pub unsafe fn commit(self, mapped_at: VirtAddr, bus: &dyn MemoryBus) -> PhysAddr {
        let PageOffer { phys, link } = self;
        if let Some(mut stack) = link {
            let _ = stack.commit_pop(mapped_at, bus);
        }
        phys
    }
}

impl fmt::Debug for PageOffer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageOffer")
            .field("phys", &self.phys)
            .field("linked", &self.link.is_some())
            .finish()
    }
}

/// 物理ページの供給元
pub trait PhysicalPageSource {
    /// 候補ページを 1 枚差し出す
    fn begin_alloc(&self) -> Result<PageOffer<'_>, AllocError>;

    /// 候補ページを確定する
    ///
    /// # Safety
    /// `offer.addr()` が `mapped_at` にマップ済みであること
    unsafe fn end_alloc(&self, offer: PageOffer<'_>, mapped_at: VirtAddr, bus: &dyn MemoryBus) -> PhysAddr {
        offer.commit(mapped_at, bus)
    }

    fn release(&self, phys: PhysAddr);

    fn mark_used(&self, phys: PhysAddr);

    /// いま空いているページ数
    fn free_pages(&self) -> u64;
}
