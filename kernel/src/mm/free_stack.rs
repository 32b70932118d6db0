// kernel/src/mm/free_stack.rs
//
// 空きページ自身の先頭 8byte に「次の空きページの物理アドレス」を書いて繋ぐスタック。
//
// - 中身を読む/書くには、そのページがどこかの仮想アドレスにマップされている必要がある。
// - push は populate 側が scratch ページにマップしてから呼ぶ。
// - pop は 2 段階（PageOffer 参照）。呼び出し側が目的の仮想アドレスへマップした後で
//   commit_pop に「どこに見えているか」を渡し、そこから次のリンクを読む。
// - リンク値 0 は終端（0 番地のページは必ずビットマップ側なのでここには来ない）。

use crate::arch::paging::MemoryBus;
use crate::mem::addr::{PhysAddr, VirtAddr};

pub struct FreeStack {
    head: Option<PhysAddr>,
    depth: u64,
}

impl FreeStack {
    pub const fn new() -> Self {
        FreeStack { head: None, depth: 0 }
    }

    pub fn head(&self) -> Option<PhysAddr> {
        self.head
    }

    pub fn depth(&self) -> u64 {
        self.depth
    }

    /// `page` を積む。
    ///
    /// # Safety
    /// `page` の先頭が `mapped_at` に書き込み可能でマップされていること
    pub unsafe fn push_mapped(&mut self, page: PhysAddr, mapped_at: VirtAddr, bus: &dyn MemoryBus) {
        let link = self.head.map_or(0, |p| p.0);
        bus.write_u64(mapped_at.page_base(), link);
        self.head = Some(page);
        self.depth += 1;
    }

    /// 先頭を外す。外したページ（= 直前の head）を返す。
    ///
    /// # Safety
    /// 現在の head が `mapped_at` にマップされていること
    pub unsafe fn commit_pop(&mut self, mapped_at: VirtAddr, bus: &dyn MemoryBus) -> Option<PhysAddr> {
        let taken = self.head?;
        let next = bus.read_u64(mapped_at.page_base());
        self.head = if next == 0 { None } else { Some(PhysAddr(next)) };
        self.depth -= 1;
        Some(taken)
    }
}

impl Default for FreeStack {
    fn default() -> Self {
        Self::new()
    }
}
