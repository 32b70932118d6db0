// kernel/src/mm/page_table.rs
//
// 役割:
// - 4段ページテーブルを再帰窓越しに辿り、足りない段を作り、葉に 1 ページを貼る。
//
// やること:
// - map(): Frame / Allocate / ZeroPage の 3 通りで葉を決める
//   - Allocate: 既に貼ってあり「ゼロページでない」か「読み取り専用要求」なら再利用
//               （読みで貼ったゼロページは、書き込み要求が来たときだけ私有ページに差し替わる）
//   - ZeroPage: 共有ゼロページ（初回要求時に作る）。既に葉があればそれを返す
// - is_mapped() / translate() / peek_u64(): present ビットだけを見て辿る（unwinder 用）
// - 上位段の新設と葉の張り替えでは、そのアドレス 1 つだけを invalidate する
//
// やらないこと:
// - 上位段の撤去（一度作った段は残す）
// - 複数 CPU への TLB shootdown
//
// 設計方針:
// - 自分ではロックを持たない。PhysicalPageSource を呼ぶ間に何も握らない
// - 上位段は葉より先にすべて作るので、同時に外に出ている PageOffer は常に 1 つ
// - huge ページ（bootloader の物理メモリ全域マップ）はその段で「マップ済み」とみなす

use core::fmt;

use spin::Once;

use crate::arch::paging::{MemoryBus, PageTableView};
use crate::kernel::event::EventId;
use crate::mem::addr::{PhysAddr, VirtAddr};
use crate::mem::paging::{MapTarget, PageFlags, PageTableEntry, REQUEST_FLAGS, TABLE_FLAGS};

use super::{AllocError, PhysicalPageSource};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapError {
    /// 物理ページ待ち。イベントが立ったらやり直す
    WouldBlock(EventId),
    OutOfMemory,
}

impl From<AllocError> for MapError {
    fn from(e: AllocError) -> Self {
        match e {
            AllocError::WouldBlock(ev) => MapError::WouldBlock(ev),
            AllocError::Exhausted => MapError::OutOfMemory,
        }
    }
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapError::WouldBlock(ev) => write!(f, "page table map must wait for event {}", ev.0),
            MapError::OutOfMemory => write!(f, "page table map: out of physical memory"),
        }
    }
}

/// 翻訳結果（phys はページ内オフセット込み）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Translation {
    pub phys: PhysAddr,
    pub flags: PageFlags,
}

const HUGE_1G_MASK: u64 = 0x000f_ffff_c000_0000;
const HUGE_2M_MASK: u64 = 0x000f_ffff_ffe0_0000;

pub struct PageTableManager<'a, B: MemoryBus, S: PhysicalPageSource> {
    view: PageTableView<'a, B>,
    pages: &'a S,
    zero_page: Once<PhysAddr>,
}

impl<'a, B: MemoryBus, S: PhysicalPageSource> PageTableManager<'a, B, S> {
    pub fn new(view: PageTableView<'a, B>, pages: &'a S) -> Self {
        PageTableManager {
            view,
            pages,
            zero_page: Once::new(),
        }
    }

    pub fn view(&self) -> &PageTableView<'a, B> {
        &self.view
    }

    pub fn pages(&self) -> &'a S {
        self.pages
    }

    pub fn zero_page(&self) -> Option<PhysAddr> {
        self.zero_page.get().copied()
    }

    /// 共有ゼロページを作る。`scratch` は一時的に使う空き仮想ページ（終わったら外す）。
    pub fn bootstrap(&self, scratch: VirtAddr) -> Result<PhysAddr, MapError> {
        if let Some(z) = self.zero_page() {
            return Ok(z);
        }
        let z = self.map(scratch, MapTarget::ZeroPage, PageFlags::empty())?;
        self.unmap(scratch);
        Ok(z)
    }

    /// `va` を含むページに 1 枚貼る。戻り値は貼られている物理ページ。
    ///
    /// `flags` のうち WRITABLE / WRITE_THROUGH / CACHE_DISABLE だけを使う（PRESENT は常に付く）。
    pub fn map(&self, va: VirtAddr, target: MapTarget, flags: PageFlags) -> Result<PhysAddr, MapError> {
        let va = va.canonical().page_base();
        let flags = (flags & REQUEST_FLAGS) | PageFlags::PRESENT;

        for level in [4u8, 3, 2] {
            let e = self.view.read_entry(level, va);
            if !e.is_present() {
                self.build_table(level, va)?;
            } else if level < 4 && e.flags().contains(PageFlags::HUGE) {
                return Ok(Self::huge_base(level, e));
            }
        }

        let current = self.view.read_entry(1, va);
        match target {
            MapTarget::Frame(phys) => {
                let phys = phys.page_base();
                self.install_leaf(va, PageTableEntry::new(phys, flags));
                Ok(phys)
            }
            MapTarget::Allocate => {
                let on_zero = current.is_present() && Some(current.addr()) == self.zero_page();
                if current.is_present() && (!on_zero || !flags.contains(PageFlags::WRITABLE)) {
                    return Ok(current.addr());
                }
                self.install_fresh(va, flags)
            }
            MapTarget::ZeroPage => {
                if current.is_present() {
                    return Ok(current.addr());
                }
                // 共有ページなので書き込みは常に fault させる
                let flags = flags - PageFlags::WRITABLE;
                match self.zero_page() {
                    Some(z) => {
                        self.install_leaf(va, PageTableEntry::new(z, flags));
                        Ok(z)
                    }
                    None => {
                        let z = self.install_fresh(va, flags)?;
                        self.zero_page.call_once(|| z);
                        Ok(z)
                    }
                }
            }
        }
    }

    /// 葉だけを外す（上位段は残す）。外した物理ページを返す。
    pub fn unmap(&self, va: VirtAddr) -> Option<PhysAddr> {
        let va = va.canonical().page_base();
        match self.walk(va) {
            Some((1, e)) => {
                self.install_leaf(va, PageTableEntry::empty());
                Some(e.addr())
            }
            _ => None,
        }
    }

    pub fn is_mapped(&self, va: VirtAddr) -> bool {
        self.walk(va).is_some()
    }

    pub fn translate(&self, va: VirtAddr) -> Option<Translation> {
        let (level, e) = self.walk(va)?;
        let phys = match level {
            3 => PhysAddr((e.0 & HUGE_1G_MASK) + (va.0 & 0x3fff_ffff)),
            2 => PhysAddr((e.0 & HUGE_2M_MASK) + (va.0 & 0x1f_ffff)),
            _ => e.addr().add(va.page_offset()),
        };
        Some(Translation { phys, flags: e.flags() })
    }

    /// マップ済みで 8byte 境界なら読む
    pub fn peek_u64(&self, va: VirtAddr) -> Option<u64> {
        if va.0 % 8 != 0 || !self.is_mapped(va) {
            return None;
        }
        // Safety: 直前に present を確認した
        Some(unsafe { self.view.bus().read_u64(va) })
    }

    /// 終端のエントリ（葉、または huge の段）と、その段
    fn walk(&self, va: VirtAddr) -> Option<(u8, PageTableEntry)> {
        if !va.is_canonical() {
            return None;
        }
        for level in (1..=4u8).rev() {
            let e = self.view.read_entry(level, va);
            if !e.is_present() {
                return None;
            }
            if level == 1 || (level < 4 && e.flags().contains(PageFlags::HUGE)) {
                return Some((level, e));
            }
        }
        None
    }

    fn huge_base(level: u8, e: PageTableEntry) -> PhysAddr {
        if level == 3 {
            PhysAddr(e.0 & HUGE_1G_MASK)
        } else {
            PhysAddr(e.0 & HUGE_2M_MASK)
        }
    }

    /// level のエントリが指す下位テーブルを新しく作る
    fn build_table(&self, level: u8, va: VirtAddr) -> Result<(), MapError> {
        let offer = self.pages.begin_alloc()?;
        let child = self.view.child_addr(level, va);

        self.view.write_entry(level, va, PageTableEntry::new(offer.addr(), TABLE_FLAGS));
        self.view.invalidate(child);

        // Safety: 新しいテーブルは直前のエントリで child に見えている
        let _ = unsafe { self.pages.end_alloc(offer, child, self.view.bus()) };
        self.view.clear_child_table(level, va);
        Ok(())
    }

    /// 新しい物理ページを葉に貼ってゼロで埋める
    fn install_fresh(&self, va: VirtAddr, flags: PageFlags) -> Result<PhysAddr, MapError> {
        let offer = self.pages.begin_alloc()?;
        let writable = flags | PageFlags::WRITABLE;

        self.install_leaf(va, PageTableEntry::new(offer.addr(), writable));

        // Safety: offer のページは va に書き込み可能で見えている
        let phys = unsafe { self.pages.end_alloc(offer, va, self.view.bus()) };
        unsafe { self.view.bus().zero_page(va) };

        if !flags.contains(PageFlags::WRITABLE) {
            self.install_leaf(va, PageTableEntry::new(phys, flags));
        }
        Ok(phys)
    }

    fn install_leaf(&self, va: VirtAddr, entry: PageTableEntry) {
        self.view.write_entry(1, va, entry);
        self.view.invalidate(va);
    }
}
