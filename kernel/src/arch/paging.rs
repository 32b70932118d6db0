// kernel/src/arch/paging.rs
//
// 役割:
// - ページテーブルを「普通のメモリ」として読み書きするための境界を提供する。
// - 生ポインタ演算と unsafe はこのファイルに閉じ込める。
//
// やること:
// - MemoryBus: 仮想アドレス経由の 64bit 読み書き・ページのゼロ埋め・単一アドレスの TLB 無効化
// - PageTableView: 再帰窓の base を受け取り、(level, va) のエントリを read_entry/write_entry で見せる
// - DirectBus（bare-metal のみ）: 実 CPU 上の volatile アクセス + invlpg
//
// やらないこと:
// - テーブルの構築やフレーム確保（mm::page_table の責務）
//
// 設計方針:
// - 呼び出し側に見えるのは read_entry / write_entry / clear_child_table / invalidate だけ
// - 窓のアドレス計算は arch::virt_layout::WindowGeometry に任せる

use crate::arch::virt_layout::WindowGeometry;
use crate::mem::addr::{VirtAddr, PAGE_SIZE};
use crate::mem::paging::PageTableEntry;

/// 仮想アドレス経由のメモリアクセス。
///
/// # Safety（実装側の約束）
/// - read/write/zero に渡される仮想アドレスは 8byte 境界で、呼び出し時点でマップ済みであること
pub trait MemoryBus {
    /// # Safety
    /// `va` が 8byte 境界かつマップ済みであること
    unsafe fn read_u64(&self, va: VirtAddr) -> u64;

    /// # Safety
    /// `va` が 8byte 境界かつ書き込み可能でマップ済みであること
    unsafe fn write_u64(&self, va: VirtAddr, value: u64);

    /// # Safety
    /// `page` から 1 ページがマップ済みで書き込み可能であること
    unsafe fn zero_page(&self, page: VirtAddr) {
        let base = page.page_base();
        let mut off = 0;
        while off < PAGE_SIZE {
            self.write_u64(base.add(off), 0);
            off += 8;
        }
    }

    /// `va` を含む 1 ページ分の翻訳だけを捨てる
    fn invalidate(&self, va: VirtAddr);
}

/// 再帰窓を通したページテーブルの見え方
pub struct PageTableView<'a, B: MemoryBus> {
    bus: &'a B,
    geometry: WindowGeometry,
}

impl<'a, B: MemoryBus> PageTableView<'a, B> {
    /// `window_base` の PML4 スロットが PML4 自身を指していること
    pub fn new(bus: &'a B, window_base: VirtAddr) -> Self {
        PageTableView {
            bus,
            geometry: WindowGeometry::new(window_base.0),
        }
    }

    pub fn bus(&self) -> &'a B {
        self.bus
    }

    pub fn geometry(&self) -> WindowGeometry {
        self.geometry
    }

    /// level のエントリを読む。level 4 は常に読めるが、それ以下は祖先が present であること。
    pub fn read_entry(&self, level: u8, va: VirtAddr) -> PageTableEntry {
        let at = self.geometry.entry_addr(level, va);
        // Safety: 祖先エントリが present なら、再帰窓上のこのアドレスはマップ済み
        PageTableEntry(unsafe { self.bus.read_u64(at) })
    }

    pub fn write_entry(&self, level: u8, va: VirtAddr, entry: PageTableEntry) {
        let at = self.geometry.entry_addr(level, va);
        // Safety: read_entry と同じ。上位テーブルは常に writable で作る
        unsafe { self.bus.write_u64(at, entry.0) }
    }

    /// level のエントリが指す先（下位テーブル / 葉ページ）が見える仮想アドレス
    pub fn child_addr(&self, level: u8, va: VirtAddr) -> VirtAddr {
        self.geometry.child_addr(level, va)
    }

    /// level のエントリが指す下位テーブルを 0 で埋める（エントリは present であること）
    pub fn clear_child_table(&self, level: u8, va: VirtAddr) {
        let table = self.child_addr(level, va);
        // Safety: 呼び出し側が直前に present + writable のエントリを書いている
        unsafe { self.bus.zero_page(table) }
    }

    pub fn invalidate(&self, va: VirtAddr) {
        self.bus.invalidate(va);
    }
}

// ─────────────────────────────────────────────
// bare-metal 実装
// ─────────────────────────────────────────────

/// 実 CPU のアドレス空間をそのまま使う MemoryBus
#[cfg(target_os = "none")]
pub struct DirectBus;

#[cfg(target_os = "none")]
impl MemoryBus for DirectBus {
    unsafe fn read_u64(&self, va: VirtAddr) -> u64 {
        core::ptr::read_volatile(va.0 as *const u64)
    }

    unsafe fn write_u64(&self, va: VirtAddr, value: u64) {
        core::ptr::write_volatile(va.0 as *mut u64, value)
    }

    unsafe fn zero_page(&self, page: VirtAddr) {
        core::ptr::write_bytes(page.page_base().0 as *mut u8, 0, PAGE_SIZE as usize);
    }

    fn invalidate(&self, va: VirtAddr) {
        x86_64::instructions::tlb::flush(x86_64::VirtAddr::new_truncate(va.0));
    }
}

/// 現在の PML4 に自己参照エントリを入れる（bootloader の直後に 1 回だけ）
///
/// # Safety
/// `phys_offset` がブートローダによる物理メモリ全域マップの開始であること
#[cfg(target_os = "none")]
pub unsafe fn install_recursive_slot(phys_offset: u64, index: usize) -> crate::mem::addr::PhysAddr {
    use crate::mem::paging::TABLE_FLAGS;
    use x86_64::registers::control::Cr3;

    let (frame, _) = Cr3::read();
    let root = frame.start_address().as_u64();
    let pml4 = (phys_offset + root) as *mut u64;

    let entry = PageTableEntry::new(crate::mem::addr::PhysAddr(root), TABLE_FLAGS);
    core::ptr::write_volatile(pml4.add(index), entry.0);
    x86_64::instructions::tlb::flush_all();

    crate::mem::addr::PhysAddr(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::virt_layout::PAGE_TABLE_WINDOW_BASE;
    use crate::mem::addr::PhysAddr;
    use crate::mem::paging::{PageFlags, TABLE_FLAGS};
    use crate::mm::sim::SimMachine;

    #[test]
    fn view_reads_the_root_through_the_recursive_slot() {
        let sim = SimMachine::new();
        let view = PageTableView::new(&sim, VirtAddr(PAGE_TABLE_WINDOW_BASE));

        // PML4[511] は自分自身
        let e = view.read_entry(4, VirtAddr(PAGE_TABLE_WINDOW_BASE));
        assert!(e.is_present());
        assert_eq!(e.addr(), sim.root());

        assert!(!view.read_entry(4, VirtAddr(0x1000)).is_present());
    }

    #[test]
    fn written_entries_land_in_physical_tables() {
        let sim = SimMachine::new();
        let view = PageTableView::new(&sim, VirtAddr(PAGE_TABLE_WINDOW_BASE));
        let va = VirtAddr(0x0000_0040_0000_0000);

        view.write_entry(4, va, PageTableEntry::new(PhysAddr(0x5000), TABLE_FLAGS));
        assert_eq!(sim.phys_read(PhysAddr(sim.root().0 + 8 * va.table_index(4) as u64)), 0x5003);

        // 新しい PDPT が窓から見えて、クリアできる
        sim.phys_write(PhysAddr(0x5000 + 8 * 3), 0xdead_b000 | PageFlags::PRESENT.bits());
        view.clear_child_table(4, va);
        assert_eq!(sim.phys_read(PhysAddr(0x5000 + 8 * 3)), 0);
    }

    #[test]
    fn invalidate_is_forwarded_for_one_address() {
        let sim = SimMachine::new();
        let view = PageTableView::new(&sim, VirtAddr(PAGE_TABLE_WINDOW_BASE));
        view.invalidate(VirtAddr(0x1234_5000));
        assert_eq!(sim.invalidations(), [0x1234_5000]);
    }
}
