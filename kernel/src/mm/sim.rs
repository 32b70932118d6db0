// kernel/src/mm/sim.rs
//
// 役割（テスト専用）:
// - host 上で x86_64 の 4段ページングを模した MMU + 物理メモリを提供する。
//
// やること:
// - 物理メモリは 4KiB フレーム単位で遅延生成（未使用フレームは 0 に見える）
// - CR3 相当の root から本物と同じ形式のエントリを辿る（自己参照スロットもそのまま効く）
// - 非 present / 書き込み禁止へのアクセスは SimFault（#PF 相当）を返す
// - invalidate の呼び出し履歴を記録する
//
// やらないこと:
// - TLB のキャッシュ動作（翻訳は毎回テーブルを辿る）

use std::boxed::Box;
use std::cell::RefCell;
use std::collections::HashMap;
use std::vec::Vec;

use crate::arch::paging::MemoryBus;
use crate::arch::virt_layout::RECURSIVE_INDEX;
use crate::mem::addr::{PhysAddr, VirtAddr, PAGE_SIZE};
use crate::mem::paging::{PageTableEntry, TABLE_FLAGS};

/// root(PML4) を置く物理フレーム。テストが配るページとは重ならない位置。
pub const SIM_ROOT: PhysAddr = PhysAddr(0x000f_f000);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SimFault {
    pub addr: VirtAddr,
    pub write: bool,
    /// 翻訳自体は成功した（= 権限違反）
    pub present: bool,
}

pub struct SimMachine {
    frames: RefCell<HashMap<u64, Box<[u64; 512]>>>,
    root: PhysAddr,
    invalidations: RefCell<Vec<u64>>,
}

impl SimMachine {
    pub fn new() -> Self {
        let m = SimMachine {
            frames: RefCell::new(HashMap::new()),
            root: SIM_ROOT,
            invalidations: RefCell::new(Vec::new()),
        };
        let slot = PhysAddr(SIM_ROOT.0 + 8 * RECURSIVE_INDEX as u64);
        m.phys_write(slot, PageTableEntry::new(SIM_ROOT, TABLE_FLAGS).0);
        m
    }

    pub fn root(&self) -> PhysAddr {
        self.root
    }

    pub fn phys_read(&self, pa: PhysAddr) -> u64 {
        let frames = self.frames.borrow();
        match frames.get(&pa.page_base().0) {
            Some(f) => f[((pa.0 & (PAGE_SIZE - 1)) / 8) as usize],
            None => 0,
        }
    }

    pub fn phys_write(&self, pa: PhysAddr, value: u64) {
        let mut frames = self.frames.borrow_mut();
        let f = frames
            .entry(pa.page_base().0)
            .or_insert_with(|| Box::new([0u64; 512]));
        f[((pa.0 & (PAGE_SIZE - 1)) / 8) as usize] = value;
    }

    /// 仮想 → 物理。途中の全 level が writable でないと書き込みは通らない。
    pub fn translate(&self, va: VirtAddr, write: bool) -> Result<PhysAddr, SimFault> {
        let not_present = SimFault { addr: va, write, present: false };
        if !va.is_canonical() {
            return Err(not_present);
        }

        let mut table = self.root;
        let mut writable = true;
        for level in (1..=4u8).rev() {
            let at = PhysAddr(table.0 + 8 * va.table_index(level) as u64);
            let e = PageTableEntry(self.phys_read(at));
            if !e.is_present() {
                return Err(not_present);
            }
            writable &= e.is_writable();
            table = e.addr();
        }

        if write && !writable {
            return Err(SimFault { addr: va, write, present: true });
        }
        Ok(table.add(va.page_offset()))
    }

    pub fn read(&self, va: VirtAddr) -> Result<u64, SimFault> {
        let pa = self.translate(va, false)?;
        Ok(self.phys_read(pa))
    }

    pub fn write(&self, va: VirtAddr, value: u64) -> Result<(), SimFault> {
        let pa = self.translate(va, true)?;
        self.phys_write(pa, value);
        Ok(())
    }

    pub fn invalidations(&self) -> Vec<u64> {
        self.invalidations.borrow().clone()
    }

    pub fn clear_invalidations(&self) {
        self.invalidations.borrow_mut().clear();
    }
}

impl MemoryBus for SimMachine {
    unsafe fn read_u64(&self, va: VirtAddr) -> u64 {
        match self.read(va) {
            Ok(v) => v,
            Err(f) => panic!("sim: read through unmapped address {:?}", f),
        }
    }

    unsafe fn write_u64(&self, va: VirtAddr, value: u64) {
        if let Err(f) = self.write(va, value) {
            panic!("sim: write through unmapped address {:?}", f);
        }
    }

    fn invalidate(&self, va: VirtAddr) {
        self.invalidations.borrow_mut().push(va.0);
    }
}
