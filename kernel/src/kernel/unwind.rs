// kernel/src/kernel/unwind.rs
//
// 致命 fault のときのスタックトレース。
// - 保存された rbp を辿る（[rbp] = 呼び出し元の rbp, [rbp + 8] = 戻り先）
// - 読む前に必ずマップ済みかを確かめる（StackMemory::peek が None なら打ち切り）
// - 1 行 1 フレーム: `#n 0xADDR symbol+0xOFF`（シンボルが無ければ `?`）

use core::fmt;

use crate::arch::paging::MemoryBus;
use crate::mem::addr::VirtAddr;
use crate::mm::{PageTableManager, PhysicalPageSource};

pub const MAX_FRAMES: usize = 16;

/// 命令アドレス → (シンボル名, 先頭からのオフセット)
pub trait SymbolLookup {
    fn lookup(&self, addr: u64) -> Option<(&'static str, u64)>;
}

/// シンボル表がまだ無い
pub struct NoSymbols;

impl SymbolLookup for NoSymbols {
    fn lookup(&self, _addr: u64) -> Option<(&'static str, u64)> {
        None
    }
}

/// (先頭アドレス, 名前) を昇順に並べた表
pub struct SymbolTable<'a> {
    entries: &'a [(u64, &'static str)],
}

impl<'a> SymbolTable<'a> {
    pub const fn new(entries: &'a [(u64, &'static str)]) -> Self {
        SymbolTable { entries }
    }
}

impl SymbolLookup for SymbolTable<'_> {
    fn lookup(&self, addr: u64) -> Option<(&'static str, u64)> {
        let i = self.entries.partition_point(|(start, _)| *start <= addr);
        let (start, name) = *self.entries.get(i.checked_sub(1)?)?;
        Some((name, addr - start))
    }
}

/// マップ済みのときだけ読めるメモリ
pub trait StackMemory {
    fn peek(&self, va: VirtAddr) -> Option<u64>;
}

impl<B: MemoryBus, S: PhysicalPageSource> StackMemory for PageTableManager<'_, B, S> {
    fn peek(&self, va: VirtAddr) -> Option<u64> {
        self.peek_u64(va)
    }
}

/// rip を #0 として、呼び出し元の戻り先を順に `f` へ渡す
pub fn walk_frames(rip: u64, rbp: u64, mem: &dyn StackMemory, mut f: impl FnMut(usize, u64)) {
    f(0, rip);

    let mut frame = rbp;
    for n in 1..MAX_FRAMES {
        if frame == 0 || frame % 8 != 0 {
            return;
        }
        let (Some(ret), Some(next)) = (mem.peek(VirtAddr(frame.wrapping_add(8))), mem.peek(VirtAddr(frame))) else {
            return;
        };
        if ret == 0 {
            return;
        }
        f(n, ret);
        // 呼び出し元のフレームは必ず上（高位）にある
        if next <= frame {
            return;
        }
        frame = next;
    }
}

pub fn write_trace(
    out: &mut dyn fmt::Write,
    rip: u64,
    rbp: u64,
    mem: &dyn StackMemory,
    symbols: &dyn SymbolLookup,
) -> fmt::Result {
    let mut result = Ok(());
    walk_frames(rip, rbp, mem, |n, addr| {
        if result.is_err() {
            return;
        }
        result = match symbols.lookup(addr) {
            Some((name, off)) => writeln!(out, "#{} {:#018x} {}+{:#x}", n, addr, name, off),
            None => writeln!(out, "#{} {:#018x} ?", n, addr),
        };
    });
    result
}
