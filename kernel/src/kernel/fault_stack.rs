// kernel/src/kernel/fault_stack.rs
//
// 役割:
// - #PF を受けるスタックのプール。fault 処理中の fault が、処理中のスタックを壊さないようにする。
//
// やること:
// - enter(): 深さを 1 増やし、IST を「次の」プール要素へ進める
// - FaultStackGuard の drop: IST を今使っている要素へ戻し、深さを 1 減らす
// - 深さ FAULT_STACK_WARN_DEPTH 以上で warn、次に渡すスタックが無ければ OutOfFaultStacks
//
// やらないこと:
// - スタック領域そのものの確保（arch::gdt が静的に持つ）
// - TSS の書き換え（InterruptStackTable の実装に任せる）
//
// 設計方針:
// - 深さ k の handler はプール要素 k-1 の上で走る。要素 k が無い（k == N）なら
//   次の fault を受けられないので、その時点で致命扱いにする

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::logging;
use crate::mem::addr::VirtAddr;

pub const FAULT_STACK_POOL: usize = 8;
pub const FAULT_STACK_WARN_DEPTH: usize = 4;
pub const FAULT_STACK_SIZE: u64 = 0x4000;

/// fault 時に CPU が切り替えるスタックポインタ（TSS の IST）
pub trait InterruptStackTable {
    fn set_fault_stack(&self, top: VirtAddr);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutOfFaultStacks {
    pub depth: usize,
}

impl fmt::Display for OutOfFaultStacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ran out of virtual fault stacks (depth {})", self.depth)
    }
}

pub struct FaultStackPool<'a, const N: usize = FAULT_STACK_POOL> {
    tops: [VirtAddr; N],
    depth: AtomicUsize,
    ist: &'a dyn InterruptStackTable,
    exhaustion_reported: AtomicBool,
}

impl<'a, const N: usize> FaultStackPool<'a, N> {
    /// `tops[0]` を IST に入れて待機状態にする
    pub fn new(tops: [VirtAddr; N], ist: &'a dyn InterruptStackTable) -> Self {
        if let Some(first) = tops.first() {
            ist.set_fault_stack(*first);
        }
        FaultStackPool {
            tops,
            depth: AtomicUsize::new(0),
            ist,
            exhaustion_reported: AtomicBool::new(false),
        }
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn enter(&self) -> Result<FaultStackGuard<'_, 'a, N>, OutOfFaultStacks> {
        let depth = self.depth.fetch_add(1, Ordering::SeqCst) + 1;
        if depth >= N {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            return Err(OutOfFaultStacks { depth });
        }
        if depth >= FAULT_STACK_WARN_DEPTH {
            logging::warn_fmt(format_args!("kernel::fault_stack: nested fault depth {}", depth));
        }
        self.ist.set_fault_stack(self.tops[depth]);
        Ok(FaultStackGuard { pool: self })
    }

    /// 枯渇の報告は 1 回だけ。2 回目以降（報告中の再入を含む）は false。
    pub fn begin_exhaustion_report(&self) -> bool {
        !self.exhaustion_reported.swap(true, Ordering::SeqCst)
    }

    fn leave(&self) {
        let depth = self.depth.fetch_sub(1, Ordering::SeqCst);
        // depth の handler が使っていた要素を次の fault 用に戻す
        if let Some(top) = depth.checked_sub(1).and_then(|i| self.tops.get(i)) {
            self.ist.set_fault_stack(*top);
        }
    }
}

/// 1 回分の fault 処理。drop で IST と深さを元に戻す。
#[must_use = "dropping the guard immediately leaves the fault handler"]
pub struct FaultStackGuard<'p, 'a, const N: usize> {
    pool: &'p FaultStackPool<'a, N>,
}

impl<const N: usize> FaultStackGuard<'_, '_, N> {
    pub fn depth(&self) -> usize {
        self.pool.depth()
    }
}

impl<const N: usize> Drop for FaultStackGuard<'_, '_, N> {
    fn drop(&mut self) {
        self.pool.leave();
    }
}
