// kernel/src/kernel/delta_queue.rs
//
// 眠っているスレッドの待ち行列。各要素のキーは「1 つ前の要素から何 tick 後か」。
// - insert: 先頭から差分を引きながら位置を探す。同じ時刻なら後ろに並ぶ（FIFO）
// - remove: 抜けた要素の差分は後ろの要素に足す
// - advance: 経過 tick を先頭から順に消費する（1 つで足りなければ次へ繰り越す）

use crate::kernel::thread::ThreadId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Entry {
    thread: ThreadId,
    delta: u64,
}

pub struct DeltaQueue<const N: usize> {
    entries: [Entry; N],
    len: usize,
}

impl<const N: usize> DeltaQueue<N> {
    pub const fn new() -> Self {
        DeltaQueue {
            entries: [Entry { thread: ThreadId(0), delta: 0 }; N],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, thread: ThreadId) -> bool {
        self.entries[..self.len].iter().any(|e| e.thread == thread)
    }

    /// いまから `ticks` 後に起こす。満杯なら false。
    pub fn insert(&mut self, thread: ThreadId, ticks: u64) -> bool {
        if self.len == N {
            return false;
        }

        let mut remaining = ticks;
        let mut at = 0;
        while at < self.len && self.entries[at].delta <= remaining {
            remaining -= self.entries[at].delta;
            at += 1;
        }

        if at < self.len {
            self.entries[at].delta -= remaining;
        }
        self.entries.copy_within(at..self.len, at + 1);
        self.entries[at] = Entry { thread, delta: remaining };
        self.len += 1;
        true
    }

    pub fn remove(&mut self, thread: ThreadId) -> bool {
        let at = match self.entries[..self.len].iter().position(|e| e.thread == thread) {
            Some(i) => i,
            None => return false,
        };
        let delta = self.entries[at].delta;
        if at + 1 < self.len {
            self.entries[at + 1].delta += delta;
        }
        self.entries.copy_within(at + 1..self.len, at);
        self.len -= 1;
        true
    }

    /// `elapsed` tick 進め、期限が来たスレッドを古い順に `due` へ渡す
    pub fn advance(&mut self, elapsed: u64, mut due: impl FnMut(ThreadId)) {
        let mut left = elapsed;
        while self.len > 0 {
            let head = self.entries[0];
            if head.delta > left {
                self.entries[0].delta -= left;
                return;
            }
            left -= head.delta;
            self.entries.copy_within(1..self.len, 0);
            self.len -= 1;
            due(head.thread);
        }
    }

    /// 先頭から順に (thread, 起きるまでの絶対 tick)
    pub fn for_each(&self, mut f: impl FnMut(ThreadId, u64)) {
        let mut at = 0;
        for e in &self.entries[..self.len] {
            at += e.delta;
            f(e.thread, at);
        }
    }
}

impl<const N: usize> Default for DeltaQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec;

    fn snapshot<const N: usize>(q: &DeltaQueue<N>) -> Vec<(u16, u64)> {
        let mut v = Vec::new();
        q.for_each(|t, at| v.push((t.0, at)));
        v
    }

    #[test]
    fn insert_keeps_absolute_order_and_fifo_ties() {
        let mut q = DeltaQueue::<8>::new();
        q.insert(ThreadId(1), 30);
        q.insert(ThreadId(2), 10);
        q.insert(ThreadId(3), 20);
        q.insert(ThreadId(4), 20);
        q.insert(ThreadId(5), 50);
        assert_eq!(snapshot(&q), [(2, 10), (3, 20), (4, 20), (1, 30), (5, 50)]);
    }

    #[test]
    fn remove_gives_its_delta_to_the_successor() {
        let mut q = DeltaQueue::<8>::new();
        q.insert(ThreadId(1), 10);
        q.insert(ThreadId(2), 25);
        q.insert(ThreadId(3), 40);
        assert!(q.remove(ThreadId(2)));
        assert!(!q.remove(ThreadId(2)));
        assert_eq!(snapshot(&q), [(1, 10), (3, 40)]);
    }

    #[test]
    fn advance_carries_over_between_entries() {
        let mut q = DeltaQueue::<8>::new();
        q.insert(ThreadId(1), 5);
        q.insert(ThreadId(2), 8);
        q.insert(ThreadId(3), 8);
        q.insert(ThreadId(4), 20);

        let mut woke = Vec::new();
        q.advance(4, |t| woke.push(t.0));
        assert!(woke.is_empty());

        q.advance(6, |t| woke.push(t.0));
        assert_eq!(woke, [1, 2, 3]);
        assert_eq!(snapshot(&q), [(4, 10)]);

        q.advance(100, |t| woke.push(t.0));
        assert_eq!(woke, [1, 2, 3, 4]);
        assert!(q.is_empty());
    }

    #[test]
    fn zero_tick_sleep_is_due_on_the_next_advance() {
        let mut q = DeltaQueue::<2>::new();
        assert!(q.insert(ThreadId(9), 0));
        let mut woke = Vec::new();
        q.advance(0, |t| woke.push(t.0));
        assert_eq!(woke, [9]);
    }

    #[test]
    fn full_queue_rejects_inserts() {
        let mut q = DeltaQueue::<1>::new();
        assert!(q.insert(ThreadId(1), 1));
        assert!(!q.insert(ThreadId(2), 1));
        assert_eq!(q.len(), 1);
    }
}
