// kernel/src/kernel/trace.rs
//
// スケジューラの遷移を固定長リングに残す（観測性）。
// - 満杯になったら古いものから上書きする
// - dump() はログへ 1 件 1〜2 行で出す
//
// 設計方針:
// - no_std / heap なし。要素は Copy な enum
// - ロックは持たない（Scheduler の状態と同じロックの内側で使う）

use crate::kernel::thread::ThreadId;
use crate::logging;

pub const TRACE_CAP: usize = 128;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedEvent {
    Rescheduled(ThreadId),
    Blocked(ThreadId),
    Woken(ThreadId),
    Slept { thread: ThreadId, ticks: u64 },
    Released(ThreadId),
    SliceExpired(ThreadId),
    Switched { from: Option<ThreadId>, to: ThreadId },
}

pub struct TraceRing {
    entries: [Option<SchedEvent>; TRACE_CAP],
    next: usize,
    total: u64,
}

impl TraceRing {
    pub const fn new() -> Self {
        TraceRing {
            entries: [None; TRACE_CAP],
            next: 0,
            total: 0,
        }
    }

    pub fn push(&mut self, ev: SchedEvent) {
        self.entries[self.next] = Some(ev);
        self.next = (self.next + 1) % TRACE_CAP;
        self.total += 1;
    }

    /// これまでに push された総数（上書き分も含む）
    pub fn total(&self) -> u64 {
        self.total
    }

    /// 古い順
    pub fn iter(&self) -> impl Iterator<Item = SchedEvent> + '_ {
        let (newer, older) = self.entries.split_at(self.next);
        older.iter().chain(newer.iter()).filter_map(|e| *e)
    }

    pub fn last(&self) -> Option<SchedEvent> {
        self.entries[(self.next + TRACE_CAP - 1) % TRACE_CAP]
    }

    pub fn dump(&self) {
        logging::info("=== Scheduler Trace Dump ===");
        for ev in self.iter() {
            log_event(ev);
        }
        logging::info("=== End of Scheduler Trace ===");
    }
}

impl Default for TraceRing {
    fn default() -> Self {
        Self::new()
    }
}

fn log_event(ev: SchedEvent) {
    match ev {
        SchedEvent::Rescheduled(t) => logging::info_u64("EVENT: Rescheduled thread", t.0 as u64),
        SchedEvent::Blocked(t) => logging::info_u64("EVENT: Blocked thread", t.0 as u64),
        SchedEvent::Woken(t) => logging::info_u64("EVENT: Woken thread", t.0 as u64),
        SchedEvent::Slept { thread, ticks } => {
            logging::info_u64("EVENT: Slept thread", thread.0 as u64);
            logging::info_u64(" ticks", ticks);
        }
        SchedEvent::Released(t) => logging::info_u64("EVENT: Released thread", t.0 as u64),
        SchedEvent::SliceExpired(t) => logging::info_u64("EVENT: SliceExpired thread", t.0 as u64),
        SchedEvent::Switched { from, to } => {
            logging::info("EVENT: Switched");
            if let Some(f) = from {
                logging::info_u64(" from", f.0 as u64);
            }
            logging::info_u64(" to", to.0 as u64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_the_newest_entries_in_order() {
        let mut r = TraceRing::new();
        for i in 0..(TRACE_CAP as u16 + 3) {
            r.push(SchedEvent::Woken(ThreadId(i)));
        }
        assert_eq!(r.total(), TRACE_CAP as u64 + 3);
        let first = r.iter().next();
        assert_eq!(first, Some(SchedEvent::Woken(ThreadId(3))));
        assert_eq!(r.iter().count(), TRACE_CAP);
        assert_eq!(r.last(), Some(SchedEvent::Woken(ThreadId(TRACE_CAP as u16 + 2))));
    }

    #[test]
    fn empty_ring_yields_nothing() {
        let r = TraceRing::new();
        assert_eq!(r.iter().count(), 0);
        assert_eq!(r.last(), None);
    }
}
