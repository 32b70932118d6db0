// kernel/src/kernel/event.rs
//
// 役割:
// - スレッドが待つ「条件」を固定長の表で持つ。
//
// やること:
// - Plain: set/reset で立つ/落ちる旗
// - MessagePending / ProcessReady: 外部（WakeProbe）に毎回問い合わせる
// - Timer: スケジューラ時計が deadline を厳密に過ぎたら立っている
// - WaitAny / WaitAll: 子イベントを再帰的に評価する（自分自身は set されない）
//
// やらないこと:
// - 待っているスレッドへの通知（起床は scheduler の polling が行う）
//
// 設計方針:
// - イベントは EventId(u16) で指す。表は 1 本の spin::Mutex
// - 合成/問い合わせ系への set/reset は黙って無視する

use core::fmt;

use spin::Mutex;

use crate::kernel::thread::ThreadId;
use crate::logging;

pub const MAX_EVENTS: usize = 128;
pub const MAX_CHILDREN: usize = 8;

/// 合成の入れ子の上限（解放済みスロットの再利用で輪ができても止まるように）
const MAX_DEPTH: u32 = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(pub u16);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventError {
    TableFull,
    TooManyChildren,
    UnknownEvent,
}

impl fmt::Display for EventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventError::TableFull => write!(f, "event table full"),
            EventError::TooManyChildren => write!(f, "too many child events (max {})", MAX_CHILDREN),
            EventError::UnknownEvent => write!(f, "unknown event"),
        }
    }
}

/// 合成イベントの子リスト
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Children {
    ids: [EventId; MAX_CHILDREN],
    len: u8,
}

impl Children {
    fn from_slice(ids: &[EventId]) -> Result<Self, EventError> {
        if ids.len() > MAX_CHILDREN {
            return Err(EventError::TooManyChildren);
        }
        let mut c = Children { ids: [EventId(0); MAX_CHILDREN], len: ids.len() as u8 };
        c.ids[..ids.len()].copy_from_slice(ids);
        Ok(c)
    }

    pub fn as_slice(&self) -> &[EventId] {
        &self.ids[..self.len as usize]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Plain { signalled: bool },
    MessagePending(ThreadId),
    ProcessReady(u32),
    Timer { deadline: u64 },
    WaitAny(Children),
    WaitAll(Children),
}

/// 問い合わせ系イベントの答えを持っている外部
pub trait WakeProbe {
    fn message_pending(&self, thread: ThreadId) -> bool {
        let _ = thread;
        false
    }

    fn process_ready(&self, pid: u32) -> bool {
        let _ = pid;
        false
    }
}

/// メッセージもプロセスも無い環境（ブート直後・テスト）
pub struct NoProbe;

impl WakeProbe for NoProbe {}

pub struct EventTable {
    slots: Mutex<[Option<EventKind>; MAX_EVENTS]>,
}

impl EventTable {
    pub const fn new() -> Self {
        EventTable {
            slots: Mutex::new([None; MAX_EVENTS]),
        }
    }

    pub fn create(&self, kind: EventKind) -> Result<EventId, EventError> {
        let mut slots = self.slots.lock();

        if let EventKind::WaitAny(c) | EventKind::WaitAll(c) = kind {
            if c.as_slice().iter().any(|id| Self::get(&slots, *id).is_none()) {
                return Err(EventError::UnknownEvent);
            }
        }

        match slots.iter().position(|s| s.is_none()) {
            Some(i) => {
                slots[i] = Some(kind);
                Ok(EventId(i as u16))
            }
            None => {
                logging::error("kernel::event::create: event table full");
                Err(EventError::TableFull)
            }
        }
    }

    pub fn create_plain(&self) -> Result<EventId, EventError> {
        self.create(EventKind::Plain { signalled: false })
    }

    pub fn create_message_pending(&self, thread: ThreadId) -> Result<EventId, EventError> {
        self.create(EventKind::MessagePending(thread))
    }

    pub fn create_process_ready(&self, pid: u32) -> Result<EventId, EventError> {
        self.create(EventKind::ProcessReady(pid))
    }

    pub fn create_timer(&self, deadline: u64) -> Result<EventId, EventError> {
        self.create(EventKind::Timer { deadline })
    }

    pub fn create_wait_any(&self, children: &[EventId]) -> Result<EventId, EventError> {
        self.create(EventKind::WaitAny(Children::from_slice(children)?))
    }

    pub fn create_wait_all(&self, children: &[EventId]) -> Result<EventId, EventError> {
        self.create(EventKind::WaitAll(Children::from_slice(children)?))
    }

    pub fn kind(&self, id: EventId) -> Option<EventKind> {
        Self::get(&self.slots.lock(), id)
    }

    pub fn set(&self, id: EventId) -> Result<(), EventError> {
        self.store_signal(id, true)
    }

    pub fn reset(&self, id: EventId) -> Result<(), EventError> {
        self.store_signal(id, false)
    }

    fn store_signal(&self, id: EventId, value: bool) -> Result<(), EventError> {
        let mut slots = self.slots.lock();
        match slots.get_mut(id.0 as usize) {
            Some(Some(EventKind::Plain { signalled })) => {
                *signalled = value;
                Ok(())
            }
            Some(Some(_)) => Ok(()),
            _ => Err(EventError::UnknownEvent),
        }
    }

    /// スロットを空ける。子として参照している合成イベントは以後この子を「立っていない」と見る。
    pub fn free(&self, id: EventId) {
        if let Some(slot) = self.slots.lock().get_mut(id.0 as usize) {
            *slot = None;
        }
    }

    /// `now` はスケジューラ時計。存在しないイベントは立っていない扱い。
    pub fn is_set(&self, id: EventId, now: u64, probe: &dyn WakeProbe) -> bool {
        let slots = self.slots.lock();
        Self::eval(&slots, id, now, probe, 0)
    }

    pub fn live_count(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.is_some()).count()
    }

    fn get(slots: &[Option<EventKind>; MAX_EVENTS], id: EventId) -> Option<EventKind> {
        slots.get(id.0 as usize).copied().flatten()
    }

    fn eval(
        slots: &[Option<EventKind>; MAX_EVENTS],
        id: EventId,
        now: u64,
        probe: &dyn WakeProbe,
        depth: u32,
    ) -> bool {
        if depth > MAX_DEPTH {
            return false;
        }
        match Self::get(slots, id) {
            None => false,
            Some(EventKind::Plain { signalled }) => signalled,
            Some(EventKind::MessagePending(t)) => probe.message_pending(t),
            Some(EventKind::ProcessReady(pid)) => probe.process_ready(pid),
            Some(EventKind::Timer { deadline }) => now > deadline,
            Some(EventKind::WaitAny(c)) => c
                .as_slice()
                .iter()
                .any(|child| Self::eval(slots, *child, now, probe, depth + 1)),
            Some(EventKind::WaitAll(c)) => c
                .as_slice()
                .iter()
                .all(|child| Self::eval(slots, *child, now, probe, depth + 1)),
        }
    }
}

impl Default for EventTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Inbox(ThreadId);

    impl WakeProbe for Inbox {
        fn message_pending(&self, thread: ThreadId) -> bool {
            thread == self.0
        }
        fn process_ready(&self, pid: u32) -> bool {
            pid == 7
        }
    }

    #[test]
    fn plain_event_follows_set_and_reset() {
        let t = EventTable::new();
        let e = t.create_plain().unwrap();
        assert!(!t.is_set(e, 0, &NoProbe));
        t.set(e).unwrap();
        assert!(t.is_set(e, 0, &NoProbe));
        t.reset(e).unwrap();
        assert!(!t.is_set(e, 0, &NoProbe));
    }

    #[test]
    fn timer_fires_strictly_after_deadline() {
        let t = EventTable::new();
        let e = t.create_timer(100).unwrap();
        assert!(!t.is_set(e, 99, &NoProbe));
        assert!(!t.is_set(e, 100, &NoProbe));
        assert!(t.is_set(e, 101, &NoProbe));
    }

    #[test]
    fn probe_driven_events_ignore_set() {
        let t = EventTable::new();
        let m = t.create_message_pending(ThreadId(3)).unwrap();
        let p = t.create_process_ready(7).unwrap();
        t.set(m).unwrap();
        assert!(!t.is_set(m, 0, &NoProbe));
        assert!(t.is_set(m, 0, &Inbox(ThreadId(3))));
        assert!(!t.is_set(m, 0, &Inbox(ThreadId(4))));
        assert!(t.is_set(p, 0, &Inbox(ThreadId(0))));
    }

    #[test]
    fn composites_evaluate_children_recursively() {
        let t = EventTable::new();
        let a = t.create_plain().unwrap();
        let b = t.create_plain().unwrap();
        let timer = t.create_timer(10).unwrap();
        let any = t.create_wait_any(&[a, timer]).unwrap();
        let all = t.create_wait_all(&[a, b]).unwrap();
        let nested = t.create_wait_all(&[any, b]).unwrap();

        assert!(!t.is_set(any, 0, &NoProbe));
        assert!(t.is_set(any, 11, &NoProbe));

        t.set(a).unwrap();
        assert!(t.is_set(any, 0, &NoProbe));
        assert!(!t.is_set(all, 0, &NoProbe));
        assert!(!t.is_set(nested, 0, &NoProbe));

        t.set(b).unwrap();
        assert!(t.is_set(all, 0, &NoProbe));
        assert!(t.is_set(nested, 0, &NoProbe));

        // 合成自体は set できない
        t.reset(a).unwrap();
        t.set(all).unwrap();
        assert!(!t.is_set(all, 0, &NoProbe));
    }

    #[test]
    fn composite_limits_and_unknown_children() {
        let t = EventTable::new();
        let ids: std::vec::Vec<_> = (0..9).map(|_| t.create_plain().unwrap()).collect();
        assert_eq!(t.create_wait_any(&ids), Err(EventError::TooManyChildren));
        assert_eq!(t.create_wait_all(&[EventId(200)]), Err(EventError::UnknownEvent));
        assert_eq!(t.set(EventId(120)), Err(EventError::UnknownEvent));
    }

    #[test]
    fn freed_slots_are_reused_and_read_as_unset() {
        let t = EventTable::new();
        let a = t.create_plain().unwrap();
        t.set(a).unwrap();
        t.free(a);
        assert!(!t.is_set(a, 0, &NoProbe));
        assert_eq!(t.create_plain().unwrap(), a);
        assert!(!t.is_set(a, 0, &NoProbe));
    }

    #[test]
    fn table_fills_up() {
        let t = EventTable::new();
        for _ in 0..MAX_EVENTS {
            t.create_plain().unwrap();
        }
        assert_eq!(t.live_count(), MAX_EVENTS);
        assert_eq!(t.create_plain(), Err(EventError::TableFull));
    }
}
