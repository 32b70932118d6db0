// kernel/src/kernel/sched.rs
//
// 役割:
// - 優先度付き・協調型のスケジューラ。
//
// やること:
// - 優先度ごとの FIFO run-queue（実行中のスレッドも自分のキューの先頭に残る）
// - 差分キューによる sleep、イベント待ちの blocking リスト
// - get_next_thread(): blocking リストを毎回見直して（polling）、全イベントが立っていれば run-queue へ戻し、
//   最も高い優先度のキュー先頭を返す
// - timer_tick(): 時計を進め、sleep の期限を処理し、タイムスライスを減らして次を選ぶ
//
// やらないこと:
// - レジスタ文脈の保存/復元（ContextSwitch の実装に任せる）
// - イベントの通知（起床は必ず get_next_thread の呼び出し境界で起きる）
//
// 設計方針:
// - Thread.location を唯一の正とする。どのキューからどう外すかは location で決める
// - 状態は 1 本の spin::Mutex。ContextSwitch はロックを外してから呼ぶ
// - ロック順は sched → events

use core::fmt;

use spin::Mutex;

use crate::kernel::delta_queue::DeltaQueue;
use crate::kernel::event::{EventError, EventId, EventTable, WakeProbe};
use crate::kernel::thread::{Thread, ThreadId, ThreadLocation, MAX_PRIORITY, NUM_PRIORITIES};
use crate::kernel::trace::{SchedEvent, TraceRing};
use crate::logging;
use crate::mem::addr::PAGE_SIZE;
use crate::mem::layout::STACK_GUARD_SIZE;
use crate::mem::regions::{Region, RegionError, RegionKind, RegionTable};

pub const MAX_THREADS: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedError {
    /// start_running() 前に現在スレッドを前提とする操作をした
    NotStarted,
    TableFull,
    UnknownThread,
    BadPriority,
    Region(RegionError),
    Event(EventError),
}

impl From<RegionError> for SchedError {
    fn from(e: RegionError) -> Self {
        SchedError::Region(e)
    }
}

impl From<EventError> for SchedError {
    fn from(e: EventError) -> Self {
        SchedError::Event(e)
    }
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedError::NotStarted => write!(f, "scheduler is not running yet"),
            SchedError::TableFull => write!(f, "thread table full"),
            SchedError::UnknownThread => write!(f, "unknown thread"),
            SchedError::BadPriority => write!(f, "priority out of range (0..={})", MAX_PRIORITY),
            SchedError::Region(e) => write!(f, "thread stack: {}", e),
            SchedError::Event(e) => write!(f, "thread event: {}", e),
        }
    }
}

/// 実際にスレッドを切り替える側（arch）
pub trait ContextSwitch {
    fn switch_to(&self, from: Option<ThreadId>, to: ThreadId);
}

/// 切替を記録だけする（単一スレッドのブート経路・テスト）
pub struct NoSwitch;

impl ContextSwitch for NoSwitch {
    fn switch_to(&self, _from: Option<ThreadId>, _to: ThreadId) {}
}

#[derive(Clone, Copy)]
struct RunQueue {
    ids: [ThreadId; MAX_THREADS],
    head: usize,
    len: usize,
}

impl RunQueue {
    const fn new() -> Self {
        RunQueue {
            ids: [ThreadId(0); MAX_THREADS],
            head: 0,
            len: 0,
        }
    }

    fn push_back(&mut self, id: ThreadId) {
        if self.len < MAX_THREADS {
            self.ids[(self.head + self.len) % MAX_THREADS] = id;
            self.len += 1;
        }
    }

    fn front(&self) -> Option<ThreadId> {
        if self.len == 0 {
            None
        } else {
            Some(self.ids[self.head])
        }
    }

    fn remove(&mut self, id: ThreadId) -> bool {
        let found = (0..self.len).find(|i| self.ids[(self.head + i) % MAX_THREADS] == id);
        let Some(i) = found else {
            return false;
        };
        for j in i..self.len - 1 {
            self.ids[(self.head + j) % MAX_THREADS] = self.ids[(self.head + j + 1) % MAX_THREADS];
        }
        self.len -= 1;
        true
    }

    fn contains(&self, id: ThreadId) -> bool {
        (0..self.len).any(|i| self.ids[(self.head + i) % MAX_THREADS] == id)
    }
}

struct SchedState {
    threads: [Option<Thread>; MAX_THREADS],
    queues: [RunQueue; NUM_PRIORITIES],
    sleeping: DeltaQueue<MAX_THREADS>,
    blocking: [ThreadId; MAX_THREADS],
    blocking_len: usize,
    current: Option<ThreadId>,
    started: bool,
    now: u64,
    trace: TraceRing,
}

impl SchedState {
    const fn new() -> Self {
        SchedState {
            threads: [None; MAX_THREADS],
            queues: [RunQueue::new(); NUM_PRIORITIES],
            sleeping: DeltaQueue::new(),
            blocking: [ThreadId(0); MAX_THREADS],
            blocking_len: 0,
            current: None,
            started: false,
            now: 0,
            trace: TraceRing::new(),
        }
    }

    fn thread_mut(&mut self, id: ThreadId) -> Result<&mut Thread, SchedError> {
        self.threads
            .get_mut(id.0 as usize)
            .and_then(|t| t.as_mut())
            .ok_or(SchedError::UnknownThread)
    }

    fn remove_blocking(&mut self, id: ThreadId) {
        if let Some(i) = self.blocking[..self.blocking_len].iter().position(|t| *t == id) {
            self.blocking.copy_within(i + 1..self.blocking_len, i);
            self.blocking_len -= 1;
        }
    }

    /// 今いる場所から外して Released にする
    fn unlink(&mut self, id: ThreadId) -> Result<(), SchedError> {
        let location = self.thread_mut(id)?.location;
        match location {
            ThreadLocation::Running(p) => {
                self.queues[p as usize].remove(id);
            }
            ThreadLocation::Sleeping => {
                self.sleeping.remove(id);
            }
            ThreadLocation::Blocking => self.remove_blocking(id),
            ThreadLocation::Released => {}
        }
        self.thread_mut(id)?.location = ThreadLocation::Released;
        Ok(())
    }

    /// 自分の優先度のキュー末尾へ。スライスを戻し、待ちイベントを捨てる。
    fn enqueue(&mut self, id: ThreadId, events: &EventTable) -> Result<(), SchedError> {
        self.unlink(id)?;
        let t = self.thread_mut(id)?;
        t.clear_blocking_on();
        t.time_slice_remaining = t.default_slice;
        t.location = ThreadLocation::Running(t.priority);
        let priority = t.priority;
        if let Some(ev) = t.set_default_event(None) {
            events.free(ev);
        }
        self.queues[priority as usize].push_back(id);
        Ok(())
    }

    /// blocking リストを見直してから、最高優先度のキュー先頭を返す
    fn pick(&mut self, events: &EventTable, probe: &dyn WakeProbe) -> Option<ThreadId> {
        let mut ready = [ThreadId(0); MAX_THREADS];
        let mut n = 0;
        for &id in &self.blocking[..self.blocking_len] {
            let all_set = match &self.threads[id.0 as usize] {
                Some(t) => t.blocking_on().iter().all(|ev| events.is_set(*ev, self.now, probe)),
                None => false,
            };
            if all_set {
                ready[n] = id;
                n += 1;
            }
        }
        for &id in &ready[..n] {
            if self.enqueue(id, events).is_ok() {
                self.trace.push(SchedEvent::Woken(id));
            }
        }

        self.queues.iter().rev().find_map(|q| q.front())
    }
}

pub struct Scheduler<'a> {
    state: Mutex<SchedState>,
    events: &'a EventTable,
    probe: &'a dyn WakeProbe,
    switch: &'a dyn ContextSwitch,
    regions: &'a RegionTable,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        events: &'a EventTable,
        probe: &'a dyn WakeProbe,
        switch: &'a dyn ContextSwitch,
        regions: &'a RegionTable,
    ) -> Self {
        Scheduler {
            state: Mutex::new(SchedState::new()),
            events,
            probe,
            switch,
            regions,
        }
    }

    pub fn events(&self) -> &'a EventTable {
        self.events
    }

    fn insert_thread(&self, name: &'static str, priority: u8, stack: Option<Region>) -> Result<ThreadId, SchedError> {
        let mut st = self.state.lock();
        let slot = st.threads.iter().position(|t| t.is_none()).ok_or(SchedError::TableFull)?;
        let id = ThreadId(slot as u16);
        st.threads[slot] = Some(Thread::new(id, name, priority, stack));
        Ok(id)
    }

    /// スタック（guard 付き・GC root 登録）を確保して Released のスレッドを作る
    pub fn spawn(&self, name: &'static str, priority: u8, stack_size: u64) -> Result<ThreadId, SchedError> {
        if priority > MAX_PRIORITY {
            return Err(SchedError::BadPriority);
        }
        // 先に枠を押さえる。region は枠が取れてから切り出す。
        let id = self.insert_thread(name, priority, None)?;
        let stack = match self
            .regions
            .alloc(stack_size, PAGE_SIZE, name, STACK_GUARD_SIZE, RegionKind::Stack, true)
        {
            Ok(r) => r,
            Err(e) => {
                self.state.lock().threads[id.0 as usize] = None;
                return Err(e.into());
            }
        };
        self.state.lock().thread_mut(id)?.stack = Some(stack);
        Ok(id)
    }

    /// 既に動いている文脈（ブートスレッドなど）をスタック無しで登録し、run-queue に入れる
    pub fn adopt(&self, name: &'static str, priority: u8) -> Result<ThreadId, SchedError> {
        if priority > MAX_PRIORITY {
            return Err(SchedError::BadPriority);
        }
        let id = self.insert_thread(name, priority, None)?;
        self.reschedule(id)?;
        Ok(id)
    }

    pub fn start(&self, id: ThreadId) -> Result<(), SchedError> {
        self.reschedule(id)
    }

    pub fn reschedule(&self, id: ThreadId) -> Result<(), SchedError> {
        let mut st = self.state.lock();
        st.enqueue(id, self.events)?;
        st.trace.push(SchedEvent::Rescheduled(id));
        Ok(())
    }

    /// どこからも外して枠を空ける。以後この id は UnknownThread になる
    /// （枠が再利用されれば別スレッドを指す）。スタック region は GC root として残る。
    pub fn release(&self, id: ThreadId) -> Result<(), SchedError> {
        let mut st = self.state.lock();
        st.unlink(id)?;
        if let Some(ev) = st.thread_mut(id)?.set_default_event(None) {
            self.events.free(ev);
        }
        if st.current == Some(id) {
            st.current = None;
        }
        st.threads[id.0 as usize] = None;
        st.trace.push(SchedEvent::Released(id));
        Ok(())
    }

    pub fn exit(&self, id: ThreadId) -> Result<(), SchedError> {
        self.release(id)
    }

    /// 既定の「メッセージ待ち」イベントで止める。作ったイベントは次の reschedule で解放される。
    pub fn block(&self, id: ThreadId) -> Result<EventId, SchedError> {
        let existing = self.thread(id).ok_or(SchedError::UnknownThread)?.default_event();
        let ev = match existing {
            Some(ev) => ev,
            None => self.events.create_message_pending(id)?,
        };
        self.state.lock().thread_mut(id)?.set_default_event(Some(ev));
        self.block_on(id, &[ev])?;
        Ok(ev)
    }

    /// `events` がすべて立つまで止める
    pub fn block_on(&self, id: ThreadId, events: &[EventId]) -> Result<(), SchedError> {
        let mut st = self.state.lock();
        if events.len() > crate::kernel::thread::MAX_BLOCKING_ON {
            return Err(SchedError::Event(EventError::TooManyChildren));
        }
        // 容量の確認は状態を触る前に済ませる
        let already = st.thread_mut(id)?.location == ThreadLocation::Blocking;
        if !already && st.blocking_len >= MAX_THREADS {
            return Err(SchedError::TableFull);
        }
        st.unlink(id)?;
        let t = st.thread_mut(id)?;
        t.set_blocking_on(events);
        t.location = ThreadLocation::Blocking;

        let n = st.blocking_len;
        st.blocking[n] = id;
        st.blocking_len += 1;
        st.trace.push(SchedEvent::Blocked(id));
        Ok(())
    }

    pub fn sleep(&self, id: ThreadId, ticks: u64) -> Result<(), SchedError> {
        let mut st = self.state.lock();
        let already = st.thread_mut(id)?.location == ThreadLocation::Sleeping;
        if !already && st.sleeping.len() >= MAX_THREADS {
            return Err(SchedError::TableFull);
        }
        st.unlink(id)?;
        if !st.sleeping.insert(id, ticks) {
            return Err(SchedError::TableFull);
        }
        st.thread_mut(id)?.location = ThreadLocation::Sleeping;
        st.trace.push(SchedEvent::Slept { thread: id, ticks });
        Ok(())
    }

    /// 次に走るべきスレッド（選ぶだけで切り替えない）
    pub fn get_next_thread(&self) -> Option<ThreadId> {
        self.state.lock().pick(self.events, self.probe)
    }

    /// 最初の切替。以後 yield/wait/timer_tick が使える。
    pub fn start_running(&self) -> Option<ThreadId> {
        self.state.lock().started = true;
        logging::info("kernel::sched: start_running");
        self.schedule_next(0).ok().flatten()
    }

    /// 現在スレッドのスライスを `elapsed` 減らし、次を選んで（変わるなら）切り替える
    pub fn schedule_next(&self, elapsed: u64) -> Result<Option<ThreadId>, SchedError> {
        let (prev, next) = {
            let mut st = self.state.lock();
            if !st.started {
                return Err(SchedError::NotStarted);
            }

            if let Some(cur) = st.current {
                let expired = match st.thread_mut(cur) {
                    Ok(t) if matches!(t.location, ThreadLocation::Running(_)) => {
                        t.time_slice_remaining = t.time_slice_remaining.saturating_sub(elapsed);
                        t.time_slice_remaining == 0
                    }
                    _ => false,
                };
                if expired {
                    st.trace.push(SchedEvent::SliceExpired(cur));
                    st.enqueue(cur, self.events)?;
                }
            }

            let next = st.pick(self.events, self.probe);
            let prev = st.current;
            st.current = next;
            if let Some(to) = next {
                if prev != next {
                    st.trace.push(SchedEvent::Switched { from: prev, to });
                }
            }
            (prev, next)
        };

        if let Some(to) = next {
            if prev != Some(to) {
                self.switch.switch_to(prev, to);
            }
        }
        Ok(next)
    }

    /// タイマ割り込みから呼ぶ
    pub fn timer_tick(&self, elapsed: u64) -> Result<Option<ThreadId>, SchedError> {
        {
            let mut st = self.state.lock();
            if !st.started {
                return Err(SchedError::NotStarted);
            }
            st.now = st.now.saturating_add(elapsed);

            let mut due = [ThreadId(0); MAX_THREADS];
            let mut n = 0;
            st.sleeping.advance(elapsed, |id| {
                due[n] = id;
                n += 1;
            });
            for &id in &due[..n] {
                // advance が既に外しているので location だけが残っている
                st.enqueue(id, self.events)?;
                st.trace.push(SchedEvent::Woken(id));
            }
        }
        self.schedule_next(elapsed)
    }

    /// 現在スレッドを自分のキューの末尾へ回して選び直す
    pub fn yield_now(&self) -> Result<Option<ThreadId>, SchedError> {
        {
            let mut st = self.state.lock();
            if !st.started {
                return Err(SchedError::NotStarted);
            }
            if let Some(cur) = st.current {
                if matches!(st.thread_mut(cur)?.location, ThreadLocation::Running(_)) {
                    st.enqueue(cur, self.events)?;
                }
            }
        }
        self.schedule_next(0)
    }

    /// 現在スレッドを `events` で止めて他へ切り替える
    pub fn wait(&self, events: &[EventId]) -> Result<(), SchedError> {
        let cur = self.running_thread()?;
        self.block_on(cur, events)?;
        self.schedule_next(0)?;
        Ok(())
    }

    /// 現在スレッドを `ticks` 眠らせて他へ切り替える
    pub fn sleep_current(&self, ticks: u64) -> Result<(), SchedError> {
        let cur = self.running_thread()?;
        self.sleep(cur, ticks)?;
        self.schedule_next(0)?;
        Ok(())
    }

    fn running_thread(&self) -> Result<ThreadId, SchedError> {
        let st = self.state.lock();
        if !st.started {
            return Err(SchedError::NotStarted);
        }
        st.current.ok_or(SchedError::NotStarted)
    }

    pub fn current(&self) -> Option<ThreadId> {
        self.state.lock().current
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }

    pub fn now(&self) -> u64 {
        self.state.lock().now
    }

    pub fn thread(&self, id: ThreadId) -> Option<Thread> {
        self.state.lock().threads.get(id.0 as usize).copied().flatten()
    }

    pub fn location(&self, id: ThreadId) -> Option<ThreadLocation> {
        self.thread(id).map(|t| t.location)
    }

    /// トレースを読む（ロックを持ったまま f を呼ぶ）
    pub fn with_trace<R>(&self, f: impl FnOnce(&TraceRing) -> R) -> R {
        f(&self.state.lock().trace)
    }

    pub fn dump_trace(&self) {
        self.state.lock().trace.dump();
    }

    #[cfg(test)]
    fn appearances(&self, id: ThreadId) -> usize {
        let st = self.state.lock();
        let queued = st.queues.iter().filter(|q| q.contains(id)).count();
        let sleeping = st.sleeping.contains(id) as usize;
        let blocked = st.blocking[..st.blocking_len].iter().filter(|t| **t == id).count();
        queued + sleeping + blocked
    }
}
