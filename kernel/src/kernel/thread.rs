// kernel/src/kernel/thread.rs
//
// 役割:
// - スレッド 1 本分の状態（優先度・残りタイムスライス・居場所・待ちイベント・スタック）を定義する。
//
// やること:
// - ThreadLocation を「どのキューに入っているか」の唯一の記録として持つ
// - 待ちイベント（最大 MAX_BLOCKING_ON 個）と、block() が作った既定イベントを覚える
//
// やらないこと:
// - キュー操作（kernel::sched の責務）
// - レジスタ文脈の保存（ContextSwitch の実装側）

use core::fmt;

use crate::kernel::event::EventId;
use crate::mem::addr::VirtAddr;
use crate::mem::regions::Region;

pub const NUM_PRIORITIES: usize = 11;
pub const MAX_PRIORITY: u8 = (NUM_PRIORITIES - 1) as u8;
pub const DEFAULT_PRIORITY: u8 = 5;
/// 10ms（ns 単位の tick）
pub const DEFAULT_TIME_SLICE: u64 = 10_000_000;
pub const MAX_BLOCKING_ON: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u16);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// スレッドが今どこに居るか
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadLocation {
    /// この優先度の run-queue（実行中のスレッドも自分のキューの先頭に居続ける）
    Running(u8),
    Sleeping,
    Blocking,
    Released,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Thread {
    pub id: ThreadId,
    pub name: &'static str,
    pub priority: u8,
    pub default_slice: u64,
    pub time_slice_remaining: u64,
    pub location: ThreadLocation,
    pub stack: Option<Region>,
    blocking_on: [EventId; MAX_BLOCKING_ON],
    blocking_len: u8,
    default_event: Option<EventId>,
}

impl Thread {
    pub fn new(id: ThreadId, name: &'static str, priority: u8, stack: Option<Region>) -> Self {
        Thread {
            id,
            name,
            priority,
            default_slice: DEFAULT_TIME_SLICE,
            time_slice_remaining: DEFAULT_TIME_SLICE,
            location: ThreadLocation::Released,
            stack,
            blocking_on: [EventId(0); MAX_BLOCKING_ON],
            blocking_len: 0,
            default_event: None,
        }
    }

    pub fn blocking_on(&self) -> &[EventId] {
        &self.blocking_on[..self.blocking_len as usize]
    }

    /// 入りきらなければ false（何も変えない）
    pub(crate) fn set_blocking_on(&mut self, events: &[EventId]) -> bool {
        if events.len() > MAX_BLOCKING_ON {
            return false;
        }
        self.blocking_on[..events.len()].copy_from_slice(events);
        self.blocking_len = events.len() as u8;
        true
    }

    pub(crate) fn clear_blocking_on(&mut self) {
        self.blocking_len = 0;
    }

    pub fn default_event(&self) -> Option<EventId> {
        self.default_event
    }

    pub(crate) fn set_default_event(&mut self, ev: Option<EventId>) -> Option<EventId> {
        core::mem::replace(&mut self.default_event, ev)
    }

    /// スタックの最上位（初期 rsp）。guard は下側にある。
    pub fn stack_top(&self) -> Option<VirtAddr> {
        self.stack.map(|r| VirtAddr(r.end()))
    }
}
