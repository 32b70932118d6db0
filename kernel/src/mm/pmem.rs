// kernel/src/mm/pmem.rs
//
// 役割:
// - 既定の物理ページ供給元。
//   低位（CEILING 未満）はビットマップ、高位は空きページ内リンクのスタックで持つ。
//
// やること:
// - add_boot_range(): ブート時の空き範囲を受け取る（低位はその場でビットマップへ、高位は populate 待ち）
// - begin_alloc(): ビットマップ → スタックの順に候補を差し出す
// - release() / mark_used(): 低位だけが対象（高位は populate でしか戻らない）
// - 空きが low-water を割ったら GC に回収を頼む
//
// やらないこと:
// - 高位ページを scratch にマップしてスタックに積む作業（mm::populate）
// - ブロックそのもの（WouldBlock を返すだけ。待つのは呼び出し側）
//
// 設計方針:
// - ロック順は stack → bitmap。逆順には取らない
// - スタック由来の候補はロックを PageOffer に持たせたまま返す

use core::sync::atomic::{AtomicBool, Ordering};

use spin::{Mutex, Once};

use crate::gc::{GcHooks, NO_GC};
use crate::kernel::event::EventId;
use crate::logging;
use crate::mem::addr::{PhysAddr, VirtAddr};

use super::bitmap::Bitmap;
use super::free_stack::FreeStack;
use super::{AllocError, PageOffer, PhysRange, PhysicalPageSource};

pub const BITMAP_WORDS: usize = 1024;
/// 0x1000_0000 (256MiB)
pub const BITMAP_CEILING: u64 = Bitmap::<BITMAP_WORDS>::CEILING;

pub const LOW_WATER_PAGES: u64 = 1000;
pub const LOW_WATER_STEP: u64 = 100;

const MAX_PENDING_RANGES: usize = 32;

struct PendingRanges {
    ranges: [PhysRange; MAX_PENDING_RANGES],
    len: usize,
}

impl PendingRanges {
    const fn new() -> Self {
        PendingRanges {
            ranges: [PhysRange::new(PhysAddr(0), 0); MAX_PENDING_RANGES],
            len: 0,
        }
    }
}

pub struct Pmem {
    bitmap: Mutex<Bitmap<BITMAP_WORDS>>,
    stack: Mutex<FreeStack>,
    stack_ready: AtomicBool,
    ready_event: Once<EventId>,
    gc: Once<&'static dyn GcHooks>,
    pending: Mutex<PendingRanges>,
    scratch: Once<VirtAddr>,
}

impl Pmem {
    pub const fn new() -> Self {
        Pmem {
            bitmap: Mutex::new(Bitmap::new()),
            stack: Mutex::new(FreeStack::new()),
            stack_ready: AtomicBool::new(false),
            ready_event: Once::new(),
            gc: Once::new(),
            pending: Mutex::new(PendingRanges::new()),
            scratch: Once::new(),
        }
    }

    pub fn set_gc_hooks(&self, hooks: &'static dyn GcHooks) {
        self.gc.call_once(|| hooks);
    }

    /// マルチタスクが動き出したら呼ぶ。以後、スタック準備前の確保は WouldBlock(event) になる。
    pub fn enable_blocking(&self, ready_event: EventId) {
        self.ready_event.call_once(|| ready_event);
    }

    pub fn ready_event(&self) -> Option<EventId> {
        self.ready_event.get().copied()
    }

    pub fn is_stack_ready(&self) -> bool {
        self.stack_ready.load(Ordering::Acquire)
    }

    pub fn stack_depth(&self) -> u64 {
        self.stack.lock().depth()
    }

    pub fn bitmap_free(&self) -> u64 {
        self.bitmap.lock().free_count()
    }

    /// ブートローダの空き範囲を 1 つ受け取る。
    ///
    /// CEILING 未満のページはすぐ使えるようになる。CEILING 以上は populate 用に覚えておく。
    /// 戻り値はビットマップに入れたページ数。
    pub fn add_boot_range(&self, range: PhysRange) -> u64 {
        if !range.is_usable() {
            return 0;
        }

        let added = self.release_low_pages(range);

        if range.end().0 > BITMAP_CEILING {
            let start = core::cmp::max(range.start.0, BITMAP_CEILING);
            let high = PhysRange::new(PhysAddr(start), range.end().0 - start);
            let mut pending = self.pending.lock();
            if pending.len < MAX_PENDING_RANGES {
                let i = pending.len;
                pending.ranges[i] = high;
                pending.len += 1;
            } else {
                logging::warn_fmt(format_args!("mm::pmem::add_boot_range: dropped high range {}", high));
            }
        }

        added
    }

    /// 範囲のうち CEILING 未満のページをビットマップへ入れる
    pub(crate) fn release_low_pages(&self, range: PhysRange) -> u64 {
        let mut bitmap = self.bitmap.lock();
        let before = bitmap.free_count();
        for page in range.pages().take_while(|p| p.0 < BITMAP_CEILING) {
            if page.0 != 0 {
                bitmap.release(page);
            }
        }
        bitmap.free_count() - before
    }

    /// populate 待ちの高位範囲を 1 つ取り出す
    pub fn take_pending(&self) -> Option<PhysRange> {
        let mut pending = self.pending.lock();
        if pending.len == 0 {
            return None;
        }
        pending.len -= 1;
        Some(pending.ranges[pending.len])
    }

    pub(crate) fn stack(&self) -> &Mutex<FreeStack> {
        &self.stack
    }

    /// populate が高位ページを一時的に貼る仮想ページ
    pub(crate) fn scratch(&self) -> &Once<VirtAddr> {
        &self.scratch
    }

    pub(crate) fn mark_stack_ready(&self) {
        self.stack_ready.store(true, Ordering::Release);
    }

    fn check_low_water(&self, free: u64) {
        if free < LOW_WATER_PAGES && free % LOW_WATER_STEP == 0 {
            logging::warn_fmt(format_args!("mm::pmem: low on physical pages ({} free)", free));
            let gc: &dyn GcHooks = match self.gc.get() {
                Some(hooks) => *hooks,
                None => &NO_GC,
            };
            gc.request_collection();
        }
    }

    pub fn dump(&self) {
        logging::info("mm::pmem::dump");
        logging::info_u64("  bitmap_free", self.bitmap_free());
        logging::info_u64("  stack_depth", self.stack_depth());
        logging::info_hex("  ceiling", BITMAP_CEILING);
        logging::info_u64("  stack_ready", self.is_stack_ready() as u64);
    }
}

impl Default for Pmem {
    fn default() -> Self {
        Self::new()
    }
}

impl PhysicalPageSource for Pmem {
    fn begin_alloc(&self) -> Result<PageOffer<'_>, AllocError> {
        let (low, bitmap_free) = {
            let mut bitmap = self.bitmap.lock();
            (bitmap.take_any(), bitmap.free_count())
        };
        if let Some(page) = low {
            self.check_low_water(bitmap_free + self.stack_depth());
            return Ok(PageOffer::immediate(page));
        }

        if !self.is_stack_ready() {
            return match self.ready_event() {
                Some(ev) => Err(AllocError::WouldBlock(ev)),
                None => {
                    logging::error("mm::pmem::begin_alloc: low memory exhausted before the page stack is ready");
                    Err(AllocError::Exhausted)
                }
            };
        }

        let stack = self.stack.lock();
        match stack.head() {
            Some(head) => {
                let free = stack.depth() - 1 + self.bitmap.lock().free_count();
                self.check_low_water(free);
                Ok(PageOffer::linked(head, stack))
            }
            None => {
                logging::error("mm::pmem::begin_alloc: out of physical pages");
                Err(AllocError::Exhausted)
            }
        }
    }

    fn release(&self, phys: PhysAddr) {
        if phys.0 == 0 {
            return;
        }
        if phys.0 >= BITMAP_CEILING {
            logging::warn_fmt(format_args!("mm::pmem::release: high page {} is not returned", phys));
            return;
        }
        self.bitmap.lock().release(phys.page_base());
    }

    fn mark_used(&self, phys: PhysAddr) {
        if phys.0 < BITMAP_CEILING {
            self.bitmap.lock().take(phys.page_base());
        }
    }

    fn free_pages(&self) -> u64 {
        let depth = self.stack_depth();
        depth + self.bitmap_free()
    }
}
