// kernel/src/mm/two_tier.rs
//
// 役割:
// - PhysicalPageSource のもう 1 つの実装。4KiB ページのリングと 2MiB ブロックのリングで持つ。
//
// やること:
// - add_range(): 2MiB 境界に揃ったブロックは大リングへ、残りは小リングへ（物理 0 番は除く）
// - begin_alloc(): 小リング → 大リングを 1 つ割って（先頭を返し、残り 511 枚を小リングへ）
// - release(): 小リングへ戻す
//
// やらないこと:
// - 小ページを 2MiB へ組み直すこと
// - ブート経路への組み込み（既定は Pmem）
//
// 設計方針:
// - 中身を読まずに配れるので PageOffer は常に immediate
// - ロック順は small → large

use spin::Mutex;

use crate::logging;
use crate::mem::addr::{PhysAddr, PAGE_SIZE};

use super::{AllocError, PageOffer, PhysRange, PhysicalPageSource};

pub const LARGE_PAGE_SIZE: u64 = 0x20_0000;
pub const SMALL_PER_LARGE: u64 = LARGE_PAGE_SIZE / PAGE_SIZE;

pub const SMALL_CAPACITY: usize = 4096;
pub const LARGE_CAPACITY: usize = 256;

struct Ring<const N: usize> {
    slots: [u64; N],
    head: usize,
    len: usize,
}

impl<const N: usize> Ring<N> {
    const fn new() -> Self {
        Ring { slots: [0; N], head: 0, len: 0 }
    }

    fn push(&mut self, value: u64) -> bool {
        if self.len == N {
            return false;
        }
        self.slots[(self.head + self.len) % N] = value;
        self.len += 1;
        true
    }

    fn pop(&mut self) -> Option<u64> {
        if self.len == 0 {
            return None;
        }
        let v = self.slots[self.head];
        self.head = (self.head + 1) % N;
        self.len -= 1;
        Some(v)
    }

    fn free_space(&self) -> usize {
        N - self.len
    }

    /// 条件に合う最初の要素を抜く（順番は崩れてよい）
    fn remove_where(&mut self, pred: impl Fn(u64) -> bool) -> Option<u64> {
        let found = (0..self.len).find(|i| pred(self.slots[(self.head + i) % N]))?;
        let at = (self.head + found) % N;
        let last = (self.head + self.len - 1) % N;
        let v = self.slots[at];
        self.slots[at] = self.slots[last];
        self.len -= 1;
        Some(v)
    }
}

pub struct TwoTierSource {
    small: Mutex<Ring<SMALL_CAPACITY>>,
    large: Mutex<Ring<LARGE_CAPACITY>>,
}

impl TwoTierSource {
    pub const fn new() -> Self {
        TwoTierSource {
            small: Mutex::new(Ring::new()),
            large: Mutex::new(Ring::new()),
        }
    }

    /// 空き範囲を加える。戻り値は受け取れたページ数（4KiB 単位）。
    pub fn add_range(&self, range: PhysRange) -> u64 {
        if !range.is_usable() {
            return 0;
        }

        let mut small = self.small.lock();
        let mut large = self.large.lock();
        let end = range.end().0;
        let mut added = 0;
        let mut dropped = 0;

        let mut pages = range.pages();
        while let Some(page) = pages.next() {
            // 物理 0 番は配らない
            if page.0 == 0 {
                continue;
            }
            let block_fits = page.0 % LARGE_PAGE_SIZE == 0 && end - page.0 >= LARGE_PAGE_SIZE;
            if block_fits && large.push(page.0) {
                added += SMALL_PER_LARGE;
                // ブロックの残り 511 枚を飛ばす
                let _ = pages.nth(SMALL_PER_LARGE as usize - 2);
                continue;
            }
            if small.push(page.0) {
                added += 1;
            } else {
                dropped += 1;
            }
        }

        if dropped != 0 {
            logging::warn_fmt(format_args!("mm::two_tier::add_range: dropped {} pages of {}", dropped, range));
        }
        added
    }

    pub fn small_count(&self) -> usize {
        self.small.lock().len
    }

    pub fn large_count(&self) -> usize {
        self.large.lock().len
    }
}

impl Default for TwoTierSource {
    fn default() -> Self {
        Self::new()
    }
}

impl PhysicalPageSource for TwoTierSource {
    fn begin_alloc(&self) -> Result<PageOffer<'_>, AllocError> {
        let mut small = self.small.lock();
        if let Some(p) = small.pop() {
            return Ok(PageOffer::immediate(PhysAddr(p)));
        }

        let block = match self.large.lock().pop() {
            Some(b) => b,
            None => return Err(AllocError::Exhausted),
        };
        // small は空なので 511 枚は必ず入る
        for i in 1..SMALL_PER_LARGE {
            small.push(block + i * PAGE_SIZE);
        }
        Ok(PageOffer::immediate(PhysAddr(block)))
    }

    fn release(&self, phys: PhysAddr) {
        if phys.0 == 0 {
            return;
        }
        if !self.small.lock().push(phys.page_base().0) {
            logging::warn_fmt(format_args!("mm::two_tier::release: small ring full, {} lost", phys));
        }
    }

    fn mark_used(&self, phys: PhysAddr) {
        let page = phys.page_base().0;
        let mut small = self.small.lock();
        if small.remove_where(|p| p == page).is_some() {
            return;
        }

        let mut large = self.large.lock();
        let block = match large.remove_where(|b| b <= page && page - b < LARGE_PAGE_SIZE) {
            Some(b) => b,
            None => return,
        };
        if small.free_space() < SMALL_PER_LARGE as usize - 1 {
            // 割れないならブロックごと使用中にする
            logging::warn_fmt(format_args!("mm::two_tier::mark_used: block {:#x} retired", block));
            return;
        }
        for i in 0..SMALL_PER_LARGE {
            let p = block + i * PAGE_SIZE;
            if p != page {
                small.push(p);
            }
        }
    }

    fn free_pages(&self) -> u64 {
        let small = self.small.lock();
        let large = self.large.lock();
        small.len as u64 + large.len as u64 * SMALL_PER_LARGE
    }
}
