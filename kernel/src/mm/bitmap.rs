// kernel/src/mm/bitmap.rs
//
// 低位物理メモリ（0 .. ceiling）を 1 ページ 1 bit で管理するビットマップ。
// - bit = 1 が空き
// - next_hint: 空きがあるかもしれない最小の u64 index
// - 範囲外アドレスは呼び出し側（Pmem）で弾く前提。ここでは黙って無視する。

use crate::mem::addr::{PhysAddr, PAGE_SIZE};

pub struct Bitmap<const WORDS: usize> {
    words: [u64; WORDS],
    next_hint: usize,
    free_count: u64,
}

impl<const WORDS: usize> Bitmap<WORDS> {
    /// 管理できる上限（排他的）
    pub const CEILING: u64 = (WORDS as u64) * 64 * PAGE_SIZE;

    /// 全ページ使用中で始める（空きは release で教えてもらう）
    pub const fn new() -> Self {
        Bitmap {
            words: [0; WORDS],
            next_hint: 0,
            free_count: 0,
        }
    }

    fn locate(addr: PhysAddr) -> Option<(usize, u64)> {
        if addr.0 >= Self::CEILING {
            return None;
        }
        let page = addr.0 / PAGE_SIZE;
        Some(((page / 64) as usize, 1u64 << (page % 64)))
    }

    pub fn free_count(&self) -> u64 {
        self.free_count
    }

    pub fn is_free(&self, addr: PhysAddr) -> bool {
        match Self::locate(addr) {
            Some((i, bit)) => self.words[i] & bit != 0,
            None => false,
        }
    }

    /// 空きにする。既に空きなら何もしない。
    pub fn release(&mut self, addr: PhysAddr) {
        if let Some((i, bit)) = Self::locate(addr) {
            if self.words[i] & bit == 0 {
                self.words[i] |= bit;
                self.free_count += 1;
                if i < self.next_hint {
                    self.next_hint = i;
                }
            }
        }
    }

    /// 指定ページを使用中にする。空きだったら true。
    pub fn take(&mut self, addr: PhysAddr) -> bool {
        match Self::locate(addr) {
            Some((i, bit)) if self.words[i] & bit != 0 => {
                self.words[i] &= !bit;
                self.free_count -= 1;
                true
            }
            _ => false,
        }
    }

    /// 最も低い空きページを 1 つ取る
    pub fn take_any(&mut self) -> Option<PhysAddr> {
        if self.free_count == 0 {
            return None;
        }
        for i in self.next_hint..WORDS {
            let w = self.words[i];
            if w != 0 {
                let bit = w.trailing_zeros() as u64;
                self.words[i] = w & !(1u64 << bit);
                self.free_count -= 1;
                self.next_hint = i;
                return Some(PhysAddr((i as u64 * 64 + bit) * PAGE_SIZE));
            }
        }
        None
    }
}

impl<const WORDS: usize> Default for Bitmap<WORDS> {
    fn default() -> Self {
        Self::new()
    }
}
