// kernel/src/lib.rs
//
// demand-kernel: 仮想メモリ領域・物理ページ・demand paging・スケジューラの中核。
//
// - bare-metal(target_os = "none") では bin から kernel::entry を呼ぶ
// - host では cargo test 用に std を使う（ページテーブルは mm::sim 上で動かす）

#![cfg_attr(not(test), no_std)]
#![cfg_attr(target_os = "none", feature(abi_x86_interrupt))]

pub mod arch;
pub mod gc;
pub mod kernel;
pub mod logging;
pub mod mem;
pub mod mm;
pub mod types;

#[cfg(target_os = "none")]
mod panic;
