// kernel/src/kernel/demo/mod.rs
//
// 役割:
// - ブート直後の動作確認（fault injection）を entry.rs から分離する。
// - feature で切り替わる “実験用分岐” をここに閉じ込める。
//
// 設計方針:
// - feature off でもコンパイルできるように、run() は常に存在させる
// - 実アドレスへ触れるので bare-metal でだけ意味を持つ

pub mod mem_faults;

use crate::arch::paging::MemoryBus;

use super::Kernel;

/// Kernel 登録後、tick を回す前に呼ぶ
pub fn run<B: MemoryBus>(kernel: &Kernel<'_, B>) {
    mem_faults::run(kernel);
}
