// kernel/src/kernel/state_ref.rs
//
// 役割:
// - arch(割り込み) 側から Kernel にアクセスするための “唯一の入口” を提供する。
//
// やること:
// - entry.rs が組み立てた Kernel のアドレスを登録する。
// - 呼び出し側は with_kernel() 経由でのみ &Kernel を得る。
//
// やらないこと:
// - 所有権の移動（Kernel と部品は entry.rs の戻らないスタックフレームが持つ）
// - 可変参照の払い出し（部品はすべて内部可変性で動く）

use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch::paging::DirectBus;

use super::Kernel;

// 0 なら未登録
static KERNEL_ADDR: AtomicU64 = AtomicU64::new(0);

/// entry.rs から 1 回だけ呼ぶ。`kernel` は以後ずっと生きていること。
pub fn register_kernel(kernel: &Kernel<'_, DirectBus>) {
    let addr = kernel as *const Kernel<'_, DirectBus> as u64;
    KERNEL_ADDR.store(addr, Ordering::SeqCst);
}

pub fn with_kernel<R>(f: impl FnOnce(&Kernel<'_, DirectBus>) -> R) -> Option<R> {
    let addr = KERNEL_ADDR.load(Ordering::SeqCst);
    if addr == 0 {
        return None;
    }

    let p = addr as *const Kernel<'static, DirectBus>;

    // Safety:
    // - 登録元は kernel_main の戻らないフレーム
    // - 共有参照しか渡さない
    Some(f(unsafe { &*p }))
}
