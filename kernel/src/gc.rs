// kernel/src/gc.rs
//
// 役割:
// - ガベージコレクタとの境界（外部協力者）を trait で表す。
//
// やること:
// - 「今すぐ回収してほしい」通知（物理ページが少なくなったとき）
// - 「この仮想範囲を root として走査してほしい」登録（root 指定の region 確保時）
//
// やらないこと:
// - トレースや回収そのもの

use crate::mem::addr::VirtAddr;

pub trait GcHooks: Sync {
    fn request_collection(&self) {}

    /// [start, end) を root 範囲として登録する
    fn add_roots(&self, start: VirtAddr, end: VirtAddr) {
        let _ = (start, end);
    }
}

/// GC がまだ居ない（ブート直後など）ときの既定
pub struct NoGc;

impl GcHooks for NoGc {}

pub static NO_GC: NoGc = NoGc;
