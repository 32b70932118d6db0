// kernel/src/mem/mod.rs
//
// 役割:
// - 仮想アドレス空間まわりのサブモジュールをまとめる中継点。
// - addr.rs / paging.rs / layout.rs / regions.rs を公開する。

pub mod addr;
pub mod layout;
pub mod paging;
pub mod regions;

#[cfg(test)]
mod tests_prop;
