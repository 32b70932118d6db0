// kernel/src/main.rs
//
// bootloader 0.9 の入口。中身は demand_kernel::kernel::entry に任せる。

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod boot {
    use bootloader::{entry_point, BootInfo};

    entry_point!(kernel_start);

    fn kernel_start(boot_info: &'static BootInfo) -> ! {
        demand_kernel::kernel::entry::kernel_main(boot_info)
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    eprintln!("demand-kernel runs on bare metal; use `cargo test` on the host");
}
