// kernel/src/kernel/entry.rs
//
// 役割:
// - bootloader から受け取った情報で部品を組み立て、Kernel を登録して動かし始める
//
// やること:
// - 再帰スロットを入れ、GDT/TSS/IDT をロード
// - init_memory（空き物理範囲の登録・ゼロページ・populate）
// - Scheduler / FaultStackPool / FaultDispatcher を作り、state_ref に登録
// - ブート文脈を "boot" スレッドとして採用し、tick を回す
//
// やらないこと:
// - レジスタ文脈の切り替え（LoggingSwitch は切り替え先を記録するだけ）
// - タイマ割り込みの設定（tick はループから直接入れる）

use bootloader::bootinfo::{BootInfo, MemoryRegionType};

use crate::arch::gdt::{self, TssFaultStacks};
use crate::arch::paging::{self, DirectBus, PageTableView};
use crate::arch::virt_layout::{PAGE_TABLE_WINDOW_BASE, RECURSIVE_INDEX};
use crate::kernel::event::{EventTable, NoProbe};
use crate::kernel::fault::FaultDispatcher;
use crate::kernel::fault_stack::FaultStackPool;
use crate::kernel::sched::{ContextSwitch, Scheduler};
use crate::kernel::thread::{ThreadId, DEFAULT_PRIORITY};
use crate::mem::addr::{PhysAddr, VirtAddr};
use crate::mem::layout::DEFAULT_STACK_SIZE;
use crate::mem::regions::RegionTable;
use crate::mm::{PageTableManager, PhysRange, Pmem};
use crate::{arch, logging};

use super::{demo, init_memory, state_ref, Kernel, TICK};

/// bootloader 0.9 はカーネル ELF をリンクアドレスにそのまま置く。
/// 先頭 2MiB 境界からこの長さを image として扱う。
const IMAGE_RESERVE: u64 = 0x40_0000;
const IMAGE_ALIGN: u64 = 0x20_0000;

const MAX_BOOT_RANGES: usize = 64;
const BOOT_TICKS: usize = 32;

static REGIONS: RegionTable = RegionTable::new();
static EVENTS: EventTable = EventTable::new();
static PMEM: Pmem = Pmem::new();
static BUS: DirectBus = DirectBus;

struct LoggingSwitch;

impl ContextSwitch for LoggingSwitch {
    fn switch_to(&self, from: Option<ThreadId>, to: ThreadId) {
        match from {
            Some(f) => logging::info_fmt(format_args!("kernel::sched: switch {} -> {}", f.0, to.0)),
            None => logging::info_fmt(format_args!("kernel::sched: switch - -> {}", to.0)),
        }
    }
}

fn usable_ranges(boot_info: &BootInfo, out: &mut [PhysRange; MAX_BOOT_RANGES]) -> usize {
    let mut n = 0;
    for r in boot_info.memory_map.iter() {
        if r.region_type != MemoryRegionType::Usable {
            continue;
        }
        if n == out.len() {
            logging::warn("kernel::entry: too many usable ranges; rest ignored");
            break;
        }
        let start = r.range.start_addr();
        out[n] = PhysRange::new(PhysAddr(start), r.range.end_addr() - start);
        n += 1;
    }
    n
}

pub fn kernel_main(boot_info: &'static BootInfo) -> ! {
    logging::init();
    logging::info("kernel_main: start");

    let root = unsafe { paging::install_recursive_slot(boot_info.physical_memory_offset, RECURSIVE_INDEX) };
    logging::info_hex("kernel_main: pml4", root.0);

    arch::init();

    let mut free = [PhysRange::new(PhysAddr(0), 0); MAX_BOOT_RANGES];
    let n = usable_ranges(boot_info, &mut free);
    logging::info_u64("kernel_main: usable ranges", n as u64);

    let image_base = VirtAddr((kernel_main as usize as u64) & !(IMAGE_ALIGN - 1));

    let ptm = PageTableManager::new(PageTableView::new(&BUS, VirtAddr(PAGE_TABLE_WINDOW_BASE)), &PMEM);
    match init_memory(&REGIONS, &EVENTS, &ptm, image_base, IMAGE_RESERVE, &free[..n]) {
        Ok(pushed) => logging::info_u64("kernel_main: stack pages", pushed),
        Err(e) => {
            logging::error_fmt(format_args!("kernel_main: init_memory failed: {}", e));
            arch::halt_loop();
        }
    }

    let switch = LoggingSwitch;
    let sched = Scheduler::new(&EVENTS, &NoProbe, &switch, &REGIONS);
    let ist = TssFaultStacks;
    let pool = FaultStackPool::new(gdt::fault_stack_tops(), &ist);
    let faults = FaultDispatcher::new(&REGIONS, &ptm, &sched, &pool);
    let kernel = Kernel {
        regions: &REGIONS,
        events: &EVENTS,
        ptm: &ptm,
        sched: &sched,
        faults: &faults,
    };
    state_ref::register_kernel(&kernel);

    let boot = sched.adopt("boot", DEFAULT_PRIORITY);
    let idle = sched.spawn("idle", 0, DEFAULT_STACK_SIZE).and_then(|id| sched.start(id).map(|_| id));
    match (boot, idle) {
        (Ok(_), Ok(_)) => {}
        (Err(e), _) | (_, Err(e)) => {
            logging::error_fmt(format_args!("kernel_main: thread setup failed: {}", e));
            arch::halt_loop();
        }
    }
    sched.start_running();

    demo::run(&kernel);

    for _ in 0..BOOT_TICKS {
        if let Err(e) = kernel.on_timer(TICK) {
            logging::error_fmt(format_args!("kernel_main: tick failed: {}", e));
            break;
        }
    }

    kernel.dump();
    arch::halt_loop();
}
