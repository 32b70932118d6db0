// kernel/src/arch/gdt.rs
//
// 役割:
// - GDT と TSS を初期化してロードする
// - #PF 用の fault スタック（プール）と #DF 用の IST を用意する
//
// やること:
// - init(): GDT/TSS を静的領域に作って GDTR/TR を更新
// - fault_stack_tops(): プール各要素の top を返す（kernel::fault_stack が使う）
// - TssFaultStacks: IST[PAGE_FAULT_IST_INDEX] の書き換え口
//
// やらないこと:
// - ring3 用のユーザセグメント
// - per-cpu 構造（単一CPU前提）
//
// 設計方針:
// - GDT/TSS は “ロード後に動かない” 静的領域へ固定配置
// - CPU は例外のたびに TSS を読み直すので、IST の書き換えは次の #PF から効く
// - IST index は x86_64 crate の set_stack_index と同じ 0-based を使う

use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicBool, Ordering};

use x86_64::instructions::interrupts;
use x86_64::instructions::segmentation::{Segment, CS, DS, ES, SS};
use x86_64::instructions::tables::load_tss;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;

use crate::kernel::fault_stack::{InterruptStackTable, FAULT_STACK_POOL, FAULT_STACK_SIZE};
use crate::logging;
use crate::mem::addr::VirtAddr;

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0; // IST1
pub const PAGE_FAULT_IST_INDEX: u16 = 1; // IST2

const DF_STACK_SIZE: usize = 4096 * 4;
const POOL_STACK_SIZE: usize = FAULT_STACK_SIZE as usize;

static INIT_DONE: AtomicBool = AtomicBool::new(false);

static mut GDT: MaybeUninit<GlobalDescriptorTable> = MaybeUninit::uninit();
static mut TSS: MaybeUninit<TaskStateSegment> = MaybeUninit::uninit();

struct Selectors {
    code: SegmentSelector,
    data: SegmentSelector,
    tss: SegmentSelector,
}

/// `#[repr(align(N))]` は型に付ける必要があるのでラッパで持つ
#[repr(align(16))]
struct AlignedStack<const N: usize> {
    buf: [u8; N],
}

impl<const N: usize> AlignedStack<N> {
    const fn new() -> Self {
        AlignedStack { buf: [0; N] }
    }

    fn top(&self) -> u64 {
        // スタックは下へ伸びるので top = base + size
        self.buf.as_ptr() as u64 + N as u64
    }
}

static mut DF_STACK: AlignedStack<DF_STACK_SIZE> = AlignedStack::new();
static mut FAULT_STACKS: [AlignedStack<POOL_STACK_SIZE>; FAULT_STACK_POOL] =
    [const { AlignedStack::new() }; FAULT_STACK_POOL];

/// プール各要素の top（16 バイト境界）
pub fn fault_stack_tops() -> [VirtAddr; FAULT_STACK_POOL] {
    // Safety: 読むのはアドレスだけ
    let stacks = unsafe { &*core::ptr::addr_of!(FAULT_STACKS) };
    core::array::from_fn(|i| VirtAddr(stacks[i].top() & !0xF))
}

/// TSS の #PF 用 IST を書き換える
pub struct TssFaultStacks;

impl InterruptStackTable for TssFaultStacks {
    fn set_fault_stack(&self, top: VirtAddr) {
        if !INIT_DONE.load(Ordering::SeqCst) {
            return;
        }
        // Safety: init() 後は TSS は動かない。単一CPUで、書くのは fault 経路だけ。
        unsafe {
            let tss = (*core::ptr::addr_of_mut!(TSS)).assume_init_mut();
            tss.interrupt_stack_table[PAGE_FAULT_IST_INDEX as usize] = x86_64::VirtAddr::new(top.0);
        }
    }
}

pub fn init() {
    interrupts::without_interrupts(|| {
        if INIT_DONE.swap(true, Ordering::SeqCst) {
            return;
        }

        unsafe {
            let mut tss = TaskStateSegment::new();
            let df_top = (*core::ptr::addr_of!(DF_STACK)).top() & !0xF;
            let pf_top = fault_stack_tops()[0];
            tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = x86_64::VirtAddr::new(df_top);
            tss.interrupt_stack_table[PAGE_FAULT_IST_INDEX as usize] = x86_64::VirtAddr::new(pf_top.0);

            let tss_ref: &'static TaskStateSegment = (*core::ptr::addr_of_mut!(TSS)).write(tss);

            let mut gdt = GlobalDescriptorTable::new();
            let sel = Selectors {
                code: gdt.append(Descriptor::kernel_code_segment()),
                data: gdt.append(Descriptor::kernel_data_segment()),
                tss: gdt.append(Descriptor::tss_segment(tss_ref)),
            };

            let gdt_ref: &'static GlobalDescriptorTable = (*core::ptr::addr_of_mut!(GDT)).write(gdt);
            gdt_ref.load();

            CS::set_reg(sel.code);
            DS::set_reg(sel.data);
            ES::set_reg(sel.data);
            SS::set_reg(sel.data);
            load_tss(sel.tss);

            logging::info("arch::gdt::init: GDT/TSS loaded");
            logging::info_hex("df_ist_top", df_top);
            logging::info_hex("pf_ist_top", pf_top.0);
        }
    });
}
