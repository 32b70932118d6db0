// kernel/src/arch/interrupts.rs
//
// 役割:
// - IDT を初期化・ロードする
// - #PF を kernel::fault へ渡す（demand paging と致命ダンプの入口）
//
// 設計方針:
// - #PF は fault スタックプール上（IST2）で受ける。IST の切り替えは kernel::fault_stack が行う
// - #PF 以外の例外は fail-stop（緊急出力して停止）
// - 緊急出力はロックを取らない（fault 処理中のロックと競合させない）

use core::arch::asm;

use spin::Once;
use x86_64::instructions::interrupts;
use x86_64::instructions::port::Port;
use x86_64::registers::control::Cr2;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use crate::arch::gdt;
use crate::kernel::fault::{FaultCode, FaultRecord};
use crate::kernel::state_ref;
use crate::kernel::unwind::NoSymbols;
use crate::logging::{self, SerialWriter};
use crate::mem::addr::VirtAddr;

static IDT: Once<InterruptDescriptorTable> = Once::new();

pub fn init() {
    let idt = IDT.call_once(|| {
        let mut idt = InterruptDescriptorTable::new();
        unsafe {
            idt.page_fault
                .set_handler_fn(page_fault_handler)
                .set_stack_index(gdt::PAGE_FAULT_IST_INDEX);
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX);
        }
        idt.general_protection_fault.set_handler_fn(general_protection_fault_handler);
        idt
    });
    idt.load();
    logging::info("arch::interrupts::init: IDT loaded");
}

// ---- emergency output ----

fn emergency_write_byte(b: u8) {
    unsafe {
        Port::<u8>::new(0xE9).write(b);
        let mut lsr = Port::<u8>::new(0x3FD);
        let mut data = Port::<u8>::new(0x3F8);
        for _ in 0..10_000 {
            if (lsr.read() & 0x20) != 0 {
                break;
            }
        }
        data.write(b);
    }
}

pub(crate) fn emergency_write_str(s: &str) {
    for b in s.bytes() {
        emergency_write_byte(b);
    }
}

pub(crate) fn emergency_write_hex_u64(v: u64) {
    emergency_write_str("0x");
    for i in (0..16).rev() {
        let n = ((v >> (i * 4)) & 0xF) as u8;
        let c = if n < 10 { b'0' + n } else { b'a' + (n - 10) };
        emergency_write_byte(c);
    }
}

#[inline(always)]
fn read_rbp() -> u64 {
    let rbp: u64;
    unsafe { asm!("mov {}, rbp", out(reg) rbp, options(nomem, nostack, preserves_flags)) };
    rbp
}

// ---- exception handlers ----

extern "x86-interrupt" fn page_fault_handler(stack_frame: InterruptStackFrame, error_code: PageFaultErrorCode) {
    let addr = Cr2::read().map(|va| va.as_u64()).unwrap_or(0);
    let mut rec = FaultRecord::new(VirtAddr(addr), FaultCode::from_bits_truncate(error_code.bits()));
    rec.rip = stack_frame.instruction_pointer.as_u64();
    rec.rsp = stack_frame.stack_pointer.as_u64();
    rec.rflags = stack_frame.cpu_flags.bits();
    // handler 自身のフレームから辿る（割り込まれた側の rbp はその先にある）
    rec.rbp = read_rbp();

    let outcome = state_ref::with_kernel(|k| k.on_page_fault(&rec, &mut SerialWriter, &NoSymbols));
    match outcome {
        Some(Ok(_)) => {}
        Some(Err(_)) => {
            interrupts::disable();
            crate::arch::halt_loop();
        }
        None => {
            interrupts::disable();
            emergency_write_str("[EXC] #PF before kernel registration");
            emergency_write_str(" cr2=");
            emergency_write_hex_u64(addr);
            emergency_write_str(" err=");
            emergency_write_hex_u64(error_code.bits());
            emergency_write_str(" rip=");
            emergency_write_hex_u64(rec.rip);
            emergency_write_str("\n");
            crate::arch::halt_loop();
        }
    }
}

extern "x86-interrupt" fn general_protection_fault_handler(stack_frame: InterruptStackFrame, error_code: u64) {
    interrupts::disable();

    emergency_write_str("[EXC] #GP err=");
    emergency_write_hex_u64(error_code);
    emergency_write_str(" rip=");
    emergency_write_hex_u64(stack_frame.instruction_pointer.as_u64());
    emergency_write_str(" rsp=");
    emergency_write_hex_u64(stack_frame.stack_pointer.as_u64());
    emergency_write_str("\n");

    crate::arch::halt_loop();
}

extern "x86-interrupt" fn double_fault_handler(stack_frame: InterruptStackFrame, error_code: u64) -> ! {
    interrupts::disable();

    emergency_write_str("[EXC] #DF err=");
    emergency_write_hex_u64(error_code);
    emergency_write_str(" rip=");
    emergency_write_hex_u64(stack_frame.instruction_pointer.as_u64());
    emergency_write_str(" rsp=");
    emergency_write_hex_u64(stack_frame.stack_pointer.as_u64());
    emergency_write_str("\n");

    crate::arch::halt_loop()
}
