// kernel/src/logging/serial.rs
//
// COM1 (0x3F8) へのシリアル出力。
// - init(): 115200bps, 8N1 に初期化（二重初期化はしない）
// - write_prefixed_line(): "[LEVEL] " + 書式付き本文 + CRLF
// - SerialWriter: fault dump の出力先（fmt::Write）としても使う

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicBool, Ordering};

use x86_64::instructions::port::Port;

const COM1: u16 = 0x3F8;

static SERIAL_INITIALIZED: AtomicBool = AtomicBool::new(false);

pub fn init() {
    if SERIAL_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    unsafe {
        Port::<u8>::new(COM1 + 1).write(0x00); // 割り込み無効

        Port::<u8>::new(COM1 + 3).write(0x80); // DLAB
        Port::<u8>::new(COM1).write(0x01); // divisor low  (115200)
        Port::<u8>::new(COM1 + 1).write(0x00); // divisor high

        Port::<u8>::new(COM1 + 3).write(0x03); // 8N1
        Port::<u8>::new(COM1 + 2).write(0xC7); // FIFO
        Port::<u8>::new(COM1 + 4).write(0x0B);
    }
}

fn write_byte(byte: u8) {
    unsafe {
        let mut line_status = Port::<u8>::new(COM1 + 5);
        let mut data = Port::<u8>::new(COM1);

        while (line_status.read() & 0x20) == 0 {}

        data.write(byte);
    }
}

pub fn write_str(s: &str) {
    for b in s.bytes() {
        if b == b'\n' {
            write_byte(b'\r');
        }
        write_byte(b);
    }
}

pub fn write_prefixed_line(prefix: &str, args: fmt::Arguments<'_>) {
    let mut w = SerialWriter;
    write_str(prefix);
    let _ = w.write_fmt(args);
    write_str("\n");
}

/// fmt::Write 実装。ロックを取らないので fault dump の出力先にも使える。
pub struct SerialWriter;

impl fmt::Write for SerialWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        write_str(s);
        Ok(())
    }
}
