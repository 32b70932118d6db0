// src/logging/vga.rs
//
// VGA テキストモード(0xb8000)への出力。
// - init(): Writer を初期化
// - write_prefixed_line(): レベルごとに色を変えて 1 行出す（ロックが取れなければ出さない）
//
// 目的:
// - シリアルが取れない環境でも画面でブートの進み具合が追えること。
// - スクロールは最下行に書いて上へ送るだけの簡易実装。

use core::fmt::{self, Write};
use spin::Mutex;
use volatile::Volatile;

use super::Level;

const BUFFER_HEIGHT: usize = 25;
const BUFFER_WIDTH: usize = 80;

#[derive(Clone, Copy)]
#[repr(u8)]
enum Color {
    Black = 0x0,
    LightGray = 0x7,
    LightRed = 0xC,
    Yellow = 0xE,
}

const fn color_code(fg: Color, bg: Color) -> u8 {
    (fg as u8) | ((bg as u8) << 4)
}

#[repr(C)]
#[derive(Clone, Copy)]
struct ScreenChar {
    ascii_character: u8,
    color_code: u8,
}

#[repr(transparent)]
struct Buffer {
    chars: [[Volatile<ScreenChar>; BUFFER_WIDTH]; BUFFER_HEIGHT],
}

struct Writer {
    col: usize,
    color_code: u8,
    buffer: &'static mut Buffer,
}

impl Writer {
    fn write_byte(&mut self, byte: u8) {
        match byte {
            b'\n' => self.new_line(),
            byte => {
                if self.col >= BUFFER_WIDTH {
                    self.new_line();
                }
                let row = BUFFER_HEIGHT - 1;
                let col = self.col;
                // 表示できない文字は ■ にする
                let ascii_character = match byte {
                    0x20..=0x7e => byte,
                    _ => 0xfe,
                };
                self.buffer.chars[row][col].write(ScreenChar {
                    ascii_character,
                    color_code: self.color_code,
                });
                self.col += 1;
            }
        }
    }

    fn new_line(&mut self) {
        for row in 1..BUFFER_HEIGHT {
            for col in 0..BUFFER_WIDTH {
                let ch = self.buffer.chars[row][col].read();
                self.buffer.chars[row - 1][col].write(ch);
            }
        }
        self.clear_row(BUFFER_HEIGHT - 1);
        self.col = 0;
    }

    fn clear_row(&mut self, row: usize) {
        let blank = ScreenChar {
            ascii_character: b' ',
            color_code: self.color_code,
        };
        for col in 0..BUFFER_WIDTH {
            self.buffer.chars[row][col].write(blank);
        }
    }
}

impl Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for b in s.bytes() {
            self.write_byte(b);
        }
        Ok(())
    }
}

static WRITER: Mutex<Option<Writer>> = Mutex::new(None);

pub fn init() {
    let writer = Writer {
        col: 0,
        color_code: color_code(Color::LightGray, Color::Black),
        buffer: unsafe { &mut *(0xb8000 as *mut Buffer) },
    };
    *WRITER.lock() = Some(writer);
}

pub fn write_prefixed_line(level: Level, args: fmt::Arguments<'_>) {
    let color = match level {
        Level::Info => Color::LightGray,
        Level::Warn => Color::Yellow,
        Level::Error => Color::LightRed,
    };

    // 割り込まれた側が持っていたら待たずに捨てる（COM1 には出る）
    super::try_with(&WRITER, |writer| {
        if let Some(w) = writer {
            w.color_code = color_code(color, Color::Black);
            let _ = w.write_str(level.prefix());
            let _ = w.write_fmt(args);
            let _ = w.write_str("\n");
        }
    });
}
