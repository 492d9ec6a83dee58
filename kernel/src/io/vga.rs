//! The VGA text-mode buffer: an 80×25 array of {char, attribute} cells at physical `0xB8000`,
//! reachable directly because the VMM's identity map (PML4 slot 0, §4.2) covers the first 2 MiB
//! in every address space. Cursor position is a separate piece of state read back through the
//! CRT controller's index/data port pair (`0x3D4`/`0x3D5`), per §6.

use spin::Mutex;

use x86_64::instructions::port::Port;

const VGA_BUFFER: u64 = 0xB8000;
const WIDTH: usize = 80;
const HEIGHT: usize = 25;
const DEFAULT_ATTR: u8 = 0x07; // light grey on black, same as every other teaching kernel's default

const CRTC_INDEX: Port<u8> = Port::new(0x3D4);
const CRTC_DATA: Port<u8> = Port::new(0x3D5);
const CURSOR_LOCATION_HIGH: u8 = 0x0E;
const CURSOR_LOCATION_LOW: u8 = 0x0F;

/// (row, col) of the next character `write_str` will place — also what `getcursor` reports.
static CURSOR: Mutex<(u8, u8)> = Mutex::new((0, 0));

fn buffer() -> &'static mut [[u16; WIDTH]; HEIGHT] {
    unsafe { &mut *(VGA_BUFFER as *mut [[u16; WIDTH]; HEIGHT]) }
}

fn cell(ch: u8) -> u16 {
    (DEFAULT_ATTR as u16) << 8 | ch as u16
}

pub fn init() {
    clear_screen();
}

pub fn clear_screen() {
    let buf = buffer();
    for row in buf.iter_mut() {
        for c in row.iter_mut() {
            *c = cell(b' ');
        }
    }
    *CURSOR.lock() = (0, 0);
    sync_hardware_cursor(0, 0);
}

/// Scroll every row up by one, blanking the new bottom row. Called when output reaches the last
/// row instead of wrapping, the same "line discipline" every VGA-text teaching kernel implements.
fn scroll() {
    let buf = buffer();
    for row in 0..HEIGHT - 1 {
        buf[row] = buf[row + 1];
    }
    for c in buf[HEIGHT - 1].iter_mut() {
        *c = cell(b' ');
    }
}

fn advance(row: &mut u8, col: &mut u8) {
    *col += 1;
    if *col as usize >= WIDTH {
        *col = 0;
        *row += 1;
    }
    if *row as usize >= HEIGHT {
        scroll();
        *row = HEIGHT as u8 - 1;
    }
}

/// Write a string, honoring `\n` and `\t` and wrapping/scrolling at the edges. `printf` and the
/// FAT12 root-directory listing both funnel through this.
pub fn write_str(s: &str) {
    let mut pos = CURSOR.lock();
    let (mut row, mut col) = *pos;
    for &b in s.as_bytes() {
        match b {
            b'\n' => {
                col = 0;
                row += 1;
                if row as usize >= HEIGHT {
                    scroll();
                    row = HEIGHT as u8 - 1;
                }
            }
            b'\t' => {
                for _ in 0..4 {
                    buffer()[row as usize][col as usize] = cell(b' ');
                    advance(&mut row, &mut col);
                }
            }
            8 => {
                // backspace
                if col > 0 {
                    col -= 1;
                } else if row > 0 {
                    row -= 1;
                    col = WIDTH as u8 - 1;
                }
                buffer()[row as usize][col as usize] = cell(b' ');
            }
            _ => {
                buffer()[row as usize][col as usize] = cell(b);
                advance(&mut row, &mut col);
            }
        }
    }
    *pos = (row, col);
    sync_hardware_cursor(row, col);
}

fn sync_hardware_cursor(row: u8, col: u8) {
    let offset = row as u16 * WIDTH as u16 + col as u16;
    unsafe {
        CRTC_INDEX.write(CURSOR_LOCATION_HIGH);
        CRTC_DATA.write((offset >> 8) as u8);
        CRTC_INDEX.write(CURSOR_LOCATION_LOW);
        CRTC_DATA.write((offset & 0xFF) as u8);
    }
}

pub fn get_cursor() -> (u8, u8) {
    *CURSOR.lock()
}

pub fn set_cursor(row: u8, col: u8) {
    let row = row.min(HEIGHT as u8 - 1);
    let col = col.min(WIDTH as u8 - 1);
    *CURSOR.lock() = (row, col);
    sync_hardware_cursor(row, col);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_packs_attribute_and_char() {
        let c = cell(b'A');
        assert_eq!(c & 0xFF, b'A' as u16);
        assert_eq!(c >> 8, DEFAULT_ATTR as u16);
    }
}
