//! PS/2 keyboard driver.
//!
//! Grounded in the teacher's scan-code match table shape, supplemented from
//! `original_source/main64/kernel/drivers/keyboard.c`'s modifier tracking (Shift, CapsLock,
//! LCtrl -- the teacher's own keyboard code only tracked Shift). Publishes the last printable
//! character to a single-slot buffer (§4.4, §9 "keyboard single-slot buffer"): races between the
//! IRQ1 publisher and a polling consumer are benign only because both run with interrupts
//! disabled on a single CPU, exactly as §9 notes.

use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use x86_64::instructions::port::Port;

const DATA_PORT: Port<u8> = Port::new(0x60);

const SCANCODE_LSHIFT_DOWN: u8 = 0x2A;
const SCANCODE_LSHIFT_UP: u8 = 0xAA;
const SCANCODE_RSHIFT_DOWN: u8 = 0x36;
const SCANCODE_RSHIFT_UP: u8 = 0xB6;
const SCANCODE_CAPSLOCK_DOWN: u8 = 0x3A;
const SCANCODE_LCTRL_DOWN: u8 = 0x1D;
const SCANCODE_LCTRL_UP: u8 = 0x9D;

static SHIFT: AtomicBool = AtomicBool::new(false);
static CAPS_LOCK: AtomicBool = AtomicBool::new(false);
static LCTRL: AtomicBool = AtomicBool::new(false);

/// The single-slot published character, 0 meaning "empty". Overwritten unconditionally by the
/// next keypress: a consumer that doesn't poll often enough silently loses characters, which
/// matches the data model's single-slot contract, not a growable queue.
static BUFFER: AtomicU8 = AtomicU8::new(0);

const US_LOWER: [u8; 59] = [
    0, 0, b'1', b'2', b'3', b'4', b'5', b'6', b'7', b'8', b'9', b'0', b'-', b'=', 8, b'\t', b'q',
    b'w', b'e', b'r', b't', b'y', b'u', b'i', b'o', b'p', b'[', b']', b'\n', 0, b'a', b's', b'd',
    b'f', b'g', b'h', b'j', b'k', b'l', b';', b'\'', b'`', 0, b'\\', b'z', b'x', b'c', b'v', b'b',
    b'n', b'm', b',', b'.', b'/', 0, b'*', 0, b' ', 0,
];

const US_UPPER: [u8; 59] = [
    0, 0, b'!', b'@', b'#', b'$', b'%', b'^', b'&', b'*', b'(', b')', b'_', b'+', 8, b'\t', b'Q',
    b'W', b'E', b'R', b'T', b'Y', b'U', b'I', b'O', b'P', b'{', b'}', b'\n', 0, b'A', b'S', b'D',
    b'F', b'G', b'H', b'J', b'K', b'L', b':', b'"', b'~', 0, b'|', b'Z', b'X', b'C', b'V', b'B',
    b'N', b'M', b'<', b'>', b'?', 0, b'*', 0, b' ', 0,
];

/// Called from the IRQ1 trampoline with interrupts disabled.
pub fn handler() {
    let scancode = unsafe { DATA_PORT.read() };
    handle_scancode(scancode);
}

/// The modifier state machine and US scan-code translation, kept separate from the port read
/// above so it can be driven with a scripted scancode sequence in host-run tests.
fn handle_scancode(scancode: u8) {
    match scancode {
        SCANCODE_LSHIFT_DOWN | SCANCODE_RSHIFT_DOWN => {
            SHIFT.store(true, Ordering::Relaxed);
            return;
        }
        SCANCODE_LSHIFT_UP | SCANCODE_RSHIFT_UP => {
            SHIFT.store(false, Ordering::Relaxed);
            return;
        }
        SCANCODE_CAPSLOCK_DOWN => {
            let cur = CAPS_LOCK.load(Ordering::Relaxed);
            CAPS_LOCK.store(!cur, Ordering::Relaxed);
            return;
        }
        SCANCODE_LCTRL_DOWN => {
            LCTRL.store(true, Ordering::Relaxed);
            return;
        }
        SCANCODE_LCTRL_UP => {
            LCTRL.store(false, Ordering::Relaxed);
            return;
        }
        _ => {}
    }

    // Key-up (high bit set) of anything else: ignored, no release semantics beyond modifiers.
    if scancode & 0x80 != 0 {
        return;
    }

    let index = scancode as usize;
    if index >= US_LOWER.len() {
        return;
    }

    let shifted = SHIFT.load(Ordering::Relaxed) ^ CAPS_LOCK.load(Ordering::Relaxed);
    let mut ch = if shifted { US_UPPER[index] } else { US_LOWER[index] };
    if ch == 0 {
        return;
    }

    if LCTRL.load(Ordering::Relaxed) && ch.is_ascii_alphabetic() {
        ch = ch.to_ascii_uppercase() & 0x1F;
    }

    BUFFER.store(ch, Ordering::Relaxed);
}

/// Consume the published character, returning 0 if nothing has been typed since the last call.
pub fn getchar() -> u8 {
    BUFFER.swap(0, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reset the modifier state machine between tests -- these are process-global atomics, so
    /// tests that don't do this would otherwise see whichever modifier state the previous test
    /// left behind.
    fn reset() {
        SHIFT.store(false, Ordering::Relaxed);
        CAPS_LOCK.store(false, Ordering::Relaxed);
        LCTRL.store(false, Ordering::Relaxed);
        BUFFER.store(0, Ordering::Relaxed);
    }

    #[test]
    fn lowercase_key_without_modifiers() {
        reset();
        handle_scancode(0x1E); // 'a' down
        assert_eq!(getchar(), b'a');
    }

    #[test]
    fn held_shift_uppercases_letters_and_releases_cleanly() {
        reset();
        handle_scancode(SCANCODE_LSHIFT_DOWN);
        handle_scancode(0x1E); // 'a' down, while shift held
        assert_eq!(getchar(), b'A');

        handle_scancode(SCANCODE_LSHIFT_UP);
        handle_scancode(0x1E); // 'a' down, shift released
        assert_eq!(getchar(), b'a');
    }

    #[test]
    fn caps_lock_toggles_and_combines_with_shift_via_xor() {
        reset();
        handle_scancode(SCANCODE_CAPSLOCK_DOWN);
        handle_scancode(0x1E); // 'a' down, caps on -> upper
        assert_eq!(getchar(), b'A');

        handle_scancode(SCANCODE_LSHIFT_DOWN);
        handle_scancode(0x1E); // 'a' down, caps on AND shift held -> XOR cancels out -> lower
        assert_eq!(getchar(), b'a');

        handle_scancode(SCANCODE_CAPSLOCK_DOWN); // toggle off
        handle_scancode(0x1E); // shift still held, caps off -> upper
        assert_eq!(getchar(), b'A');
    }

    #[test]
    fn held_lctrl_maps_letters_to_control_codes() {
        reset();
        handle_scancode(SCANCODE_LCTRL_DOWN);
        handle_scancode(0x2E); // 'c' down -> Ctrl-C, 0x03
        assert_eq!(getchar(), 0x03);

        handle_scancode(SCANCODE_LCTRL_UP);
        handle_scancode(0x2E); // 'c' down, ctrl released -> plain 'c'
        assert_eq!(getchar(), b'c');
    }

    #[test]
    fn key_up_of_a_printable_key_publishes_nothing() {
        reset();
        handle_scancode(0x1E | 0x80); // key-up of 'a'
        assert_eq!(getchar(), 0);
    }

    #[test]
    fn out_of_range_scancode_is_ignored() {
        reset();
        handle_scancode(0xFF);
        assert_eq!(getchar(), 0);
    }
}
