//! Terminal keystrokes to HID usage codes
//!
//! Decodes the bytes a raw-mode terminal produces: printable ASCII, control
//! characters as `ctrl+letter`, DEL as backspace and the common CSI cursor
//! sequences. Ctrl-] (0x1d) leaves live mode and is never forwarded.

use tracing::trace;

use super::keymap::{char_to_usb, usb};
use super::types::KeyboardModifiers;

/// Byte sent by Ctrl-]
pub const LEAVE_BYTE: u8 = 0x1d;

const ESC: u8 = 0x1b;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveInput {
    Key(u8, KeyboardModifiers),
    Leave,
}

/// Decode one read from the terminal
///
/// Escape sequences are matched within `bytes` only; an ESC not followed by a
/// known sequence is sent as the Escape key. Anything after `Leave` is dropped.
pub fn decode_input(bytes: &[u8]) -> Vec<LiveInput> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        i += 1;

        if b == LEAVE_BYTE {
            out.push(LiveInput::Leave);
            break;
        }

        if b == ESC {
            if let (Some(b'['), Some(&last)) = (bytes.get(i), bytes.get(i + 1)) {
                if let Some(code) = csi_key(last) {
                    out.push(LiveInput::Key(code, KeyboardModifiers::default()));
                    i += 2;
                    continue;
                }
            }
            out.push(LiveInput::Key(usb::KEY_ESCAPE, KeyboardModifiers::default()));
            continue;
        }

        match byte_to_key(b) {
            Some((code, modifiers)) => out.push(LiveInput::Key(code, modifiers)),
            None => trace!("No key for byte 0x{:02x}", b),
        }
    }

    out
}

/// Map a single terminal byte to a key and its modifiers
pub fn byte_to_key(b: u8) -> Option<(u8, KeyboardModifiers)> {
    let plain = KeyboardModifiers::default();
    match b {
        b'\r' | b'\n' => Some((usb::KEY_ENTER, plain)),
        b'\t' => Some((usb::KEY_TAB, plain)),
        0x08 | 0x7f => Some((usb::KEY_BACKSPACE, plain)),
        // Ctrl-A through Ctrl-Z
        0x01..=0x1a => Some((
            usb::KEY_A + (b - 0x01),
            KeyboardModifiers {
                left_ctrl: true,
                ..Default::default()
            },
        )),
        _ => {
            let (code, shift) = char_to_usb(b as char)?;
            let modifiers = if shift { KeyboardModifiers::shift() } else { plain };
            Some((code, modifiers))
        }
    }
}

fn csi_key(last: u8) -> Option<u8> {
    Some(match last {
        b'A' => usb::KEY_UP_ARROW,
        b'B' => usb::KEY_DOWN_ARROW,
        b'C' => usb::KEY_RIGHT_ARROW,
        b'D' => usb::KEY_LEFT_ARROW,
        b'H' => usb::KEY_HOME,
        b'F' => usb::KEY_END,
        _ => return None,
    })
}
