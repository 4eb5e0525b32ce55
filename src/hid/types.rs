//! Keyboard event and report types

use serde::{Deserialize, Serialize};

/// First and last usage of the modifier range (Left Control .. Right GUI)
pub const MODIFIER_FIRST: u8 = 0xE0;
pub const MODIFIER_LAST: u8 = 0xE7;

/// Keyboard event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyEventType {
    /// Key pressed down
    Down,
    /// Key released
    Up,
}

/// Keyboard modifier flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyboardModifiers {
    #[serde(default)]
    pub left_ctrl: bool,
    #[serde(default)]
    pub left_shift: bool,
    #[serde(default)]
    pub left_alt: bool,
    /// Left Meta (Windows/Super key)
    #[serde(default)]
    pub left_meta: bool,
    #[serde(default)]
    pub right_ctrl: bool,
    #[serde(default)]
    pub right_shift: bool,
    /// Right Alt (AltGr)
    #[serde(default)]
    pub right_alt: bool,
    #[serde(default)]
    pub right_meta: bool,
}

impl KeyboardModifiers {
    /// Only left shift held
    pub fn shift() -> Self {
        Self {
            left_shift: true,
            ..Default::default()
        }
    }

    /// Convert to USB HID modifier byte
    pub fn to_hid_byte(&self) -> u8 {
        [
            self.left_ctrl,
            self.left_shift,
            self.left_alt,
            self.left_meta,
            self.right_ctrl,
            self.right_shift,
            self.right_alt,
            self.right_meta,
        ]
        .iter()
        .enumerate()
        .filter(|(_, held)| **held)
        .fold(0u8, |byte, (bit, _)| byte | (1 << bit))
    }
}

/// Keystroke to inject
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEvent {
    #[serde(rename = "type")]
    pub kind: KeyEventType,
    /// USB HID usage code (page 0x07)
    pub code: u8,
    /// Modifiers held alongside this key
    #[serde(default)]
    pub modifiers: KeyboardModifiers,
}

impl KeyEvent {
    pub fn down(code: u8, modifiers: KeyboardModifiers) -> Self {
        Self {
            kind: KeyEventType::Down,
            code,
            modifiers,
        }
    }

    pub fn up(code: u8, modifiers: KeyboardModifiers) -> Self {
        Self {
            kind: KeyEventType::Up,
            code,
            modifiers,
        }
    }

    /// Modifier byte bit for codes 0xE0..=0xE7
    pub fn modifier_bit(&self) -> Option<u8> {
        (MODIFIER_FIRST..=MODIFIER_LAST)
            .contains(&self.code)
            .then(|| 1 << (self.code - MODIFIER_FIRST))
    }
}

/// USB HID keyboard report (8 bytes)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyboardReport {
    /// Modifier byte
    pub modifiers: u8,
    /// Reserved byte
    pub reserved: u8,
    /// Key codes (up to 6 simultaneous keys)
    pub keys: [u8; 6],
}

impl KeyboardReport {
    /// Convert to bytes for USB HID
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut bytes = [0u8; 8];
        bytes[0] = self.modifiers;
        bytes[1] = self.reserved;
        bytes[2..].copy_from_slice(&self.keys);
        bytes
    }

    /// Add a key to the report; false when all slots are taken
    pub fn add_key(&mut self, key: u8) -> bool {
        if self.keys.contains(&key) {
            return true;
        }
        for slot in &mut self.keys {
            if *slot == 0 {
                *slot = key;
                return true;
            }
        }
        false
    }

    /// Remove a key from the report
    pub fn remove_key(&mut self, key: u8) {
        for slot in &mut self.keys {
            if *slot == key {
                *slot = 0;
            }
        }
        // Compact the array
        self.keys.sort_by(|a, b| b.cmp(a));
    }

    /// Clear all keys and modifiers
    pub fn clear(&mut self) {
        self.modifiers = 0;
        self.keys = [0; 6];
    }
}
