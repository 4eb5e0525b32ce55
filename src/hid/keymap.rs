//! USB HID keyboard key codes mapping
//!
//! Maps US-layout ASCII characters and key names to USB HID usage codes.
//! Reference: USB HID Usage Tables 1.12, Section 10 (Keyboard/Keypad Page)

use super::types::KeyboardModifiers;

/// USB HID key codes (Usage Page 0x07)
pub mod usb {
    // Letters A-Z (0x04 - 0x1D)
    pub const KEY_A: u8 = 0x04;
    pub const KEY_Z: u8 = 0x1D;

    // Numbers 1-9, 0 (0x1E - 0x27)
    pub const KEY_1: u8 = 0x1E;
    pub const KEY_2: u8 = 0x1F;
    pub const KEY_3: u8 = 0x20;
    pub const KEY_4: u8 = 0x21;
    pub const KEY_5: u8 = 0x22;
    pub const KEY_6: u8 = 0x23;
    pub const KEY_7: u8 = 0x24;
    pub const KEY_8: u8 = 0x25;
    pub const KEY_9: u8 = 0x26;
    pub const KEY_0: u8 = 0x27;

    // Control keys
    pub const KEY_ENTER: u8 = 0x28;
    pub const KEY_ESCAPE: u8 = 0x29;
    pub const KEY_BACKSPACE: u8 = 0x2A;
    pub const KEY_TAB: u8 = 0x2B;
    pub const KEY_SPACE: u8 = 0x2C;
    pub const KEY_MINUS: u8 = 0x2D;
    pub const KEY_EQUAL: u8 = 0x2E;
    pub const KEY_LEFT_BRACKET: u8 = 0x2F;
    pub const KEY_RIGHT_BRACKET: u8 = 0x30;
    pub const KEY_BACKSLASH: u8 = 0x31;
    pub const KEY_SEMICOLON: u8 = 0x33;
    pub const KEY_APOSTROPHE: u8 = 0x34;
    pub const KEY_GRAVE: u8 = 0x35;
    pub const KEY_COMMA: u8 = 0x36;
    pub const KEY_PERIOD: u8 = 0x37;
    pub const KEY_SLASH: u8 = 0x38;
    pub const KEY_CAPS_LOCK: u8 = 0x39;

    // Function keys F1-F12
    pub const KEY_F1: u8 = 0x3A;
    pub const KEY_F12: u8 = 0x45;

    // Special keys
    pub const KEY_PRINT_SCREEN: u8 = 0x46;
    pub const KEY_SCROLL_LOCK: u8 = 0x47;
    pub const KEY_PAUSE: u8 = 0x48;
    pub const KEY_INSERT: u8 = 0x49;
    pub const KEY_HOME: u8 = 0x4A;
    pub const KEY_PAGE_UP: u8 = 0x4B;
    pub const KEY_DELETE: u8 = 0x4C;
    pub const KEY_END: u8 = 0x4D;
    pub const KEY_PAGE_DOWN: u8 = 0x4E;
    pub const KEY_RIGHT_ARROW: u8 = 0x4F;
    pub const KEY_LEFT_ARROW: u8 = 0x50;
    pub const KEY_DOWN_ARROW: u8 = 0x51;
    pub const KEY_UP_ARROW: u8 = 0x52;
    pub const KEY_NUM_LOCK: u8 = 0x53;
    pub const KEY_APPLICATION: u8 = 0x65; // Context menu

    // Modifier keys (these are handled separately in the modifier byte)
    pub const KEY_LEFT_CTRL: u8 = 0xE0;
    pub const KEY_LEFT_SHIFT: u8 = 0xE1;
    pub const KEY_LEFT_ALT: u8 = 0xE2;
    pub const KEY_LEFT_META: u8 = 0xE3;
    pub const KEY_RIGHT_CTRL: u8 = 0xE4;
    pub const KEY_RIGHT_SHIFT: u8 = 0xE5;
    pub const KEY_RIGHT_ALT: u8 = 0xE6;
    pub const KEY_RIGHT_META: u8 = 0xE7;
}

/// ASCII to (usage, shift) table, US layout
/// Index = ASCII code, Value = (usage, shift); usage 0 means unmapped
static ASCII_TO_USB_TABLE: [(u8, bool); 128] = {
    let mut table = [(0u8, false); 128];

    let mut i = 0u8;
    while i < 26 {
        table[(b'a' + i) as usize] = (usb::KEY_A + i, false);
        table[(b'A' + i) as usize] = (usb::KEY_A + i, true);
        i += 1;
    }

    // '1'..'9' then '0'
    let mut i = 0u8;
    while i < 9 {
        table[(b'1' + i) as usize] = (usb::KEY_1 + i, false);
        i += 1;
    }
    table[b'0' as usize] = (usb::KEY_0, false);

    // Shifted digits
    table[b'!' as usize] = (usb::KEY_1, true);
    table[b'@' as usize] = (usb::KEY_2, true);
    table[b'#' as usize] = (usb::KEY_3, true);
    table[b'$' as usize] = (usb::KEY_4, true);
    table[b'%' as usize] = (usb::KEY_5, true);
    table[b'^' as usize] = (usb::KEY_6, true);
    table[b'&' as usize] = (usb::KEY_7, true);
    table[b'*' as usize] = (usb::KEY_8, true);
    table[b'(' as usize] = (usb::KEY_9, true);
    table[b')' as usize] = (usb::KEY_0, true);

    table[b'\n' as usize] = (usb::KEY_ENTER, false);
    table[b'\t' as usize] = (usb::KEY_TAB, false);
    table[b' ' as usize] = (usb::KEY_SPACE, false);

    table[b'-' as usize] = (usb::KEY_MINUS, false);
    table[b'_' as usize] = (usb::KEY_MINUS, true);
    table[b'=' as usize] = (usb::KEY_EQUAL, false);
    table[b'+' as usize] = (usb::KEY_EQUAL, true);
    table[b'[' as usize] = (usb::KEY_LEFT_BRACKET, false);
    table[b'{' as usize] = (usb::KEY_LEFT_BRACKET, true);
    table[b']' as usize] = (usb::KEY_RIGHT_BRACKET, false);
    table[b'}' as usize] = (usb::KEY_RIGHT_BRACKET, true);
    table[b'\\' as usize] = (usb::KEY_BACKSLASH, false);
    table[b'|' as usize] = (usb::KEY_BACKSLASH, true);
    table[b';' as usize] = (usb::KEY_SEMICOLON, false);
    table[b':' as usize] = (usb::KEY_SEMICOLON, true);
    table[b'\'' as usize] = (usb::KEY_APOSTROPHE, false);
    table[b'"' as usize] = (usb::KEY_APOSTROPHE, true);
    table[b'`' as usize] = (usb::KEY_GRAVE, false);
    table[b'~' as usize] = (usb::KEY_GRAVE, true);
    table[b',' as usize] = (usb::KEY_COMMA, false);
    table[b'<' as usize] = (usb::KEY_COMMA, true);
    table[b'.' as usize] = (usb::KEY_PERIOD, false);
    table[b'>' as usize] = (usb::KEY_PERIOD, true);
    table[b'/' as usize] = (usb::KEY_SLASH, false);
    table[b'?' as usize] = (usb::KEY_SLASH, true);

    table
};

/// Convert a character to (usage code, needs shift)
///
/// Returns None for non-ASCII or unmapped characters.
#[inline]
pub fn char_to_usb(c: char) -> Option<(u8, bool)> {
    if !c.is_ascii() {
        return None;
    }
    let (code, shift) = ASCII_TO_USB_TABLE[c as usize];
    (code != 0).then_some((code, shift))
}

/// Look up a key by name (case-insensitive)
pub fn named_key(name: &str) -> Option<u8> {
    let name = name.to_ascii_lowercase();
    let code = match name.as_str() {
        "enter" | "return" => usb::KEY_ENTER,
        "esc" | "escape" => usb::KEY_ESCAPE,
        "backspace" => usb::KEY_BACKSPACE,
        "tab" => usb::KEY_TAB,
        "space" => usb::KEY_SPACE,
        "capslock" => usb::KEY_CAPS_LOCK,
        "printscreen" | "prtsc" => usb::KEY_PRINT_SCREEN,
        "scrolllock" => usb::KEY_SCROLL_LOCK,
        "pause" => usb::KEY_PAUSE,
        "insert" | "ins" => usb::KEY_INSERT,
        "home" => usb::KEY_HOME,
        "pageup" | "pgup" => usb::KEY_PAGE_UP,
        "delete" | "del" => usb::KEY_DELETE,
        "end" => usb::KEY_END,
        "pagedown" | "pgdn" => usb::KEY_PAGE_DOWN,
        "right" => usb::KEY_RIGHT_ARROW,
        "left" => usb::KEY_LEFT_ARROW,
        "down" => usb::KEY_DOWN_ARROW,
        "up" => usb::KEY_UP_ARROW,
        "numlock" => usb::KEY_NUM_LOCK,
        "menu" => usb::KEY_APPLICATION,
        f if f.starts_with('f') => {
            let n: u8 = f[1..].parse().ok()?;
            if !(1..=12).contains(&n) {
                return None;
            }
            usb::KEY_F1 + n - 1
        }
        _ => return None,
    };
    Some(code)
}

/// Parse a key combination such as `ctrl+alt+delete`, `shift+tab` or `a`
///
/// The last component is the key, everything before it a modifier.
pub fn parse_combo(combo: &str) -> Option<(u8, KeyboardModifiers)> {
    let mut parts: Vec<&str> = combo.split('+').map(str::trim).collect();
    let key = parts.pop().filter(|k| !k.is_empty())?;

    let mut modifiers = KeyboardModifiers::default();
    for part in parts {
        match part.to_ascii_lowercase().as_str() {
            "ctrl" | "control" => modifiers.left_ctrl = true,
            "shift" => modifiers.left_shift = true,
            "alt" => modifiers.left_alt = true,
            "altgr" => modifiers.right_alt = true,
            "meta" | "super" | "win" | "gui" => modifiers.left_meta = true,
            _ => return None,
        }
    }

    if let Some(code) = named_key(key) {
        return Some((code, modifiers));
    }

    let mut chars = key.chars();
    let (c, None) = (chars.next()?, chars.next()) else {
        return None;
    };
    let (code, shift) = char_to_usb(c)?;
    modifiers.left_shift |= shift;
    Some((code, modifiers))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_letter_mapping() {
        assert_eq!(char_to_usb('a'), Some((usb::KEY_A, false)));
        assert_eq!(char_to_usb('z'), Some((usb::KEY_Z, false)));
        assert_eq!(char_to_usb('Q'), Some((0x14, true)));
    }

    #[test]
    fn test_number_mapping() {
        assert_eq!(char_to_usb('0'), Some((usb::KEY_0, false)));
        assert_eq!(char_to_usb('1'), Some((usb::KEY_1, false)));
        assert_eq!(char_to_usb('9'), Some((usb::KEY_9, false)));
        assert_eq!(char_to_usb('!'), Some((usb::KEY_1, true)));
    }

    #[test]
    fn test_whitespace_and_unmapped() {
        assert_eq!(char_to_usb(' '), Some((usb::KEY_SPACE, false)));
        assert_eq!(char_to_usb('\n'), Some((usb::KEY_ENTER, false)));
        assert_eq!(char_to_usb('é'), None);
        assert_eq!(char_to_usb('\u{7f}'), None);
    }

    #[test]
    fn test_named_keys() {
        assert_eq!(named_key("Enter"), Some(usb::KEY_ENTER));
        assert_eq!(named_key("f1"), Some(usb::KEY_F1));
        assert_eq!(named_key("F12"), Some(usb::KEY_F12));
        assert_eq!(named_key("f13"), None);
        assert_eq!(named_key("bogus"), None);
    }

    #[test]
    fn test_parse_combo() {
        let (code, mods) = parse_combo("ctrl+alt+delete").unwrap();
        assert_eq!(code, usb::KEY_DELETE);
        assert_eq!(mods.to_hid_byte(), 0x05);

        let (code, mods) = parse_combo("A").unwrap();
        assert_eq!(code, usb::KEY_A);
        assert!(mods.left_shift);

        assert!(parse_combo("hyper+x").is_none());
        assert!(parse_combo("ctrl+").is_none());
        assert!(parse_combo("ab").is_none());
    }
}
