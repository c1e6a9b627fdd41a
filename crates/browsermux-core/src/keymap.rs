//! Pure mapping from remote key identifiers to CDP key-event fields.

use serde::{Deserialize, Serialize};

/// Modifier flags as sent by clients alongside key events.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyModifiers {
    #[serde(default)]
    pub alt: bool,
    #[serde(default)]
    pub ctrl: bool,
    #[serde(default)]
    pub meta: bool,
    #[serde(default)]
    pub shift: bool,
}

/// CDP's modifier bitmap: 1 = Alt, 2 = Ctrl, 4 = Meta, 8 = Shift.
pub fn modifier_flags(m: &KeyModifiers) -> u32 {
    (m.alt as u32) | ((m.ctrl as u32) << 1) | ((m.meta as u32) << 2) | ((m.shift as u32) << 3)
}

/// Windows virtual key code for a DOM `key` value. Unknown named keys map
/// to 0; single characters map to their (uppercased, for letters) code.
pub fn windows_virtual_key_code(key: &str) -> u32 {
    match key {
        "Backspace" => 8,
        "Tab" => 9,
        "Enter" => 13,
        "Shift" => 16,
        "Control" => 17,
        "Alt" => 18,
        "Escape" => 27,
        "Space" => 32,
        "ArrowLeft" => 37,
        "ArrowUp" => 38,
        "ArrowRight" => 39,
        "ArrowDown" => 40,
        "Delete" => 46,
        "F1" => 112,
        "F2" => 113,
        "F3" => 114,
        "F4" => 115,
        "F5" => 116,
        "F6" => 117,
        "F7" => 118,
        "F8" => 119,
        "F9" => 120,
        "F10" => 121,
        "F11" => 122,
        "F12" => 123,
        _ => {
            let mut chars = key.chars();
            match (chars.next(), chars.next()) {
                (Some(ch), None) => {
                    if ch.is_ascii_alphabetic() {
                        ch.to_ascii_uppercase() as u32
                    } else {
                        ch as u32
                    }
                }
                _ => 0,
            }
        }
    }
}
