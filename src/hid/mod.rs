//! Virtual keyboard
//!
//! Keystrokes are encoded as 8-byte boot keyboard reports and written to the
//! gadget's `/dev/hidgN` node:
//! ```text
//! KeyEvent --> HidKeyboardFunction --> KeyboardReport --> /dev/hidg0 --> host
//! ```

pub mod keyboard;
pub mod keymap;
pub mod passthrough;
pub mod types;

pub use keyboard::HidKeyboardFunction;
pub use types::{KeyEvent, KeyEventType, KeyboardModifiers, KeyboardReport};
