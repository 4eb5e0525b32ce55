//! HID keyboard function for USB Gadget

use std::path::{Path, PathBuf};
use tracing::debug;

use super::configfs::{
    create_dir, create_symlink, remove_dir, remove_file, write_bytes, write_file,
};
use super::function::GadgetFunction;
use crate::error::Result;

/// HID protocol: keyboard
pub const KEYBOARD_PROTOCOL: u8 = 1;

/// HID subclass: boot interface
pub const KEYBOARD_SUBCLASS: u8 = 1;

/// Boot keyboard input report length
pub const KEYBOARD_REPORT_LEN: usize = 8;

/// Boot keyboard report descriptor
///
/// Report format (8 bytes input):
///   [0] Modifier keys (8 bits)
///   [1] Reserved
///   [2-7] Key codes (6 keys, usages 0..=101)
pub const KEYBOARD_REPORT_DESC: &[u8] = &[
    0x05, 0x01, // Usage Page (Generic Desktop)
    0x09, 0x06, // Usage (Keyboard)
    0xA1, 0x01, // Collection (Application)
    0x05, 0x07, //   Usage Page (Key Codes)
    0x19, 0xE0, //   Usage Minimum (224) - Left Control
    0x29, 0xE7, //   Usage Maximum (231) - Right GUI
    0x15, 0x00, //   Logical Minimum (0)
    0x25, 0x01, //   Logical Maximum (1)
    0x75, 0x01, //   Report Size (1)
    0x95, 0x08, //   Report Count (8)
    0x81, 0x02, //   Input (Data, Variable, Absolute) - Modifier byte
    0x95, 0x01, //   Report Count (1)
    0x75, 0x08, //   Report Size (8)
    0x81, 0x03, //   Input (Constant) - Reserved byte
    0x95, 0x06, //   Report Count (6)
    0x75, 0x08, //   Report Size (8)
    0x15, 0x00, //   Logical Minimum (0)
    0x25, 0x65, //   Logical Maximum (101)
    0x05, 0x07, //   Usage Page (Key Codes)
    0x19, 0x00, //   Usage Minimum (0)
    0x29, 0x65, //   Usage Maximum (101)
    0x81, 0x00, //   Input (Data, Array) - Key array
    0xC0, // End Collection
];

/// HID keyboard function for USB Gadget
#[derive(Debug, Clone)]
pub struct HidFunction {
    /// Instance number, also the `hidgN` minor
    instance: u8,
    name: String,
}

impl HidFunction {
    /// Create a keyboard function
    pub fn keyboard(instance: u8) -> Self {
        Self::named(&format!("hid.usb{}", instance), instance)
    }

    /// Refer to an existing function directory by name
    pub fn named(name: &str, instance: u8) -> Self {
        Self {
            instance,
            name: name.to_string(),
        }
    }

    /// Expected device node (e.g., /dev/hidg0)
    pub fn device_path(&self, dev_dir: &Path) -> PathBuf {
        dev_dir.join(format!("hidg{}", self.instance))
    }
}

impl GadgetFunction for HidFunction {
    fn name(&self) -> &str {
        &self.name
    }

    fn create(&self, gadget_path: &Path) -> Result<()> {
        let func_path = self.function_path(gadget_path);
        create_dir(&func_path)?;

        write_file(&func_path.join("protocol"), &KEYBOARD_PROTOCOL.to_string())?;
        write_file(&func_path.join("subclass"), &KEYBOARD_SUBCLASS.to_string())?;
        write_file(
            &func_path.join("report_length"),
            &KEYBOARD_REPORT_LEN.to_string(),
        )?;
        write_bytes(&func_path.join("report_desc"), KEYBOARD_REPORT_DESC)?;

        debug!(
            "Created HID function: {} at {}",
            self.name(),
            func_path.display()
        );
        Ok(())
    }

    fn link(&self, config_path: &Path, gadget_path: &Path) -> Result<()> {
        let func_path = self.function_path(gadget_path);
        let link_path = config_path.join(self.name());

        if link_path.symlink_metadata().is_err() {
            create_symlink(&func_path, &link_path)?;
            debug!("Linked HID function {} to config", self.name());
        }

        Ok(())
    }

    fn unlink(&self, config_path: &Path) -> Result<()> {
        remove_file(&config_path.join(self.name()))?;
        debug!("Unlinked HID function {}", self.name());
        Ok(())
    }

    fn cleanup(&self, gadget_path: &Path) -> Result<()> {
        remove_dir(&self.function_path(gadget_path))?;
        debug!("Cleaned up HID function {}", self.name());
        Ok(())
    }
}
