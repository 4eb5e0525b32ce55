//! ConfigFS file operations for USB Gadget

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, warn};

use crate::error::{AppError, Result};

/// ConfigFS base path for USB gadgets
pub const CONFIGFS_PATH: &str = "/sys/kernel/config/usb_gadget";

/// sysfs class directory listing USB device controllers
pub const UDC_CLASS_PATH: &str = "/sys/class/udc";

/// Default gadget name
pub const DEFAULT_GADGET_NAME: &str = "g1";

/// USB Vendor ID (Pine64)
pub const DEFAULT_USB_VENDOR_ID: u16 = 0x1f3a;

/// USB Product ID (generic device)
pub const DEFAULT_USB_PRODUCT_ID: u16 = 0x1001;

/// USB device version - default value
pub const DEFAULT_USB_BCD_DEVICE: u16 = 0x0100;

/// USB spec version (USB 2.0)
pub const USB_BCD_USB: u16 = 0x0200;

/// Filesystem locations the gadget store works against
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFsLayout {
    /// `usb_gadget` directory in configfs
    pub configfs_root: PathBuf,
    /// `/sys/class/udc`
    pub udc_class: PathBuf,
    /// Directory holding `hidgN` nodes
    pub dev_dir: PathBuf,
}

impl Default for ConfigFsLayout {
    fn default() -> Self {
        Self {
            configfs_root: PathBuf::from(CONFIGFS_PATH),
            udc_class: PathBuf::from(UDC_CLASS_PATH),
            dev_dir: PathBuf::from("/dev"),
        }
    }
}

impl ConfigFsLayout {
    /// Check if the configfs gadget directory is present
    pub fn is_available(&self) -> bool {
        self.configfs_root.exists()
    }

    /// Find the first available UDC (USB Device Controller)
    pub fn find_udc(&self) -> Option<String> {
        let mut names: Vec<String> = fs::read_dir(&self.udc_class)
            .ok()?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names.into_iter().next()
    }

    /// Check whether a named UDC exists
    pub fn has_udc(&self, name: &str) -> bool {
        self.udc_class.join(name).exists()
    }
}

/// Load the composite gadget framework (best-effort)
pub fn load_libcomposite() {
    match Command::new("modprobe").arg("libcomposite").status() {
        Ok(status) if status.success() => debug!("libcomposite loaded"),
        Ok(status) => warn!("modprobe libcomposite exited with {}", status),
        Err(e) => warn!("Failed to run modprobe libcomposite: {}", e),
    }
}

/// Write string content to an attribute file
///
/// sysfs/configfs attributes take the value from a single write() syscall,
/// so the complete buffer (including the trailing newline) is built first.
pub fn write_file(path: &Path, content: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|e| config_error("open", path, e))?;

    let data: std::borrow::Cow<[u8]> = if content.ends_with('\n') {
        content.as_bytes().into()
    } else {
        let mut buf = content.as_bytes().to_vec();
        buf.push(b'\n');
        buf.into()
    };

    file.write_all(&data)
        .map_err(|e| config_error("write to", path, e))?;
    file.flush().map_err(|e| config_error("flush", path, e))?;

    Ok(())
}

/// Write binary content to an attribute file
pub fn write_bytes(path: &Path, data: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|e| config_error("create", path, e))?;

    file.write_all(data)
        .map_err(|e| config_error("write to", path, e))?;

    Ok(())
}

/// Read string content from a file
pub fn read_file(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|e| config_error("read", path, e))
}

/// Read an attribute, treating a missing or unreadable file as empty
pub fn read_attr(path: &Path) -> String {
    read_file(path).unwrap_or_default()
}

/// Create directory if not exists
pub fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| config_error("create directory", path, e))
}

/// Remove directory
pub fn remove_dir(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_dir(path).map_err(|e| config_error("remove directory", path, e))?;
    }
    Ok(())
}

/// Remove file or symlink
pub fn remove_file(path: &Path) -> Result<()> {
    if path.symlink_metadata().is_ok() {
        fs::remove_file(path).map_err(|e| config_error("remove", path, e))?;
    }
    Ok(())
}

/// Create symlink
pub fn create_symlink(src: &Path, dest: &Path) -> Result<()> {
    std::os::unix::fs::symlink(src, dest).map_err(|e| {
        AppError::GadgetConfig(format!(
            "Failed to create symlink {} -> {}: {}",
            dest.display(),
            src.display(),
            e
        ))
    })
}

fn config_error(op: &str, path: &Path, e: std::io::Error) -> AppError {
    AppError::GadgetConfig(format!("Failed to {} {}: {}", op, path.display(), e))
}
