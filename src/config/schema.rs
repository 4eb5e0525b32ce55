use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::otg::configfs::{
    CONFIGFS_PATH, DEFAULT_GADGET_NAME, DEFAULT_USB_BCD_DEVICE, DEFAULT_USB_PRODUCT_ID,
    DEFAULT_USB_VENDOR_ID, UDC_CLASS_PATH,
};

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// USB gadget identity and configfs locations
    pub gadget: GadgetConfig,
    /// Mass storage LUN policy
    pub msd: MsdConfig,
    /// Virtual keyboard settings
    pub keyboard: KeyboardConfig,
    /// Image-to-device writer settings
    pub writer: WriterConfig,
    /// Where images and target devices are discovered
    pub paths: PathsConfig,
}

/// USB gadget configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GadgetConfig {
    /// Gadget directory name under the configfs root
    pub name: String,
    /// configfs `usb_gadget` directory
    pub configfs_path: PathBuf,
    /// sysfs UDC class directory
    pub udc_class_path: PathBuf,
    /// Directory where `hidgN` device nodes appear
    pub dev_path: PathBuf,
    /// UDC to bind to (first available if unset)
    pub udc: Option<String>,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_version: u16,
    pub manufacturer: String,
    pub product: String,
    pub serial_number: String,
    /// Configuration MaxPower in mA
    pub max_power_ma: u16,
    /// Run `modprobe libcomposite` at startup
    pub load_libcomposite: bool,
}

impl Default for GadgetConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_GADGET_NAME.to_string(),
            configfs_path: PathBuf::from(CONFIGFS_PATH),
            udc_class_path: PathBuf::from(UDC_CLASS_PATH),
            dev_path: PathBuf::from("/dev"),
            udc: None,
            vendor_id: DEFAULT_USB_VENDOR_ID,
            product_id: DEFAULT_USB_PRODUCT_ID,
            device_version: DEFAULT_USB_BCD_DEVICE,
            manufacturer: "Pine64".to_string(),
            product: "Pinephone Lab Tool".to_string(),
            serial_number: "pinephone123456".to_string(),
            max_power_ma: 500,
            load_libcomposite: true,
        }
    }
}

/// Mass storage configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MsdConfig {
    /// Expose the image read-only to the host
    pub read_only: bool,
    /// Present the LUN as a CD-ROM drive
    pub cdrom: bool,
    /// Report removable media
    pub removable: bool,
}

impl Default for MsdConfig {
    fn default() -> Self {
        Self {
            read_only: true,
            cdrom: false,
            removable: true,
        }
    }
}

/// Virtual keyboard configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KeyboardConfig {
    /// How long to wait for the hidg node after binding
    pub device_wait_ms: u64,
    /// Pause between typed characters
    pub key_delay_ms: u64,
}

impl Default for KeyboardConfig {
    fn default() -> Self {
        Self {
            device_wait_ms: 2000,
            key_delay_ms: 5,
        }
    }
}

/// Block device writer configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WriterConfig {
    /// Copy chunk size in bytes
    pub chunk_size: usize,
    /// Minimum interval between progress events
    pub progress_interval_ms: u64,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            chunk_size: crate::flash::DEFAULT_CHUNK_SIZE,
            progress_interval_ms: 1000,
        }
    }
}

/// Discovery paths
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory scanned by `images` (relative paths resolve against the cwd)
    pub image_dir: PathBuf,
    /// Directory scanned by `devices`
    pub device_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            image_dir: PathBuf::from("."),
            device_dir: PathBuf::from("/dev"),
        }
    }
}
