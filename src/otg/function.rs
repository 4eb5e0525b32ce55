//! USB Gadget Function definitions

use serde::Serialize;
use std::path::{Path, PathBuf};

use super::hid::HidFunction;
use super::msd::{MsdFunction, MsdLunConfig};
use crate::error::Result;

/// Gadget personality kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionKind {
    MassStorage,
    HidKeyboard,
}

impl FunctionKind {
    /// Classify a configfs function directory name (`<driver>.<instance>`)
    pub fn from_dir_name(name: &str) -> Option<Self> {
        match name.split_once('.')?.0 {
            "mass_storage" => Some(FunctionKind::MassStorage),
            "hid" => Some(FunctionKind::HidKeyboard),
            _ => None,
        }
    }
}

/// What to create in the gadget
#[derive(Debug, Clone)]
pub enum FunctionSpec {
    /// Mass storage with a single LUN
    MassStorage(MsdLunConfig),
    /// Boot-protocol keyboard
    HidKeyboard,
}

impl FunctionSpec {
    pub fn kind(&self) -> FunctionKind {
        match self {
            FunctionSpec::MassStorage(_) => FunctionKind::MassStorage,
            FunctionSpec::HidKeyboard => FunctionKind::HidKeyboard,
        }
    }
}

/// A function created in the gadget configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionHandle {
    /// configfs function name, e.g. `hid.usb0`
    pub name: String,
    pub kind: FunctionKind,
    /// Character device exposed once bound (HID only)
    pub device: Option<PathBuf>,
}

impl FunctionHandle {
    /// Rebuild the function object the handle refers to
    pub(crate) fn function(&self) -> Box<dyn GadgetFunction> {
        match self.kind {
            FunctionKind::MassStorage => Box::new(MsdFunction::named(&self.name)),
            FunctionKind::HidKeyboard => {
                Box::new(HidFunction::named(&self.name, instance_of(&self.name)))
            }
        }
    }
}

/// Parse the numeric instance from `hid.usb0` / `mass_storage.usb1`
pub(crate) fn instance_of(name: &str) -> u8 {
    name.rsplit_once(".usb")
        .and_then(|(_, n)| n.parse().ok())
        .unwrap_or(0)
}

/// USB Gadget Function trait
pub trait GadgetFunction: Send + Sync {
    /// Get function name (e.g., "hid.usb0", "mass_storage.usb0")
    fn name(&self) -> &str;

    /// Create function directory and configuration in ConfigFS
    fn create(&self, gadget_path: &Path) -> Result<()>;

    /// Link function to configuration
    fn link(&self, config_path: &Path, gadget_path: &Path) -> Result<()>;

    /// Unlink function from configuration
    fn unlink(&self, config_path: &Path) -> Result<()>;

    /// Cleanup function directory
    fn cleanup(&self, gadget_path: &Path) -> Result<()>;

    /// Function directory inside the gadget
    fn function_path(&self, gadget_path: &Path) -> PathBuf {
        gadget_path.join("functions").join(self.name())
    }
}
