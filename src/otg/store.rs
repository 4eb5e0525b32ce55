//! Gadget configuration store
//!
//! `GadgetConfigStore` is the seam between the lifecycle engine and the
//! kernel's configfs tree. All methods block on filesystem I/O; async callers
//! run them on the blocking pool.

use std::fs;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use super::configfs::{
    create_dir, read_attr, remove_dir, write_file, ConfigFsLayout, USB_BCD_USB,
};
use super::function::{instance_of, FunctionHandle, FunctionKind, FunctionSpec, GadgetFunction};
use super::hid::HidFunction;
use super::msd::MsdFunction;
use crate::config::GadgetConfig;
use crate::error::{AppError, Result};

/// Operations the engine needs from the gadget configuration filesystem
pub trait GadgetConfigStore: Send + Sync {
    /// Create a function (and the gadget skeleton if missing)
    fn create_function(&self, spec: &FunctionSpec) -> Result<FunctionHandle>;

    /// Link the function into the configuration and attach the gadget to a UDC
    fn bind(&self, handle: &FunctionHandle) -> Result<()>;

    /// Detach from the UDC and unlink the function. Never fails.
    fn unbind(&self, handle: &FunctionHandle);

    /// Remove the function; tears the skeleton down once no function is left
    fn destroy_function(&self, handle: &FunctionHandle);

    /// Functions present in the live tree
    fn probe(&self) -> Vec<FunctionHandle>;

    /// Whether the gadget is attached to a UDC
    fn is_bound(&self) -> bool;

    /// Clear the UDC binding regardless of which functions are linked
    fn release_udc(&self);
}

/// USB Gadget device descriptor configuration
#[derive(Debug, Clone)]
pub struct GadgetDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_version: u16,
    pub manufacturer: String,
    pub product: String,
    pub serial_number: String,
    pub max_power_ma: u16,
}

impl Default for GadgetDescriptor {
    fn default() -> Self {
        Self::from(&GadgetConfig::default())
    }
}

impl From<&GadgetConfig> for GadgetDescriptor {
    fn from(config: &GadgetConfig) -> Self {
        Self {
            vendor_id: config.vendor_id,
            product_id: config.product_id,
            device_version: config.device_version,
            manufacturer: config.manufacturer.clone(),
            product: config.product.clone(),
            serial_number: config.serial_number.clone(),
            max_power_ma: config.max_power_ma,
        }
    }
}

/// configfs-backed store
pub struct ConfigFsStore {
    layout: ConfigFsLayout,
    gadget_name: String,
    gadget_path: PathBuf,
    config_path: PathBuf,
    descriptor: GadgetDescriptor,
    /// Preferred UDC; first available when `None`
    udc: Option<String>,
}

impl ConfigFsStore {
    pub fn new(
        layout: ConfigFsLayout,
        gadget_name: &str,
        descriptor: GadgetDescriptor,
        udc: Option<String>,
    ) -> Self {
        let gadget_path = layout.configfs_root.join(gadget_name);
        let config_path = gadget_path.join("configs/c.1");

        Self {
            layout,
            gadget_name: gadget_name.to_string(),
            gadget_path,
            config_path,
            descriptor,
            udc,
        }
    }

    pub fn from_config(config: &GadgetConfig) -> Self {
        let layout = ConfigFsLayout {
            configfs_root: config.configfs_path.clone(),
            udc_class: config.udc_class_path.clone(),
            dev_dir: config.dev_path.clone(),
        };
        Self::new(
            layout,
            &config.name,
            GadgetDescriptor::from(config),
            config.udc.clone(),
        )
    }

    /// Gadget path in ConfigFS
    pub fn gadget_path(&self) -> &PathBuf {
        &self.gadget_path
    }

    fn gadget_exists(&self) -> bool {
        self.gadget_path.exists()
    }

    /// Create the gadget skeleton, reusing whatever already exists
    fn ensure_gadget(&self) -> Result<()> {
        if !self.layout.is_available() {
            return Err(AppError::GadgetConfig(format!(
                "ConfigFS not available at {}. Is libcomposite loaded?",
                self.layout.configfs_root.display()
            )));
        }

        if self.gadget_exists() && self.is_bound() {
            warn!(
                "Gadget {} is still bound from a previous run, unbinding",
                self.gadget_name
            );
            write_file(&self.gadget_path.join("UDC"), "")?;
        }

        create_dir(&self.gadget_path)?;
        self.set_device_descriptors()?;
        self.create_strings()?;
        self.create_configuration()?;
        Ok(())
    }

    fn set_device_descriptors(&self) -> Result<()> {
        let attrs = [
            ("idVendor", self.descriptor.vendor_id),
            ("idProduct", self.descriptor.product_id),
            ("bcdDevice", self.descriptor.device_version),
            ("bcdUSB", USB_BCD_USB),
        ];
        for (attr, value) in attrs {
            write_file(&self.gadget_path.join(attr), &format!("0x{:04x}", value))?;
        }
        debug!("Set device descriptors");
        Ok(())
    }

    fn create_strings(&self) -> Result<()> {
        let strings_path = self.gadget_path.join("strings/0x409");
        create_dir(&strings_path)?;

        write_file(
            &strings_path.join("serialnumber"),
            &self.descriptor.serial_number,
        )?;
        write_file(
            &strings_path.join("manufacturer"),
            &self.descriptor.manufacturer,
        )?;
        write_file(&strings_path.join("product"), &self.descriptor.product)?;
        debug!("Created USB strings");
        Ok(())
    }

    fn create_configuration(&self) -> Result<()> {
        let strings_path = self.config_path.join("strings/0x409");
        create_dir(&strings_path)?;
        write_file(&strings_path.join("configuration"), "Config 1: Lab Tool")?;
        write_file(
            &self.config_path.join("MaxPower"),
            &self.descriptor.max_power_ma.to_string(),
        )?;
        debug!("Created configuration c.1");
        Ok(())
    }

    /// Remove config and gadget directories, in reverse creation order
    fn teardown_skeleton(&self) {
        if !self.gadget_exists() {
            return;
        }

        let steps = [
            self.config_path.join("strings/0x409"),
            self.config_path.clone(),
            self.gadget_path.join("strings/0x409"),
            self.gadget_path.clone(),
        ];
        for dir in steps {
            if let Err(e) = remove_dir(&dir) {
                warn!("Could not remove {}: {}", dir.display(), e);
                return;
            }
        }
        info!("Removed gadget {}", self.gadget_name);
    }

    fn resolve_udc(&self) -> Result<String> {
        match &self.udc {
            Some(name) if self.layout.has_udc(name) => Ok(name.clone()),
            Some(name) => Err(AppError::Bind(format!("UDC {} not found", name))),
            None => self.layout.find_udc().ok_or_else(|| {
                AppError::Bind("No USB Device Controller (UDC) found".to_string())
            }),
        }
    }
}

impl GadgetConfigStore for ConfigFsStore {
    fn create_function(&self, spec: &FunctionSpec) -> Result<FunctionHandle> {
        debug!("Creating {:?} function", spec.kind());
        self.ensure_gadget()?;

        let handle = match spec {
            FunctionSpec::MassStorage(lun) => {
                let func = MsdFunction::new(0);
                func.create(&self.gadget_path)
                    .and_then(|_| func.configure_lun(&self.gadget_path, 0, lun))
                    .inspect_err(|_| {
                        let _ = func.cleanup(&self.gadget_path);
                    })?;
                FunctionHandle {
                    name: func.name().to_string(),
                    kind: FunctionKind::MassStorage,
                    device: None,
                }
            }
            FunctionSpec::HidKeyboard => {
                let func = HidFunction::keyboard(0);
                func.create(&self.gadget_path).inspect_err(|_| {
                    let _ = func.cleanup(&self.gadget_path);
                })?;
                FunctionHandle {
                    name: func.name().to_string(),
                    kind: FunctionKind::HidKeyboard,
                    device: Some(func.device_path(&self.layout.dev_dir)),
                }
            }
        };

        info!("Created function {} in gadget {}", handle.name, self.gadget_name);
        Ok(handle)
    }

    fn bind(&self, handle: &FunctionHandle) -> Result<()> {
        let udc = self.resolve_udc()?;
        let func = handle.function();

        func.link(&self.config_path, &self.gadget_path)?;

        info!("Binding gadget to UDC: {}", udc);
        if let Err(e) = write_file(&self.gadget_path.join("UDC"), &udc) {
            let _ = func.unlink(&self.config_path);
            return Err(AppError::Bind(format!("UDC {} refused binding: {}", udc, e)));
        }
        Ok(())
    }

    fn unbind(&self, handle: &FunctionHandle) {
        self.release_udc();
        if let Err(e) = handle.function().unlink(&self.config_path) {
            warn!("Failed to unlink {}: {}", handle.name, e);
        }
    }

    fn destroy_function(&self, handle: &FunctionHandle) {
        if let Err(e) = handle.function().cleanup(&self.gadget_path) {
            warn!("Failed to remove function {}: {}", handle.name, e);
        }
        if self.probe().is_empty() {
            self.teardown_skeleton();
        }
    }

    fn probe(&self) -> Vec<FunctionHandle> {
        let Ok(entries) = fs::read_dir(self.gadget_path.join("functions")) else {
            return Vec::new();
        };

        let mut handles: Vec<FunctionHandle> = entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                let kind = FunctionKind::from_dir_name(&name)?;
                let device = match kind {
                    FunctionKind::HidKeyboard => Some(
                        HidFunction::named(&name, instance_of(&name))
                            .device_path(&self.layout.dev_dir),
                    ),
                    FunctionKind::MassStorage => None,
                };
                Some(FunctionHandle { name, kind, device })
            })
            .collect();
        handles.sort_by(|a, b| a.name.cmp(&b.name));
        handles
    }

    fn is_bound(&self) -> bool {
        !read_attr(&self.gadget_path.join("UDC")).is_empty()
    }

    fn release_udc(&self) {
        if !self.is_bound() {
            return;
        }
        match write_file(&self.gadget_path.join("UDC"), "") {
            Ok(()) => info!("Unbound gadget from UDC"),
            Err(e) => warn!("Failed to unbind gadget: {}", e),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::otg::msd::MsdLunConfig;
    use tempfile::TempDir;

    fn temp_store(temp_dir: &TempDir, udc: Option<&str>) -> ConfigFsStore {
        let layout = ConfigFsLayout {
            configfs_root: temp_dir.path().join("usb_gadget"),
            udc_class: temp_dir.path().join("udc"),
            dev_dir: temp_dir.path().join("dev"),
        };
        create_dir(&layout.configfs_root).unwrap();
        create_dir(&layout.udc_class.join("musb-hdrc.2.auto")).unwrap();
        ConfigFsStore::new(
            layout,
            "g1",
            GadgetDescriptor::default(),
            udc.map(str::to_string),
        )
    }

    #[test]
    fn test_create_builds_skeleton() {
        let temp_dir = TempDir::new().unwrap();
        let store = temp_store(&temp_dir, None);

        let handle = store.create_function(&FunctionSpec::HidKeyboard).unwrap();
        assert_eq!(handle.name, "hid.usb0");
        assert_eq!(handle.device, Some(temp_dir.path().join("dev/hidg0")));

        let gadget = store.gadget_path();
        assert_eq!(read_attr(&gadget.join("idVendor")), "0x1f3a");
        assert_eq!(read_attr(&gadget.join("idProduct")), "0x1001");
        assert_eq!(read_attr(&gadget.join("bcdUSB")), "0x0200");
        assert_eq!(read_attr(&gadget.join("strings/0x409/manufacturer")), "Pine64");
        assert_eq!(read_attr(&gadget.join("configs/c.1/MaxPower")), "500");
        assert_eq!(store.probe(), vec![handle]);
    }

    #[test]
    fn test_bind_and_unbind() {
        let temp_dir = TempDir::new().unwrap();
        let store = temp_store(&temp_dir, None);
        let image = temp_dir.path().join("a.iso");
        fs::write(&image, b"data").unwrap();

        let handle = store
            .create_function(&FunctionSpec::MassStorage(MsdLunConfig::disk(image, true)))
            .unwrap();
        store.bind(&handle).unwrap();

        assert!(store.is_bound());
        assert_eq!(
            read_attr(&store.gadget_path().join("UDC")),
            "musb-hdrc.2.auto"
        );
        assert!(store
            .gadget_path()
            .join("configs/c.1/mass_storage.usb0")
            .symlink_metadata()
            .is_ok());

        store.unbind(&handle);
        assert!(!store.is_bound());
        assert!(store
            .gadget_path()
            .join("configs/c.1/mass_storage.usb0")
            .symlink_metadata()
            .is_err());
    }

    #[test]
    fn test_bind_unknown_udc_leaves_unlinked() {
        let temp_dir = TempDir::new().unwrap();
        let store = temp_store(&temp_dir, Some("dummy_udc.0"));

        let handle = store.create_function(&FunctionSpec::HidKeyboard).unwrap();
        let err = store.bind(&handle).unwrap_err();
        assert_eq!(err.code(), "bind");
        assert!(!store.is_bound());
        assert!(store
            .gadget_path()
            .join("configs/c.1/hid.usb0")
            .symlink_metadata()
            .is_err());
    }

    #[test]
    fn test_create_unbinds_stale_gadget() {
        let temp_dir = TempDir::new().unwrap();
        let store = temp_store(&temp_dir, None);
        create_dir(store.gadget_path()).unwrap();
        write_file(&store.gadget_path().join("UDC"), "musb-hdrc.2.auto").unwrap();
        assert!(store.is_bound());

        store.create_function(&FunctionSpec::HidKeyboard).unwrap();
        assert!(!store.is_bound());
    }

    #[test]
    fn test_missing_configfs() {
        let temp_dir = TempDir::new().unwrap();
        let store = ConfigFsStore::new(
            ConfigFsLayout {
                configfs_root: temp_dir.path().join("absent"),
                udc_class: temp_dir.path().join("udc"),
                dev_dir: temp_dir.path().join("dev"),
            },
            "g1",
            GadgetDescriptor::default(),
            None,
        );
        let err = store.create_function(&FunctionSpec::HidKeyboard).unwrap_err();
        assert_eq!(err.code(), "gadget_config");
        assert!(store.probe().is_empty());
    }
}
