//! Mass storage function for USB Gadget

use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::configfs::{create_dir, create_symlink, read_attr, remove_dir, remove_file, write_file};
use super::function::GadgetFunction;
use crate::error::{AppError, Result};

/// LUN configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsdLunConfig {
    /// File/image path to expose
    pub file: PathBuf,
    /// Mount as CD-ROM
    pub cdrom: bool,
    /// Read-only mode
    pub ro: bool,
    /// Removable media
    pub removable: bool,
    /// Disable Force Unit Access
    pub nofua: bool,
}

impl MsdLunConfig {
    /// CD-ROM configuration (always read-only)
    pub fn cdrom(file: PathBuf) -> Self {
        Self {
            file,
            cdrom: true,
            ro: true,
            removable: true,
            nofua: true,
        }
    }

    /// Disk configuration
    pub fn disk(file: PathBuf, read_only: bool) -> Self {
        Self {
            file,
            cdrom: false,
            ro: read_only,
            removable: true,
            nofua: true,
        }
    }
}

/// Mass storage function for USB Gadget
#[derive(Debug, Clone)]
pub struct MsdFunction {
    name: String,
}

impl MsdFunction {
    /// Create a new mass storage function (`mass_storage.usbN`)
    pub fn new(instance: u8) -> Self {
        Self::named(&format!("mass_storage.usb{}", instance))
    }

    /// Refer to an existing function directory by name
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    fn lun_path(&self, gadget_path: &Path, lun: u8) -> PathBuf {
        self.function_path(gadget_path).join(format!("lun.{}", lun))
    }

    /// Configure a LUN and attach its backing file
    ///
    /// Flags are written before `file`; the kernel refuses flag changes
    /// while a medium is attached.
    pub fn configure_lun(&self, gadget_path: &Path, lun: u8, config: &MsdLunConfig) -> Result<()> {
        let lun_path = self.lun_path(gadget_path, lun);
        create_dir(&lun_path)?;

        if !config.file.exists() {
            return Err(AppError::ImageUnavailable(format!(
                "{} does not exist",
                config.file.display()
            )));
        }

        for (attr, value) in [
            ("ro", config.ro),
            ("cdrom", config.cdrom),
            ("removable", config.removable),
            ("nofua", config.nofua),
        ] {
            let value = if value { "1" } else { "0" };
            let current = read_attr(&lun_path.join(attr));
            if current != value {
                debug!("Updating LUN {} {}: {:?} -> {}", lun, attr, current, value);
                write_file(&lun_path.join(attr), value)?;
            }
        }

        write_file(&lun_path.join("file"), &config.file.to_string_lossy())?;
        info!(
            "LUN {} configured with file: {} (cdrom={}, ro={})",
            lun,
            config.file.display(),
            config.cdrom,
            config.ro
        );
        Ok(())
    }

    /// Detach the backing file from a LUN
    ///
    /// Uses `forced_eject` when the kernel provides it, else clears `file`.
    pub fn disconnect_lun(&self, gadget_path: &Path, lun: u8) -> Result<()> {
        let lun_path = self.lun_path(gadget_path, lun);
        if !lun_path.exists() {
            return Ok(());
        }

        let forced_eject_path = lun_path.join("forced_eject");
        if forced_eject_path.exists() {
            if let Err(e) = write_file(&forced_eject_path, "1") {
                warn!("forced_eject failed: {}, clearing file instead", e);
                write_file(&lun_path.join("file"), "")?;
            }
        } else {
            write_file(&lun_path.join("file"), "")?;
        }

        debug!("LUN {} disconnected", lun);
        Ok(())
    }
}

impl GadgetFunction for MsdFunction {
    fn name(&self) -> &str {
        &self.name
    }

    fn create(&self, gadget_path: &Path) -> Result<()> {
        let func_path = self.function_path(gadget_path);
        create_dir(&func_path)?;

        // Some hosts choke on stalled bulk endpoints
        let stall_path = func_path.join("stall");
        if stall_path.exists() {
            let _ = write_file(&stall_path, "0");
        }

        // The kernel creates lun.0 itself
        create_dir(&func_path.join("lun.0"))?;

        debug!("Created MSD function: {}", self.name());
        Ok(())
    }

    fn link(&self, config_path: &Path, gadget_path: &Path) -> Result<()> {
        let func_path = self.function_path(gadget_path);
        let link_path = config_path.join(self.name());

        if link_path.symlink_metadata().is_err() {
            create_symlink(&func_path, &link_path)?;
            debug!("Linked MSD function {} to config", self.name());
        }

        Ok(())
    }

    fn unlink(&self, config_path: &Path) -> Result<()> {
        remove_file(&config_path.join(self.name()))?;
        debug!("Unlinked MSD function {}", self.name());
        Ok(())
    }

    fn cleanup(&self, gadget_path: &Path) -> Result<()> {
        if let Err(e) = self.disconnect_lun(gadget_path, 0) {
            warn!("Could not disconnect {} lun.0: {}", self.name(), e);
        }
        remove_dir(&self.function_path(gadget_path))?;
        debug!("Cleaned up MSD function {}", self.name());
        Ok(())
    }
}
