//! Block device discovery

use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{AppError, Result};

/// Sysfs block class, used for sizes
const SYS_BLOCK_PATH: &str = "/sys/class/block";

/// Sysfs reports sizes in 512-byte sectors regardless of the logical block size
const SECTOR_SIZE: u64 = 512;

/// Whole-disk block device that can be written
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockDevice {
    pub path: PathBuf,
    pub name: String,
    /// Size in bytes, when sysfs reports one
    pub size: Option<u64>,
}

/// List `sd*` and `mmcblk*` whole-disk nodes in `dev_dir`
pub fn list_block_devices(dev_dir: &Path) -> Result<Vec<BlockDevice>> {
    list_block_devices_in(dev_dir, Path::new(SYS_BLOCK_PATH))
}

fn list_block_devices_in(dev_dir: &Path, sys_block: &Path) -> Result<Vec<BlockDevice>> {
    let entries = fs::read_dir(dev_dir).map_err(|e| {
        AppError::NotFound(format!("Failed to read {}: {}", dev_dir.display(), e))
    })?;

    let mut devices = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if !is_whole_disk(&name) {
            continue;
        }

        let size = fs::read_to_string(sys_block.join(&name).join("size"))
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(|sectors| sectors * SECTOR_SIZE);

        debug!("Found block device {} ({:?} bytes)", name, size);
        devices.push(BlockDevice {
            path: entry.path(),
            name,
            size,
        });
    }

    devices.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(devices)
}

/// `sda` but not `sda1`; `mmcblk0` but not `mmcblk0p1` or `mmcblk0boot0`
fn is_whole_disk(name: &str) -> bool {
    if let Some(rest) = name.strip_prefix("sd") {
        return !rest.is_empty() && rest.chars().all(|c| c.is_ascii_lowercase());
    }
    if let Some(rest) = name.strip_prefix("mmcblk") {
        return !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit());
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_whole_disk_names() {
        assert!(is_whole_disk("sda"));
        assert!(is_whole_disk("sdab"));
        assert!(is_whole_disk("mmcblk0"));
        assert!(!is_whole_disk("sda1"));
        assert!(!is_whole_disk("sd"));
        assert!(!is_whole_disk("mmcblk0p1"));
        assert!(!is_whole_disk("mmcblk2boot0"));
        assert!(!is_whole_disk("loop0"));
        assert!(!is_whole_disk("nvme0n1"));
    }

    #[test]
    fn test_list_with_sizes() {
        let dev = TempDir::new().unwrap();
        let sys = TempDir::new().unwrap();
        for name in ["sdb", "sda", "sda1", "mmcblk0", "mmcblk0p2", "tty0"] {
            fs::write(dev.path().join(name), b"").unwrap();
        }
        fs::create_dir(sys.path().join("sdb")).unwrap();
        fs::write(sys.path().join("sdb/size"), "7812500\n").unwrap();

        let devices = list_block_devices_in(dev.path(), sys.path()).unwrap();
        let names: Vec<_> = devices.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["mmcblk0", "sda", "sdb"]);
        assert_eq!(devices[2].size, Some(7_812_500 * 512));
        assert_eq!(devices[1].size, None);
        assert_eq!(devices[0].path, dev.path().join("mmcblk0"));
    }

    #[test]
    fn test_missing_dev_dir() {
        let err = list_block_devices(Path::new("/nonexistent/dev")).unwrap_err();
        assert_eq!(err.code(), "not_found");
    }
}
