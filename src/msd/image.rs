//! Image selection and discovery

use serde::Serialize;
use std::fs::{self, File};
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{AppError, Result};

/// Extensions listed by `list_available_images`
const IMAGE_EXTENSIONS: &[&str] = &["iso", "img"];

/// A validated image file
///
/// Replaced, never mutated, when a new image is selected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageSelection {
    /// Canonical absolute path
    pub path: PathBuf,
    /// Display name
    pub name: String,
    /// Size in bytes
    pub size: u64,
}

impl ImageSelection {
    /// Validate `path` and capture its size
    ///
    /// Accepts regular files and block devices that can be opened for reading.
    pub fn open(path: &Path) -> Result<Self> {
        let unavailable =
            |reason: String| AppError::ImageUnavailable(format!("{}: {}", path.display(), reason));

        let canonical = fs::canonicalize(path).map_err(|e| unavailable(e.to_string()))?;
        let metadata = fs::metadata(&canonical).map_err(|e| unavailable(e.to_string()))?;

        let file_type = metadata.file_type();
        if !file_type.is_file() && !file_type.is_block_device() {
            return Err(unavailable("not a regular file or block device".to_string()));
        }

        let mut file = File::open(&canonical).map_err(|e| unavailable(e.to_string()))?;
        let size = if file_type.is_block_device() {
            file.seek(SeekFrom::End(0))
                .map_err(|e| unavailable(e.to_string()))?
        } else {
            metadata.len()
        };

        let name = canonical
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| canonical.display().to_string());

        debug!("Validated image {} ({} bytes)", canonical.display(), size);
        Ok(Self {
            path: canonical,
            name,
            size,
        })
    }

    /// Re-check that the image is still readable and unchanged in size
    pub fn revalidate(&self) -> Result<()> {
        let current = Self::open(&self.path)?;
        if current.size != self.size {
            return Err(AppError::ImageUnavailable(format!(
                "{} changed size ({} -> {} bytes), select it again",
                self.path.display(),
                self.size,
                current.size
            )));
        }
        Ok(())
    }

    /// Format size for display
    pub fn size_display(&self) -> String {
        size_display(self.size)
    }
}

/// Image file found in the image directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageInfo {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
}

/// List `*.iso` / `*.img` files in `dir`, sorted by name
pub fn list_available_images(dir: &Path) -> Result<Vec<ImageInfo>> {
    let entries = fs::read_dir(dir).map_err(|e| {
        AppError::NotFound(format!("Image directory {}: {}", dir.display(), e))
    })?;

    let mut images: Vec<ImageInfo> = entries
        .flatten()
        .filter_map(|entry| {
            let path = entry.path();
            let ext = path.extension()?.to_str()?.to_ascii_lowercase();
            if !IMAGE_EXTENSIONS.contains(&ext.as_str()) {
                return None;
            }
            let metadata = fs::metadata(&path).ok()?;
            if !metadata.is_file() {
                return None;
            }
            Some(ImageInfo {
                name: entry.file_name().to_string_lossy().to_string(),
                path,
                size: metadata.len(),
            })
        })
        .collect();

    images.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(images)
}

/// Format a byte count for display
pub fn size_display(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if size >= GB {
        format!("{:.2} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.2} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.2} KB", size as f64 / KB as f64)
    } else {
        format!("{} B", size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_regular_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("debian.iso");
        fs::write(&path, vec![0u8; 2048]).unwrap();

        let image = ImageSelection::open(&path).unwrap();
        assert_eq!(image.name, "debian.iso");
        assert_eq!(image.size, 2048);
        assert!(image.path.is_absolute());
        assert!(image.revalidate().is_ok());
    }

    #[test]
    fn test_open_rejects_missing_and_dirs() {
        let temp_dir = TempDir::new().unwrap();

        let err = ImageSelection::open(&temp_dir.path().join("nope.iso")).unwrap_err();
        assert_eq!(err.code(), "image_unavailable");

        let err = ImageSelection::open(temp_dir.path()).unwrap_err();
        assert_eq!(err.code(), "image_unavailable");
    }

    #[test]
    fn test_revalidate_detects_removal_and_resize() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a.img");
        fs::write(&path, b"1234").unwrap();
        let image = ImageSelection::open(&path).unwrap();

        fs::write(&path, b"123456").unwrap();
        assert_eq!(image.revalidate().unwrap_err().code(), "image_unavailable");

        fs::remove_file(&path).unwrap();
        assert_eq!(image.revalidate().unwrap_err().code(), "image_unavailable");
    }

    #[test]
    fn test_list_filters_and_sorts() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("b.iso"), b"bb").unwrap();
        fs::write(temp_dir.path().join("a.IMG"), b"a").unwrap();
        fs::write(temp_dir.path().join("notes.txt"), b"x").unwrap();
        fs::create_dir(temp_dir.path().join("dir.iso")).unwrap();

        let images = list_available_images(temp_dir.path()).unwrap();
        let names: Vec<_> = images.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["a.IMG", "b.iso"]);
        assert_eq!(images[1].size, 2);
    }

    #[test]
    fn test_size_display() {
        assert_eq!(size_display(512), "512 B");
        assert_eq!(size_display(2048), "2.00 KB");
        assert_eq!(size_display(3 * 1024 * 1024), "3.00 MB");
        assert_eq!(size_display(2 * 1024 * 1024 * 1024), "2.00 GB");
    }
}
