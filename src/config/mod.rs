//! Configuration loading
//!
//! The configuration lives in a single TOML file. Every section and field is
//! optional; a missing file yields the defaults.

mod schema;

pub use schema::{AppConfig, GadgetConfig, KeyboardConfig, MsdConfig, PathsConfig, WriterConfig};

use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{AppError, Result};

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/labtool/labtool.toml";

/// Environment variable naming an alternative configuration file
pub const CONFIG_ENV: &str = "LABTOOL_CONFIG";

/// Resolve which configuration file to read (CLI arg takes precedence)
pub fn config_path(cli: Option<PathBuf>) -> PathBuf {
    cli.or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Load configuration from `path`, falling back to defaults if it does not exist
pub fn load(path: &Path) -> Result<AppConfig> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("No config file at {}, using defaults", path.display());
            return Ok(AppConfig::default());
        }
        Err(e) => {
            return Err(AppError::Config(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            )))
        }
    };

    let config = parse(&content)
        .map_err(|e| AppError::Config(format!("{}: {}", path.display(), e)))?;
    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

/// Parse configuration from TOML text
pub fn parse(content: &str) -> Result<AppConfig> {
    toml::from_str(content).map_err(|e| AppError::Config(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_follow_lab_tool() {
        let config = AppConfig::default();
        assert_eq!(config.gadget.name, "g1");
        assert_eq!(config.gadget.vendor_id, 0x1f3a);
        assert_eq!(config.gadget.product_id, 0x1001);
        assert_eq!(config.gadget.max_power_ma, 500);
        assert!(config.msd.read_only);
        assert_eq!(config.writer.chunk_size, 4 * 1024 * 1024);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = parse(
            r#"
            [gadget]
            udc = "musb-hdrc.2.auto"

            [writer]
            chunk_size = 1048576
            "#,
        )
        .unwrap();

        assert_eq!(config.gadget.udc.as_deref(), Some("musb-hdrc.2.auto"));
        assert_eq!(config.gadget.name, "g1");
        assert_eq!(config.writer.chunk_size, 1024 * 1024);
        assert_eq!(config.keyboard, KeyboardConfig::default());
    }

    #[test]
    fn test_missing_file_is_default() {
        let temp_dir = TempDir::new().unwrap();
        let config = load(&temp_dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.gadget, GadgetConfig::default());
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("labtool.toml");
        std::fs::write(&path, "[gadget\nname = ").unwrap();

        let err = load(&path).unwrap_err();
        assert_eq!(err.code(), "config");
    }

    #[test]
    fn test_cli_path_wins() {
        let path = config_path(Some(PathBuf::from("/tmp/custom.toml")));
        assert_eq!(path, PathBuf::from("/tmp/custom.toml"));
    }
}
