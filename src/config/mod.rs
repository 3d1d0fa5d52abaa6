//! Recorder configuration
//!
//! Values start from [`RecorderConfig::default`], may be overlaid by a JSON
//! file, and finally by the device/output paths given on the command line.

mod schema;

pub use schema::RecorderConfig;

use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{AppError, Result};

/// Command line overrides applied on top of the file configuration
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub device_path: Option<PathBuf>,
    pub output_path: Option<PathBuf>,
}

/// Read a configuration file; missing keys keep their defaults
pub fn read_config_file(path: &Path) -> Result<RecorderConfig> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        AppError::Config(format!("Failed to read config {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&text).map_err(|e| {
        AppError::Config(format!("Failed to parse config {}: {}", path.display(), e))
    })
}

/// Build the effective configuration and validate it
pub fn load_config(file: Option<&Path>, overrides: ConfigOverrides) -> Result<RecorderConfig> {
    let mut config = match file {
        Some(path) => {
            debug!("Loading configuration from {}", path.display());
            read_config_file(path)?
        }
        None => RecorderConfig::default(),
    };

    if let Some(device) = overrides.device_path {
        config.device_path = device;
    }
    if let Some(output) = overrides.output_path {
        config.output_path = output;
    }

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_without_file() {
        let config = load_config(None, ConfigOverrides::default()).unwrap();
        assert_eq!(config, RecorderConfig::default());
    }

    #[test]
    fn test_overrides_win_over_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"device_path": "/dev/video2", "output_path": "a.mkv", "fps": 30}}"#
        )
        .unwrap();

        let config = load_config(
            Some(file.path()),
            ConfigOverrides {
                device_path: None,
                output_path: Some(PathBuf::from("b.mp4")),
            },
        )
        .unwrap();

        assert_eq!(config.device_path, PathBuf::from("/dev/video2"));
        assert_eq!(config.output_path, PathBuf::from("b.mp4"));
        assert_eq!(config.fps, 30);
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let err = load_config(Some(file.path()), ConfigOverrides::default()).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        let err = load_config(Some(&path), ConfigOverrides::default()).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
        assert!(err.is_setup_error());
    }

    #[test]
    fn test_file_values_are_validated() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"fps": 0}}"#).unwrap();
        let err = load_config(Some(file.path()), ConfigOverrides::default()).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }
}
