//! Configuration management.
//!
//! Defaults are overlaid by `LOOPVOL_*` environment variables or by a JSON
//! config file. Directories must be absolute before a manager is built.

use crate::error::ConfigError;
use crate::units::parse_size;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Smallest volume the manager will create.
pub const MIN_VOLUME_SIZE_BYTES: u64 = 10_000_000;

/// Runtime configuration for loopvol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Lease markers, one subdirectory per mounted volume
    pub state_dir: PathBuf,
    /// Backing files
    pub data_dir: PathBuf,
    /// Mountpoints, one subdirectory per mounted volume
    pub mount_dir: PathBuf,
    /// Size used when a create request has no `size` option
    pub default_size: String,
    pub log_level: String,
    /// Prometheus exporter port, disabled when unset
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/run/loopvol/state"),
            data_dir: PathBuf::from("/var/lib/loopvol/data"),
            mount_dir: PathBuf::from("/mnt/loopvol"),
            default_size: "1GiB".to_string(),
            log_level: "info".to_string(),
            metrics_port: None,
        }
    }
}

impl Config {
    /// Defaults overridden by `LOOPVOL_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Load configuration from a JSON file; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read { path: path.to_path_buf(), source: e })?;
        serde_json::from_str(&content)
            .map_err(|e| ConfigError::Parse { path: path.to_path_buf(), source: e })
    }

    /// Apply overrides from `lookup`, keyed by environment variable name.
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(dir) = lookup("LOOPVOL_STATE_DIR") {
            self.state_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("LOOPVOL_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("LOOPVOL_MOUNT_DIR") {
            self.mount_dir = PathBuf::from(dir);
        }
        if let Some(size) = lookup("LOOPVOL_DEFAULT_SIZE") {
            self.default_size = size;
        }
        if let Some(level) = lookup("LOOPVOL_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(port) = lookup("LOOPVOL_METRICS_PORT") {
            let port = port.parse().map_err(|e: std::num::ParseIntError| {
                ConfigError::InvalidValue { field: "LOOPVOL_METRICS_PORT", reason: e.to_string() }
            })?;
            self.metrics_port = Some(port);
        }
        Ok(self)
    }

    /// Check directories are absolute and the default size parses.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_dir("StateDir", &self.state_dir)?;
        check_dir("DataDir", &self.data_dir)?;
        check_dir("MountDir", &self.mount_dir)?;
        self.default_size_bytes()?;
        Ok(())
    }

    pub fn default_size_bytes(&self) -> Result<u64, ConfigError> {
        if self.default_size.is_empty() {
            return Err(ConfigError::Missing { field: "DefaultSize" });
        }
        parse_size(&self.default_size)
            .map_err(|reason| ConfigError::InvalidValue { field: "DefaultSize", reason })
    }
}

fn check_dir(field: &'static str, path: &Path) -> Result<(), ConfigError> {
    if path.as_os_str().is_empty() {
        return Err(ConfigError::Missing { field });
    }
    if !path.is_absolute() {
        return Err(ConfigError::NotAbsolute { field, path: path.to_path_buf() });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.default_size_bytes().unwrap(), 1024 * 1024 * 1024);
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::default()
            .with_overrides(lookup(&[
                ("LOOPVOL_DATA_DIR", "/srv/data"),
                ("LOOPVOL_STATE_DIR", "/srv/state"),
                ("LOOPVOL_MOUNT_DIR", "/srv/mnt"),
                ("LOOPVOL_DEFAULT_SIZE", "20MB"),
                ("LOOPVOL_METRICS_PORT", "9400"),
            ]))
            .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/srv/data"));
        assert_eq!(config.state_dir, PathBuf::from("/srv/state"));
        assert_eq!(config.mount_dir, PathBuf::from("/srv/mnt"));
        assert_eq!(config.default_size_bytes().unwrap(), 20_000_000);
        assert_eq!(config.metrics_port, Some(9400));
    }

    #[test]
    fn test_bad_metrics_port() {
        let err =
            Config::default().with_overrides(lookup(&[("LOOPVOL_METRICS_PORT", "x")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_relative_dir_rejected() {
        let config = Config { data_dir: PathBuf::from("data"), ..Config::default() };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::NotAbsolute { field: "DataDir", .. }));
    }

    #[test]
    fn test_empty_dir_rejected() {
        let config = Config { mount_dir: PathBuf::new(), ..Config::default() };
        assert!(matches!(config.validate(), Err(ConfigError::Missing { field: "MountDir" })));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = Config::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"data_dir": "/data", "default_size": "50MB"}"#).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/data"));
        assert_eq!(config.default_size, "50MB");
        assert_eq!(config.mount_dir, Config::default().mount_dir);
    }
}
