//! Volume plugin driver.
//!
//! Translates plugin requests (a volume name plus string options, or a
//! volume name plus a consumer id) into [`VolumeManager`] calls. Every
//! request holds the driver's mutex and then the state directory's
//! [`StateLock`], so no two operations ever interleave their filesystem side
//! effects, whichever volumes they touch and whichever process runs them.

use crate::config::Config;
use crate::error::{ConfigError, VolumeError};
use crate::host::CommandRunner;
use crate::lock::StateLock;
use crate::manager::{CreateOptions, VolumeManager, MAX_MODE};
use crate::units::parse_size;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, instrument};

/// Option names accepted by [`VolumeDriver::create`].
pub const ALLOWED_OPTIONS: [&str; 6] = ["size", "sparse", "fs", "uid", "gid", "mode"];

/// Filesystem used when a create request has no `fs` option.
pub const DEFAULT_FILESYSTEM: &str = "xfs";

/// Driver-level errors.
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("options '{unsupported}' are not among supported ones: {supported}")]
    UnsupportedOptions { unsupported: String, supported: String },

    #[error("cannot parse '{option}' option value '{value}': {reason}")]
    InvalidOption { option: &'static str, value: String, reason: String },

    #[error("cannot lock state directory {path:?}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Volume(#[from] VolumeError),
}

pub type Result<T> = std::result::Result<T, DriverError>;

/// Volume as reported to the plugin caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VolumeInfo {
    pub name: String,
    pub mountpoint: String,
    pub created_at: String,
    pub status: BTreeMap<String, String>,
}

/// Entry of a volume listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VolumeSummary {
    pub name: String,
}

/// Driver capabilities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Capabilities {
    pub scope: String,
}

/// Serialized front end to a [`VolumeManager`].
pub struct VolumeDriver {
    manager: VolumeManager,
    default_size: u64,
    state_dir: PathBuf,
    lock: Mutex<()>,
}

/// Both locks held for one request. The file lock is released first.
struct RequestGuard<'a> {
    _state: StateLock,
    _local: MutexGuard<'a, ()>,
}

impl VolumeDriver {
    /// Build a driver from validated configuration.
    pub fn new(
        config: &Config,
        runner: Arc<dyn CommandRunner>,
    ) -> std::result::Result<Self, ConfigError> {
        let default_size = config.default_size_bytes()?;
        let manager = VolumeManager::new(config, runner)?;
        info!(default_size, "Driver initiated");
        Ok(Self {
            manager,
            default_size,
            state_dir: config.state_dir.clone(),
            lock: Mutex::new(()),
        })
    }

    async fn serialize(&self) -> Result<RequestGuard<'_>> {
        let local = self.lock.lock().await;
        let state = StateLock::acquire(&self.state_dir)
            .await
            .map_err(|source| DriverError::Lock { path: self.state_dir.clone(), source })?;
        Ok(RequestGuard { _state: state, _local: local })
    }

    #[instrument(
        skip(self, options),
        fields(request_id = %request_id(), method = "create", volume = %name)
    )]
    pub async fn create(&self, name: &str, options: &HashMap<String, String>) -> Result<()> {
        let create = parse_create_options(options, self.default_size)?;

        let _guard = self.serialize().await?;
        debug!("Starting creation");
        self.manager.create(name, &create).await?;
        debug!("Finished creating volume");
        Ok(())
    }

    #[instrument(skip(self), fields(request_id = %request_id(), method = "list"))]
    pub async fn list(&self) -> Result<Vec<VolumeSummary>> {
        let _guard = self.serialize().await?;
        let volumes = self.manager.list().await?;
        debug!(count = volumes.len(), "Finished listing volumes");
        Ok(volumes.into_iter().map(|v| VolumeSummary { name: v.name }).collect())
    }

    #[instrument(skip(self), fields(request_id = %request_id(), method = "get", volume = %name))]
    pub async fn get(&self, name: &str) -> Result<VolumeInfo> {
        let _guard = self.serialize().await?;
        let volume = self.manager.get(name).await?;

        let mut status = BTreeMap::new();
        status.insert("fs".to_string(), volume.filesystem.to_string());
        status.insert("size-max".to_string(), volume.max_size_bytes.to_string());
        status.insert("size-allocated".to_string(), volume.allocated_size_bytes.to_string());

        Ok(VolumeInfo {
            name: volume.name,
            mountpoint: volume.mount_point_path.to_string_lossy().to_string(),
            created_at: DateTime::<Utc>::from(volume.created_at).to_rfc3339(),
            status,
        })
    }

    #[instrument(skip(self), fields(request_id = %request_id(), method = "path", volume = %name))]
    pub async fn path(&self, name: &str) -> Result<PathBuf> {
        let _guard = self.serialize().await?;
        Ok(self.manager.get(name).await?.mount_point_path)
    }

    #[instrument(skip(self), fields(request_id = %request_id(), method = "mount", volume = %name))]
    pub async fn mount(&self, name: &str, id: &str) -> Result<PathBuf> {
        let _guard = self.serialize().await?;
        debug!("Starting mount");
        let mount_point = self.manager.mount(name, id).await?;
        debug!("Finished mounting volume");
        Ok(mount_point)
    }

    #[instrument(
        skip(self),
        fields(request_id = %request_id(), method = "unmount", volume = %name)
    )]
    pub async fn unmount(&self, name: &str, id: &str) -> Result<()> {
        let _guard = self.serialize().await?;
        debug!("Starting unmount");
        self.manager.unmount(name, id).await?;
        debug!("Finished unmounting volume");
        Ok(())
    }

    #[instrument(skip(self), fields(request_id = %request_id(), method = "remove", volume = %name))]
    pub async fn remove(&self, name: &str) -> Result<()> {
        let _guard = self.serialize().await?;
        self.manager.delete(name).await?;
        Ok(())
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities { scope: "local".to_string() }
    }
}

/// Short id correlating the log lines of one request.
fn request_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Turn plugin options into [`CreateOptions`].
pub fn parse_create_options(
    options: &HashMap<String, String>,
    default_size: u64,
) -> Result<CreateOptions> {
    let mut unsupported: Vec<&str> = options
        .keys()
        .map(String::as_str)
        .filter(|key| !ALLOWED_OPTIONS.contains(key))
        .collect();
    if !unsupported.is_empty() {
        unsupported.sort_unstable();
        return Err(DriverError::UnsupportedOptions {
            unsupported: unsupported.join(", "),
            supported: ALLOWED_OPTIONS.join(", "),
        });
    }

    let size_bytes = match options.get("size") {
        Some(size) => parse_size(size).map_err(|reason| DriverError::InvalidOption {
            option: "size",
            value: size.clone(),
            reason,
        })?,
        None => {
            debug!(default = default_size, "No size option, using default");
            default_size
        }
    };

    let sparse = match options.get("sparse") {
        Some(value) => parse_bool(value).ok_or_else(|| DriverError::InvalidOption {
            option: "sparse",
            value: value.clone(),
            reason: "expected a boolean".to_string(),
        })?,
        None => false,
    };

    let filesystem = match options.get("fs").map(|fs| fs.trim().to_lowercase()) {
        Some(fs) if !fs.is_empty() => fs,
        _ => DEFAULT_FILESYSTEM.to_string(),
    };

    let uid = parse_id(options, "uid")?;
    let gid = parse_id(options, "gid")?;
    let mode = parse_mode(options)?;

    Ok(CreateOptions { size_bytes, sparse, filesystem, uid, gid, mode })
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "t" | "true" | "yes" => Some(true),
        "0" | "f" | "false" | "no" => Some(false),
        _ => None,
    }
}

fn parse_id(options: &HashMap<String, String>, option: &'static str) -> Result<Option<u32>> {
    let value = match options.get(option) {
        Some(value) if !value.is_empty() => value,
        _ => return Ok(None),
    };
    let invalid = |reason: String| DriverError::InvalidOption {
        option,
        value: value.clone(),
        reason,
    };

    let id: i64 =
        value.trim().parse().map_err(|e: std::num::ParseIntError| invalid(e.to_string()))?;
    if id < 0 {
        return Err(invalid("should be >= 0".to_string()));
    }
    u32::try_from(id).map(Some).map_err(|e| invalid(e.to_string()))
}

fn parse_mode(options: &HashMap<String, String>) -> Result<Option<u32>> {
    let value = match options.get("mode") {
        Some(value) if !value.is_empty() => value,
        _ => return Ok(None),
    };

    let mode = u32::from_str_radix(value.trim(), 8).map_err(|e| DriverError::InvalidOption {
        option: "mode",
        value: value.clone(),
        reason: format!("expected an octal permission: {}", e),
    })?;
    if mode == 0 || mode > MAX_MODE {
        return Err(DriverError::InvalidOption {
            option: "mode",
            value: value.clone(),
            reason: "does not fall between 0 and 7777 in octal encoding".to_string(),
        });
    }
    Ok(Some(mode))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_defaults() {
        let parsed = parse_create_options(&opts(&[]), 1_000_000_000).unwrap();
        assert_eq!(parsed, CreateOptions::new(1_000_000_000, "xfs"));
    }

    #[test]
    fn test_all_options() {
        let parsed = parse_create_options(
            &opts(&[
                ("size", "50MB"),
                ("sparse", "TRUE"),
                ("fs", " EXT4 "),
                ("uid", "1000"),
                ("gid", "100"),
                ("mode", "0750"),
            ]),
            0,
        )
        .unwrap();

        assert_eq!(parsed.size_bytes, 50_000_000);
        assert!(parsed.sparse);
        assert_eq!(parsed.filesystem, "ext4");
        assert_eq!(parsed.uid, Some(1000));
        assert_eq!(parsed.gid, Some(100));
        assert_eq!(parsed.mode, Some(0o750));
    }

    #[test]
    fn test_unsupported_options_are_sorted() {
        let err = parse_create_options(&opts(&[("zeta", "1"), ("alpha", "2"), ("size", "1G")]), 0)
            .unwrap_err();
        match err {
            DriverError::UnsupportedOptions { unsupported, .. } => {
                assert_eq!(unsupported, "alpha, zeta")
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_empty_values_mean_unset() {
        let parsed =
            parse_create_options(&opts(&[("fs", ""), ("uid", ""), ("gid", ""), ("mode", "")]), 1)
                .unwrap();
        assert_eq!(parsed.filesystem, DEFAULT_FILESYSTEM);
        assert_eq!(parsed.uid, None);
        assert_eq!(parsed.gid, None);
        assert_eq!(parsed.mode, None);
    }

    #[test]
    fn test_invalid_values() {
        for (key, value) in [
            ("size", "lots"),
            ("sparse", "maybe"),
            ("uid", "-1"),
            ("gid", "abc"),
            ("mode", "0"),
            ("mode", "17777"),
            ("mode", "0789"),
        ] {
            let err = parse_create_options(&opts(&[(key, value)]), 1).unwrap_err();
            assert!(
                matches!(err, DriverError::InvalidOption { .. }),
                "{}={} should be rejected",
                key,
                value
            );
        }
    }

    #[test]
    fn test_request_id_is_short() {
        assert_eq!(request_id().len(), 8);
    }

    #[test]
    fn test_volume_info_wire_shape() {
        let info = VolumeInfo {
            name: "db".to_string(),
            mountpoint: "/mnt/loopvol/db".to_string(),
            created_at: "2024-01-01T00:00:00+00:00".to_string(),
            status: BTreeMap::from([("fs".to_string(), "ext4".to_string())]),
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["Name"], "db");
        assert_eq!(json["Mountpoint"], "/mnt/loopvol/db");
        assert_eq!(json["Status"]["fs"], "ext4");
    }
}
