//! Volume domain types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::SystemTime;

/// Loopback volume, as observed on disk.
///
/// Never persisted; every field is derived from the backing file and the
/// configured directories each time the volume is resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    /// Volume name
    pub name: String,

    /// Filesystem, taken from the backing file's extension
    pub filesystem: Filesystem,

    /// Logical length of the backing file
    pub max_size_bytes: u64,

    /// Bytes physically allocated to the backing file
    pub allocated_size_bytes: u64,

    /// Backing file modification time
    pub created_at: SystemTime,

    /// `<data_dir>/<name>.<fs>`
    pub data_file_path: PathBuf,

    /// `<state_dir>/<name>`
    pub state_dir_path: PathBuf,

    /// `<mount_dir>/<name>`
    pub mount_point_path: PathBuf,
}

/// Supported volume filesystems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Filesystem {
    Ext4,
    Xfs,
}

impl Filesystem {
    /// Extension of the backing file, also the `mkfs.<fs>` suffix.
    pub fn as_str(&self) -> &'static str {
        match self {
            Filesystem::Ext4 => "ext4",
            Filesystem::Xfs => "xfs",
        }
    }

    pub fn mkfs_program(&self) -> String {
        format!("mkfs.{}", self.as_str())
    }

    pub fn mkfs_args(&self) -> &'static [&'static str] {
        match self {
            // ext4 asks for confirmation when formatting a regular file
            Filesystem::Ext4 => &["-F"],
            Filesystem::Xfs => &[],
        }
    }

    pub fn mount_args(&self) -> &'static [&'static str] {
        match self {
            Filesystem::Ext4 => &[],
            // xfs refuses to mount two volumes formatted with the same uuid
            Filesystem::Xfs => &["-o", "nouuid"],
        }
    }
}

impl fmt::Display for Filesystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Filesystem {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ext4" => Ok(Filesystem::Ext4),
            "xfs" => Ok(Filesystem::Xfs),
            other => Err(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filesystem_parse() {
        assert_eq!("ext4".parse::<Filesystem>(), Ok(Filesystem::Ext4));
        assert_eq!(" XFS ".parse::<Filesystem>(), Ok(Filesystem::Xfs));
        assert_eq!("btrfs".parse::<Filesystem>(), Err("btrfs".to_string()));
    }

    #[test]
    fn test_filesystem_flags() {
        assert_eq!(Filesystem::Ext4.mkfs_program(), "mkfs.ext4");
        assert_eq!(Filesystem::Ext4.mkfs_args(), &["-F"]);
        assert!(Filesystem::Xfs.mkfs_args().is_empty());
        assert!(Filesystem::Ext4.mount_args().is_empty());
        assert_eq!(Filesystem::Xfs.mount_args(), &["-o", "nouuid"]);
    }

    #[test]
    fn test_filesystem_serde_lowercase() {
        let json = serde_json::to_string(&Filesystem::Xfs).unwrap();
        assert_eq!(json, "\"xfs\"");
    }
}
