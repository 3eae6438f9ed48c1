//! Volume metadata resolution.
//!
//! The data directory is the only record of which volumes exist. A volume
//! named `db` formatted as ext4 is the regular file `<data_dir>/db.ext4`;
//! its sizes and creation time come from `stat()`. Nothing is cached, so
//! every call reflects the filesystem as it is right now.

use crate::error::ErrorKind;
use crate::name::validate_name;
use crate::types::{Filesystem, Volume};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument, warn};

/// `st_blocks` is always counted in 512-byte units.
const STAT_BLOCK_SIZE: u64 = 512;

/// Resolves volumes from the configured directories.
#[derive(Debug, Clone)]
pub struct VolumeResolver {
    data_dir: PathBuf,
    state_dir: PathBuf,
    mount_dir: PathBuf,
}

impl VolumeResolver {
    pub fn new(
        data_dir: impl Into<PathBuf>,
        state_dir: impl Into<PathBuf>,
        mount_dir: impl Into<PathBuf>,
    ) -> Self {
        Self { data_dir: data_dir.into(), state_dir: state_dir.into(), mount_dir: mount_dir.into() }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn data_file_path(&self, name: &str, fs: Filesystem) -> PathBuf {
        self.data_dir.join(format!("{}.{}", name, fs))
    }

    pub fn state_dir_path(&self, name: &str) -> PathBuf {
        self.state_dir.join(name)
    }

    pub fn mount_point_path(&self, name: &str) -> PathBuf {
        self.mount_dir.join(name)
    }

    /// Locate the single backing file for `name` and describe it.
    ///
    /// # Errors
    /// * `VolumeNotFound` if no `<name>.*` file exists
    /// * `AmbiguousVolumeState` if more than one does
    /// * `UnexpectedVolumeState` if the match is not a regular file or has an
    ///   unknown filesystem extension
    #[instrument(skip(self))]
    pub async fn resolve(&self, name: &str) -> Result<Volume, ErrorKind> {
        let data_dir = glob::Pattern::escape(&self.data_dir.to_string_lossy());
        let pattern = format!("{}/{}.*", data_dir, name);

        let entries = glob::glob(&pattern).map_err(|e| {
            ErrorKind::io(
                &self.data_dir,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()),
            )
        })?;

        let mut matches = Vec::new();
        for entry in entries {
            match entry {
                Ok(path) => matches.push(path),
                Err(e) => {
                    let path = e.path().to_path_buf();
                    return Err(ErrorKind::io(path, e.into_error()));
                }
            }
        }

        let data_file_path = match matches.len() {
            0 => return Err(ErrorKind::VolumeNotFound),
            1 => matches.remove(0),
            _ => return Err(ErrorKind::AmbiguousVolumeState { matches }),
        };

        let metadata = match tokio::fs::metadata(&data_file_path).await {
            Ok(metadata) => metadata,
            // Removed between the glob and the stat.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ErrorKind::VolumeNotFound)
            }
            Err(e) => return Err(ErrorKind::io(&data_file_path, e)),
        };

        if !metadata.is_file() {
            return Err(ErrorKind::UnexpectedVolumeState { path: data_file_path });
        }

        let filesystem = data_file_path
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| ext.parse::<Filesystem>().ok())
            .ok_or_else(|| ErrorKind::UnexpectedVolumeState { path: data_file_path.clone() })?;

        let created_at = metadata.modified().map_err(|e| ErrorKind::io(&data_file_path, e))?;

        debug!("Resolved {} ({} bytes, {})", name, metadata.len(), filesystem);

        Ok(Volume {
            name: name.to_string(),
            filesystem,
            max_size_bytes: metadata.len(),
            allocated_size_bytes: metadata.blocks() * STAT_BLOCK_SIZE,
            created_at,
            data_file_path,
            state_dir_path: self.state_dir_path(name),
            mount_point_path: self.mount_point_path(name),
        })
    }

    /// Names of all volumes present in the data directory.
    ///
    /// Regular files whose stem is not a valid volume name, or whose
    /// extension is not a supported filesystem, are skipped with a warning.
    /// A missing data directory holds no volumes.
    #[instrument(skip(self))]
    pub async fn volume_names(&self) -> Result<Vec<String>, ErrorKind> {
        let mut dir = match tokio::fs::read_dir(&self.data_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ErrorKind::io(&self.data_dir, e)),
        };

        let mut names = Vec::new();
        while let Some(entry) =
            dir.next_entry().await.map_err(|e| ErrorKind::io(&self.data_dir, e))?
        {
            let file_type = entry.file_type().await.map_err(|e| ErrorKind::io(entry.path(), e))?;
            if !file_type.is_file() {
                continue;
            }

            let path = entry.path();
            let stem = path.file_stem().and_then(|s| s.to_str());
            let known_fs = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.parse::<Filesystem>().is_ok());

            match stem {
                Some(stem) if known_fs && validate_name(stem).is_ok() => {
                    names.push(stem.to_string())
                }
                _ => warn!("Ignoring unrecognized file in data dir: {}", path.display()),
            }
        }

        names.sort();
        names.dedup();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn resolver(dir: &TempDir) -> VolumeResolver {
        VolumeResolver::new(
            dir.path().join("data"),
            dir.path().join("state"),
            dir.path().join("mnt"),
        )
    }

    fn make_file(path: &Path, len: u64) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::File::create(path).unwrap().set_len(len).unwrap();
    }

    #[tokio::test]
    async fn test_resolve_derives_metadata() {
        let dir = TempDir::new().unwrap();
        let resolver = resolver(&dir);
        make_file(&dir.path().join("data/db.ext4"), 50_000_000);

        let vol = resolver.resolve("db").await.unwrap();

        assert_eq!(vol.name, "db");
        assert_eq!(vol.filesystem, Filesystem::Ext4);
        assert_eq!(vol.max_size_bytes, 50_000_000);
        // set_len leaves a hole, so almost nothing is allocated
        assert!(vol.allocated_size_bytes < vol.max_size_bytes);
        assert_eq!(vol.data_file_path, dir.path().join("data/db.ext4"));
        assert_eq!(vol.state_dir_path, dir.path().join("state/db"));
        assert_eq!(vol.mount_point_path, dir.path().join("mnt/db"));
    }

    #[tokio::test]
    async fn test_resolve_missing() {
        let dir = TempDir::new().unwrap();
        let resolver = resolver(&dir);

        let err = resolver.resolve("db").await.unwrap_err();
        assert!(matches!(err, ErrorKind::VolumeNotFound));
    }

    #[tokio::test]
    async fn test_resolve_ambiguous() {
        let dir = TempDir::new().unwrap();
        let resolver = resolver(&dir);
        make_file(&dir.path().join("data/db.ext4"), 10);
        make_file(&dir.path().join("data/db.xfs"), 10);

        let err = resolver.resolve("db").await.unwrap_err();
        match err {
            ErrorKind::AmbiguousVolumeState { matches } => assert_eq!(matches.len(), 2),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_resolve_directory_is_unexpected() {
        let dir = TempDir::new().unwrap();
        let resolver = resolver(&dir);
        std::fs::create_dir_all(dir.path().join("data/db.ext4")).unwrap();

        let err = resolver.resolve("db").await.unwrap_err();
        assert!(matches!(err, ErrorKind::UnexpectedVolumeState { .. }));
    }

    #[tokio::test]
    async fn test_resolve_unknown_extension_is_unexpected() {
        let dir = TempDir::new().unwrap();
        let resolver = resolver(&dir);
        make_file(&dir.path().join("data/db.btrfs"), 10);

        let err = resolver.resolve("db").await.unwrap_err();
        assert!(matches!(err, ErrorKind::UnexpectedVolumeState { .. }));
    }

    #[tokio::test]
    async fn test_resolve_does_not_match_prefix_names() {
        let dir = TempDir::new().unwrap();
        let resolver = resolver(&dir);
        make_file(&dir.path().join("data/db2.ext4"), 10);

        assert!(matches!(resolver.resolve("db").await, Err(ErrorKind::VolumeNotFound)));
    }

    #[tokio::test]
    async fn test_volume_names() {
        let dir = TempDir::new().unwrap();
        let resolver = resolver(&dir);
        make_file(&dir.path().join("data/web.xfs"), 10);
        make_file(&dir.path().join("data/db.ext4"), 10);
        make_file(&dir.path().join("data/notes.txt"), 10);
        make_file(&dir.path().join("data/-bad.ext4"), 10);
        std::fs::create_dir_all(dir.path().join("data/subdir.ext4")).unwrap();

        let names = resolver.volume_names().await.unwrap();
        assert_eq!(names, vec!["db".to_string(), "web".to_string()]);
    }

    #[tokio::test]
    async fn test_volume_names_missing_data_dir() {
        let dir = TempDir::new().unwrap();
        let resolver = resolver(&dir);

        assert!(resolver.volume_names().await.unwrap().is_empty());
    }
}
