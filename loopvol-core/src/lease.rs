//! Mount lease tracking.
//!
//! Each consumer holding a volume mounted is recorded as an empty marker file
//! `<state_dir>/<name>/<lease_id>`. The set of markers is the mount reference
//! count: the volume is physically mounted while the set is non-empty.

use crate::error::ErrorKind;
use crate::types::Volume;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

/// Lease markers for a single volume.
#[derive(Debug, Clone)]
pub struct LeaseTracker {
    /// Directory holding one marker per lease
    dir: PathBuf,
}

impl LeaseTracker {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn for_volume(volume: &Volume) -> Self {
        Self::new(&volume.state_dir_path)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Leases currently recorded. A missing directory means none.
    pub async fn list(&self) -> Result<BTreeSet<String>, ErrorKind> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(e) => return Err(ErrorKind::io(&self.dir, e)),
        };

        let mut leases = BTreeSet::new();
        while let Some(entry) = dir.next_entry().await.map_err(|e| ErrorKind::io(&self.dir, e))? {
            leases.insert(entry.file_name().to_string_lossy().to_string());
        }
        Ok(leases)
    }

    /// Whether any lease is held.
    pub async fn is_held(&self) -> Result<bool, ErrorKind> {
        Ok(!self.list().await?.is_empty())
    }

    /// Record `lease`, creating the lease directory when needed.
    ///
    /// Acquiring a lease that is already recorded leaves the set unchanged.
    #[instrument(skip(self), fields(dir = %self.dir.display()))]
    pub async fn acquire(&self, lease: &str) -> Result<(), ErrorKind> {
        let marker = self.marker_path(lease)?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| ErrorKind::LeaseError { lease: lease.to_string(), source: e })?;

        tokio::fs::File::create(&marker)
            .await
            .map_err(|e| ErrorKind::LeaseError { lease: lease.to_string(), source: e })?;

        debug!("Acquired lease {}", lease);
        metrics::counter!("loopvol_lease_acquired_total").increment(1);
        Ok(())
    }

    /// Drop `lease`.
    ///
    /// # Errors
    /// `LeaseNotFound` if the lease was never recorded.
    #[instrument(skip(self), fields(dir = %self.dir.display()))]
    pub async fn release(&self, lease: &str) -> Result<(), ErrorKind> {
        let marker = self.marker_path(lease)?;

        match tokio::fs::remove_file(&marker).await {
            Ok(()) => {
                debug!("Released lease {}", lease);
                metrics::counter!("loopvol_lease_released_total").increment(1);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ErrorKind::LeaseNotFound { lease: lease.to_string() })
            }
            Err(e) => Err(ErrorKind::LeaseError { lease: lease.to_string(), source: e }),
        }
    }

    /// Remove the lease directory once no leases remain.
    pub async fn remove_dir(&self) -> Result<(), ErrorKind> {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ErrorKind::io(&self.dir, e)),
        }
    }

    /// Lease ids become file names, so they must be a single path component.
    fn marker_path(&self, lease: &str) -> Result<PathBuf, ErrorKind> {
        if lease.is_empty() || lease == "." || lease == ".." || lease.contains('/') {
            return Err(ErrorKind::LeaseError {
                lease: lease.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "lease id must be a non-empty single path component",
                ),
            });
        }
        Ok(self.dir.join(lease))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tracker(dir: &TempDir) -> LeaseTracker {
        LeaseTracker::new(dir.path().join("state").join("db"))
    }

    #[tokio::test]
    async fn test_missing_dir_means_no_leases() {
        let dir = TempDir::new().unwrap();
        let leases = tracker(&dir);

        assert!(leases.list().await.unwrap().is_empty());
        assert!(!leases.is_held().await.unwrap());
    }

    #[tokio::test]
    async fn test_acquire_creates_dir_and_marker() {
        let dir = TempDir::new().unwrap();
        let leases = tracker(&dir);

        leases.acquire("c1").await.unwrap();

        let marker = leases.dir().join("c1");
        assert!(marker.is_file());
        assert_eq!(std::fs::metadata(marker).unwrap().len(), 0);
        assert!(leases.is_held().await.unwrap());
    }

    #[tokio::test]
    async fn test_acquire_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let leases = tracker(&dir);

        leases.acquire("c1").await.unwrap();
        leases.acquire("c1").await.unwrap();
        leases.acquire("c2").await.unwrap();

        let held = leases.list().await.unwrap();
        assert_eq!(held.into_iter().collect::<Vec<_>>(), vec!["c1", "c2"]);
    }

    #[tokio::test]
    async fn test_release() {
        let dir = TempDir::new().unwrap();
        let leases = tracker(&dir);

        leases.acquire("c1").await.unwrap();
        leases.acquire("c2").await.unwrap();
        leases.release("c1").await.unwrap();

        let held = leases.list().await.unwrap();
        assert!(held.contains("c2"));
        assert!(!held.contains("c1"));
    }

    #[tokio::test]
    async fn test_release_unknown_lease() {
        let dir = TempDir::new().unwrap();
        let leases = tracker(&dir);
        leases.acquire("c1").await.unwrap();

        let err = leases.release("nope").await.unwrap_err();
        assert!(matches!(err, ErrorKind::LeaseNotFound { .. }));
        assert_eq!(leases.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_release_without_dir() {
        let dir = TempDir::new().unwrap();
        let leases = tracker(&dir);

        let err = leases.release("c1").await.unwrap_err();
        assert!(matches!(err, ErrorKind::LeaseNotFound { .. }));
    }

    #[tokio::test]
    async fn test_rejects_path_like_lease_ids() {
        let dir = TempDir::new().unwrap();
        let leases = tracker(&dir);

        for bad in ["", ".", "..", "a/b"] {
            let err = leases.acquire(bad).await.unwrap_err();
            assert!(matches!(err, ErrorKind::LeaseError { .. }), "{:?}", bad);
        }
        assert!(!leases.dir().exists());
    }

    #[tokio::test]
    async fn test_remove_dir() {
        let dir = TempDir::new().unwrap();
        let leases = tracker(&dir);

        leases.acquire("c1").await.unwrap();
        leases.release("c1").await.unwrap();
        leases.remove_dir().await.unwrap();
        assert!(!leases.dir().exists());

        // Already gone is fine.
        leases.remove_dir().await.unwrap();
    }
}
