//! Volume lifecycle orchestration.
//!
//! The manager combines the resolver, the lease tracker and the allocation
//! strategy, and is the only component that formats, mounts or unmounts
//! anything. It holds no volume state of its own: every operation re-reads
//! the data and state directories.
//!
//! The manager is not synchronized. Operations must be serialized by the
//! caller, which [`crate::driver::VolumeDriver`] does with a single lock.

use crate::allocation::{allocate, remove_partial};
use crate::config::{Config, MIN_VOLUME_SIZE_BYTES};
use crate::error::{ConfigError, ErrorKind, Operation, Result, VolumeError};
use crate::host::{run_checked, CommandRunner};
use crate::lease::LeaseTracker;
use crate::name::validate_name;
use crate::observability::metrics::set_lease_count;
use crate::resolver::VolumeResolver;
use crate::types::{Filesystem, Volume};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Lease held while the manager itself needs a volume mounted during create.
pub const INTERNAL_LEASE: &str = "loopvol-create";

/// Largest permission value accepted for a volume root.
pub const MAX_MODE: u32 = 0o7777;

/// Parameters for [`VolumeManager::create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOptions {
    pub size_bytes: u64,
    pub sparse: bool,
    /// Requested filesystem, checked against [`Filesystem`]
    pub filesystem: String,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Root permissions; `None` or `0` leaves the mkfs default
    pub mode: Option<u32>,
}

impl CreateOptions {
    pub fn new(size_bytes: u64, filesystem: impl Into<String>) -> Self {
        Self {
            size_bytes,
            sparse: false,
            filesystem: filesystem.into(),
            uid: None,
            gid: None,
            mode: None,
        }
    }

    fn mode(&self) -> Option<u32> {
        self.mode.filter(|mode| *mode > 0)
    }

    fn needs_root_setup(&self) -> bool {
        self.uid.is_some() || self.gid.is_some() || self.mode().is_some()
    }
}

/// Creates, mounts, unmounts and deletes loopback volumes.
pub struct VolumeManager {
    resolver: VolumeResolver,
    runner: Arc<dyn CommandRunner>,
}

impl VolumeManager {
    /// Build a manager over the directories in `config`.
    ///
    /// # Errors
    /// Returns a `ConfigError` if any directory is missing or relative.
    pub fn new(
        config: &Config,
        runner: Arc<dyn CommandRunner>,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        info!(
            data_dir = %config.data_dir.display(),
            state_dir = %config.state_dir.display(),
            mount_dir = %config.mount_dir.display(),
            "Volume manager initialized"
        );
        Ok(Self {
            resolver: VolumeResolver::new(&config.data_dir, &config.state_dir, &config.mount_dir),
            runner,
        })
    }

    /// Create and format a new volume.
    #[instrument(
        skip(self, options),
        fields(volume = %name, size = options.size_bytes, fs = %options.filesystem)
    )]
    pub async fn create(&self, name: &str, options: &CreateOptions) -> Result<()> {
        match self.create_volume(name, options).await {
            Ok(()) => {
                info!("Volume {} created", name);
                metrics::counter!("loopvol_volume_created_total").increment(1);
                Ok(())
            }
            Err(kind) => {
                metrics::counter!("loopvol_volume_create_failures_total", "kind" => kind.label())
                    .increment(1);
                Err(VolumeError::new(Operation::Create, name, kind))
            }
        }
    }

    /// Every volume in the data directory.
    #[instrument(skip(self))]
    pub async fn list(&self) -> Result<Vec<Volume>> {
        let names = self.resolver.volume_names().await.map_err(VolumeError::listing)?;

        let mut volumes = Vec::with_capacity(names.len());
        for name in names {
            let volume = self
                .resolver
                .resolve(&name)
                .await
                .map_err(|kind| VolumeError::new(Operation::List, &name, kind))?;
            volumes.push(volume);
        }

        debug!("Listed {} volumes", volumes.len());
        Ok(volumes)
    }

    /// Current metadata for one volume.
    #[instrument(skip(self), fields(volume = %name))]
    pub async fn get(&self, name: &str) -> Result<Volume> {
        self.get_volume(name).await.map_err(|kind| VolumeError::new(Operation::Get, name, kind))
    }

    /// Record `lease` on the volume, mounting it if no other lease is held.
    ///
    /// Returns the mountpoint, which is the same for every lease.
    #[instrument(skip(self), fields(volume = %name))]
    pub async fn mount(&self, name: &str, lease: &str) -> Result<PathBuf> {
        self.mount_volume(name, lease)
            .await
            .map_err(|kind| VolumeError::new(Operation::Mount, name, kind))
    }

    /// Drop `lease`, unmounting the volume once no leases remain.
    #[instrument(skip(self), fields(volume = %name))]
    pub async fn unmount(&self, name: &str, lease: &str) -> Result<()> {
        self.unmount_volume(name, lease)
            .await
            .map_err(|kind| VolumeError::new(Operation::Unmount, name, kind))
    }

    /// Remove an unmounted volume's backing file.
    #[instrument(skip(self), fields(volume = %name))]
    pub async fn delete(&self, name: &str) -> Result<()> {
        self.delete_volume(name)
            .await
            .map_err(|kind| VolumeError::new(Operation::Delete, name, kind))?;
        info!("Volume {} deleted", name);
        metrics::counter!("loopvol_volume_deleted_total").increment(1);
        Ok(())
    }

    async fn create_volume(
        &self,
        name: &str,
        options: &CreateOptions,
    ) -> std::result::Result<(), ErrorKind> {
        validate_name(name)?;

        if options.size_bytes < MIN_VOLUME_SIZE_BYTES {
            return Err(ErrorKind::SizeTooSmall {
                requested: options.size_bytes,
                minimum: MIN_VOLUME_SIZE_BYTES,
            });
        }

        let fs: Filesystem = options
            .filesystem
            .parse()
            .map_err(|fs| ErrorKind::UnsupportedFilesystem { fs })?;

        if let Some(mode) = options.mode() {
            if mode > MAX_MODE {
                return Err(ErrorKind::InvalidMode { mode });
            }
        }

        // Allocating over an existing backing file would reformat it.
        match self.resolver.resolve(name).await {
            Err(ErrorKind::VolumeNotFound) => {}
            Ok(_) | Err(ErrorKind::AmbiguousVolumeState { .. }) => {
                return Err(ErrorKind::VolumeExists)
            }
            Err(other) => return Err(other),
        }

        let data_dir = self.resolver.data_dir();
        tokio::fs::create_dir_all(data_dir).await.map_err(|e| ErrorKind::io(data_dir, e))?;

        let data_file = self.resolver.data_file_path(name, fs);
        let method =
            allocate(self.runner.as_ref(), &data_file, options.size_bytes, options.sparse).await?;
        debug!("Allocated {} ({})", data_file.display(), method.as_str());

        let mut args: Vec<String> = fs.mkfs_args().iter().map(|a| a.to_string()).collect();
        args.push(data_file.to_string_lossy().to_string());
        if let Err(reason) = run_checked(self.runner.as_ref(), &fs.mkfs_program(), &args).await {
            remove_partial(&data_file).await;
            return Err(ErrorKind::FormatFailed { fs: fs.to_string(), reason });
        }
        debug!("Formatted {} as {}", data_file.display(), fs);

        if options.needs_root_setup() {
            if let Err(reason) = self.setup_root(name, options).await {
                remove_partial(&data_file).await;
                return Err(ErrorKind::OwnershipSetupFailed { reason });
            }
        }

        Ok(())
    }

    /// Mount under [`INTERNAL_LEASE`] and apply mode, then ownership.
    async fn setup_root(
        &self,
        name: &str,
        options: &CreateOptions,
    ) -> std::result::Result<(), String> {
        let mount_point = self
            .mount_volume(name, INTERNAL_LEASE)
            .await
            .map_err(|kind| format!("cannot mount volume: {}", kind))?;
        let target = mount_point.to_string_lossy().to_string();

        let mut result = Ok(());

        if let Some(mode) = options.mode() {
            let args = vec![format!("{:04o}", mode), target.clone()];
            result = run_checked(self.runner.as_ref(), "chmod", &args)
                .await
                .map_err(|reason| format!("cannot adjust volume root permissions: {}", reason));
        }

        if result.is_ok() {
            if let Some(owner) = chown_spec(options.uid, options.gid) {
                let args = vec![owner, target];
                result = run_checked(self.runner.as_ref(), "chown", &args)
                    .await
                    .map_err(|reason| format!("cannot adjust volume root owner: {}", reason));
            }
        }

        match (result, self.unmount_volume(name, INTERNAL_LEASE).await) {
            (Ok(()), Ok(())) => Ok(()),
            (Ok(()), Err(kind)) => Err(format!("cannot unmount volume after setup: {}", kind)),
            (Err(reason), unmounted) => {
                if let Err(kind) = unmounted {
                    warn!("Failed to unmount {} after root setup failure: {}", name, kind);
                }
                Err(reason)
            }
        }
    }

    async fn get_volume(&self, name: &str) -> std::result::Result<Volume, ErrorKind> {
        validate_name(name)?;
        self.resolver.resolve(name).await
    }

    async fn mount_volume(
        &self,
        name: &str,
        lease: &str,
    ) -> std::result::Result<PathBuf, ErrorKind> {
        let volume = self.get_volume(name).await?;
        let leases = LeaseTracker::for_volume(&volume);

        // Decided before recording the new lease.
        let already_mounted = leases.is_held().await?;

        leases.acquire(lease).await?;

        if already_mounted {
            debug!("Volume {} already mounted, recorded lease {}", name, lease);
            report_leases(name, &leases).await;
            return Ok(volume.mount_point_path);
        }

        if let Err(kind) = self.attach(&volume).await {
            self.rollback_lease(&volume, &leases, lease).await;
            return Err(kind);
        }

        info!("Mounted {} at {}", name, volume.mount_point_path.display());
        metrics::counter!("loopvol_mount_total").increment(1);
        set_lease_count(name, 1);
        Ok(volume.mount_point_path)
    }

    async fn attach(&self, volume: &Volume) -> std::result::Result<(), ErrorKind> {
        let mount_point = &volume.mount_point_path;

        tokio::fs::create_dir_all(mount_point).await.map_err(|e| ErrorKind::MountFailed {
            reason: format!("cannot create mount point dir {:?}: {}", mount_point, e),
        })?;

        let mut args: Vec<String> =
            volume.filesystem.mount_args().iter().map(|a| a.to_string()).collect();
        args.push(volume.data_file_path.to_string_lossy().to_string());
        args.push(mount_point.to_string_lossy().to_string());

        run_checked(self.runner.as_ref(), "mount", &args).await.map_err(|reason| {
            ErrorKind::MountFailed {
                reason: format!(
                    "cannot mount data file {:?} at {:?}: {}",
                    volume.data_file_path, mount_point, reason
                ),
            }
        })
    }

    /// Undo a lease recorded by a mount that failed to attach.
    async fn rollback_lease(&self, volume: &Volume, leases: &LeaseTracker, lease: &str) {
        if let Err(kind) = leases.release(lease).await {
            warn!("Failed to release lease {} after mount failure: {}", lease, kind);
            return;
        }

        match leases.is_held().await {
            Ok(false) => {
                if let Err(kind) = leases.remove_dir().await {
                    warn!("Failed to remove lease dir after mount failure: {}", kind);
                }
                if let Err(e) = tokio::fs::remove_dir(&volume.mount_point_path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(
                            "Failed to remove mount point {} after mount failure: {}",
                            volume.mount_point_path.display(),
                            e
                        );
                    }
                }
            }
            Ok(true) => {}
            Err(kind) => warn!("Failed to recount leases after mount failure: {}", kind),
        }
    }

    async fn unmount_volume(&self, name: &str, lease: &str) -> std::result::Result<(), ErrorKind> {
        let volume = self.get_volume(name).await?;
        let leases = LeaseTracker::for_volume(&volume);

        leases.release(lease).await?;

        if leases.is_held().await? {
            debug!("Volume {} still leased, released {}", name, lease);
            report_leases(name, &leases).await;
            return Ok(());
        }

        // The lease is gone from here on, even if the unmount fails.
        leases.remove_dir().await?;
        set_lease_count(name, 0);

        let mount_point = &volume.mount_point_path;
        let args = vec!["-ld".to_string(), mount_point.to_string_lossy().to_string()];
        run_checked(self.runner.as_ref(), "umount", &args).await.map_err(|reason| {
            ErrorKind::UnmountFailed {
                reason: format!(
                    "cannot unmount data file {:?} from mount point {:?}: {}",
                    volume.data_file_path, mount_point, reason
                ),
            }
        })?;

        match tokio::fs::remove_dir(mount_point).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(ErrorKind::UnmountFailed {
                    reason: format!("cannot remove mount point dir {:?}: {}", mount_point, e),
                })
            }
        }

        info!("Unmounted {} from {}", name, mount_point.display());
        metrics::counter!("loopvol_unmount_total").increment(1);
        Ok(())
    }

    async fn delete_volume(&self, name: &str) -> std::result::Result<(), ErrorKind> {
        let volume = self.get_volume(name).await?;

        let leases = LeaseTracker::for_volume(&volume).list().await?;
        if !leases.is_empty() {
            return Err(ErrorKind::VolumeInUse { leases: leases.len() });
        }

        tokio::fs::remove_file(&volume.data_file_path)
            .await
            .map_err(|e| ErrorKind::io(&volume.data_file_path, e))
    }
}

async fn report_leases(name: &str, leases: &LeaseTracker) {
    match leases.list().await {
        Ok(held) => set_lease_count(name, held.len()),
        Err(kind) => debug!("Skipping lease gauge for {}: {}", name, kind),
    }
}

/// Argument for `chown`: `uid:gid`, `uid`, or `:gid`.
fn chown_spec(uid: Option<u32>, gid: Option<u32>) -> Option<String> {
    match (uid, gid) {
        (Some(uid), Some(gid)) => Some(format!("{}:{}", uid, gid)),
        (Some(uid), None) => Some(uid.to_string()),
        (None, Some(gid)) => Some(format!(":{}", gid)),
        (None, None) => None,
    }
}
