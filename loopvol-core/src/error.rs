//! Error types for loopvol.
//!
//! Manager failures are reported as a [`VolumeError`], which pairs the
//! operation and volume name with an [`ErrorKind`] describing the failed step.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for volume manager operations.
pub type Result<T> = std::result::Result<T, VolumeError>;

/// Operation a [`VolumeError`] was raised from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    List,
    Get,
    Mount,
    Unmount,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self {
            Operation::Create => "creating",
            Operation::List => "listing",
            Operation::Get => "retrieving",
            Operation::Mount => "mounting",
            Operation::Unmount => "un-mounting",
            Operation::Delete => "deleting",
        };
        f.write_str(verb)
    }
}

/// What went wrong, independent of which operation hit it.
#[derive(Error, Debug)]
pub enum ErrorKind {
    // Request validation
    #[error("invalid volume name: {reason}")]
    InvalidName { reason: String },

    #[error("requested size {requested} bytes is smaller than minimum allowed {minimum} bytes")]
    SizeTooSmall { requested: u64, minimum: u64 },

    #[error("only xfs and ext4 filesystems are supported, '{fs}' requested")]
    UnsupportedFilesystem { fs: String },

    #[error("mode {mode:#o} does not fall between 0 and 07777")]
    InvalidMode { mode: u32 },

    // Creation steps
    #[error("cannot allocate data file: {reason}")]
    AllocationFailed { reason: String },

    #[error("not enough disk space: {reason}")]
    InsufficientSpace { reason: String },

    #[error("cannot format data file as {fs} filesystem: {reason}")]
    FormatFailed { fs: String, reason: String },

    #[error("cannot adjust volume root owner/permissions: {reason}")]
    OwnershipSetupFailed { reason: String },

    // On-disk state
    #[error("volume does not exist")]
    VolumeNotFound,

    #[error("volume already exists")]
    VolumeExists,

    #[error("more than 1 data file found: {matches:?}")]
    AmbiguousVolumeState { matches: Vec<PathBuf> },

    #[error("data path expected to be a regular file with a known extension: {path:?}")]
    UnexpectedVolumeState { path: PathBuf },

    // Leases and mounts
    #[error("cannot find lease '{lease}'")]
    LeaseNotFound { lease: String },

    #[error("cannot record lease '{lease}': {source}")]
    LeaseError {
        lease: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot mount: {reason}")]
    MountFailed { reason: String },

    #[error("cannot unmount: {reason}")]
    UnmountFailed { reason: String },

    #[error("still in use by {leases} lease(s)")]
    VolumeInUse { leases: usize },

    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ErrorKind {
    /// Build an `Io` kind for the given path.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    /// Short stable label, used for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::InvalidName { .. } => "invalid_name",
            ErrorKind::SizeTooSmall { .. } => "size_too_small",
            ErrorKind::UnsupportedFilesystem { .. } => "unsupported_filesystem",
            ErrorKind::InvalidMode { .. } => "invalid_mode",
            ErrorKind::AllocationFailed { .. } => "allocation_failed",
            ErrorKind::InsufficientSpace { .. } => "insufficient_space",
            ErrorKind::FormatFailed { .. } => "format_failed",
            ErrorKind::OwnershipSetupFailed { .. } => "ownership_setup_failed",
            ErrorKind::VolumeNotFound => "volume_not_found",
            ErrorKind::VolumeExists => "volume_exists",
            ErrorKind::AmbiguousVolumeState { .. } => "ambiguous_volume_state",
            ErrorKind::UnexpectedVolumeState { .. } => "unexpected_volume_state",
            ErrorKind::LeaseNotFound { .. } => "lease_not_found",
            ErrorKind::LeaseError { .. } => "lease_error",
            ErrorKind::MountFailed { .. } => "mount_failed",
            ErrorKind::UnmountFailed { .. } => "unmount_failed",
            ErrorKind::VolumeInUse { .. } => "volume_in_use",
            ErrorKind::Io { .. } => "io",
        }
    }
}

/// A failed manager operation, on a named volume or on the whole listing.
#[derive(Debug)]
pub struct VolumeError {
    pub op: Operation,
    /// Empty when the failure is not tied to one volume
    pub name: String,
    pub kind: ErrorKind,
}

impl fmt::Display for VolumeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            write!(f, "Error {} volumes - {}", self.op, self.kind)
        } else {
            write!(f, "Error {} volume '{}' - {}", self.op, self.name, self.kind)
        }
    }
}

impl std::error::Error for VolumeError {}

impl VolumeError {
    pub fn new(op: Operation, name: impl Into<String>, kind: ErrorKind) -> Self {
        Self { op, name: name.into(), kind }
    }

    /// A listing failure not tied to any single volume.
    pub fn listing(kind: ErrorKind) -> Self {
        Self::new(Operation::List, "", kind)
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }
}

/// Configuration errors raised before a manager exists.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{field} is not specified")]
    Missing { field: &'static str },

    #[error("{field} ({path:?}) must be an absolute path")]
    NotAbsolute { field: &'static str, path: PathBuf },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("Failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
