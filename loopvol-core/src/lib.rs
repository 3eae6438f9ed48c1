//! loopvol core library
//!
//! Loopback-file-backed volumes for container runtimes: backing files are
//! allocated and formatted on create, loop-mounted on first use, and
//! unmounted when the last consumer lets go.

pub mod allocation;
pub mod config;
pub mod driver;
pub mod error;
pub mod host;
pub mod lease;
pub mod lock;
pub mod manager;
pub mod name;
pub mod observability;
pub mod resolver;
pub mod types;
pub mod units;

// Re-export commonly used items
pub use config::Config;
pub use driver::{DriverError, VolumeDriver};
pub use error::{ConfigError, ErrorKind, Operation, Result, VolumeError};
pub use host::{CommandOutput, CommandRunner, SystemCommandRunner};
pub use manager::{CreateOptions, VolumeManager};
pub use observability::init as init_observability;
pub use types::{Filesystem, Volume};
