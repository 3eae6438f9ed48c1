//! Core domain types for loopvol.

pub mod volume;

// Re-exports
pub use volume::{Filesystem, Volume};
