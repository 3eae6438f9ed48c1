//! Backing file allocation.
//!
//! Sparse files are sized with `truncate`. Fully allocated files try
//! `fallocate` first and fall back to a zero-filling `dd` when the data
//! directory's filesystem does not support it.

use crate::error::ErrorKind;
use crate::host::{run_checked, CommandRunner};
use std::path::Path;
use tracing::{debug, info, instrument, warn};

/// Block size used by the zero-fill fallback.
pub const ZERO_FILL_BLOCK_SIZE: u64 = 1_000_000;

/// Marker the allocation utilities print when the device is full.
const NO_SPACE_MARKER: &str = "No space";

/// How a backing file ended up allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationMethod {
    /// Logical length only, blocks left as holes
    Sparse,
    /// Blocks reserved with `fallocate`
    Fast,
    /// Blocks written with zeroes via `dd`
    ZeroFill,
}

impl AllocationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationMethod::Sparse => "sparse",
            AllocationMethod::Fast => "fast",
            AllocationMethod::ZeroFill => "zero-fill",
        }
    }
}

/// Materialize a backing file of `size_bytes` at `path`.
///
/// On any failure the partial file is removed before returning.
#[instrument(skip(runner), fields(path = %path.display()))]
pub async fn allocate(
    runner: &dyn CommandRunner,
    path: &Path,
    size_bytes: u64,
    sparse: bool,
) -> Result<AllocationMethod, ErrorKind> {
    let path_arg = path.to_string_lossy().to_string();

    if sparse {
        let args = vec!["-s".to_string(), size_bytes.to_string(), path_arg];
        if let Err(reason) = run_checked(runner, "truncate", &args).await {
            remove_partial(path).await;
            return Err(ErrorKind::AllocationFailed {
                reason: format!("error creating sparse data file: {}", reason),
            });
        }
        debug!("Created sparse data file of {} bytes", size_bytes);
        return Ok(AllocationMethod::Sparse);
    }

    let args = vec!["-l".to_string(), size_bytes.to_string(), path_arg.clone()];
    let reason = match run_checked(runner, "fallocate", &args).await {
        Ok(()) => {
            debug!("Allocated {} bytes with fallocate", size_bytes);
            return Ok(AllocationMethod::Fast);
        }
        Err(reason) => reason,
    };

    // More space will not appear by switching utilities.
    if reason.contains(NO_SPACE_MARKER) {
        remove_partial(path).await;
        return Err(ErrorKind::InsufficientSpace { reason });
    }

    info!("fallocate unavailable ({}), falling back to zero-fill", reason);
    metrics::counter!("loopvol_allocation_fallback_total").increment(1);

    // Whole blocks only; the remainder below one block is dropped.
    let count = size_bytes / ZERO_FILL_BLOCK_SIZE;
    let args = vec![
        "if=/dev/zero".to_string(),
        format!("of={}", path_arg),
        format!("bs={}", ZERO_FILL_BLOCK_SIZE),
        format!("count={}", count),
    ];
    if let Err(reason) = run_checked(runner, "dd", &args).await {
        remove_partial(path).await;
        return Err(if reason.contains(NO_SPACE_MARKER) {
            ErrorKind::InsufficientSpace { reason }
        } else {
            ErrorKind::AllocationFailed { reason }
        });
    }

    debug!("Zero-filled {} blocks of {} bytes", count, ZERO_FILL_BLOCK_SIZE);
    Ok(AllocationMethod::ZeroFill)
}

/// Best-effort removal of a partially created file.
pub(crate) async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed partial file {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to clean up {}: {}", path.display(), e),
    }
}
