//! Core metrics definitions.
//!
//! All metrics follow Prometheus naming conventions:
//! - `_total` suffix for counters
//! - gauges report current values

use metrics::{describe_counter, describe_gauge, gauge};

/// Register all core metrics with descriptions.
pub fn register_core_metrics() {
    // Volume lifecycle
    describe_counter!("loopvol_volume_created_total", "Total number of volumes created");
    describe_counter!("loopvol_volume_deleted_total", "Total number of volumes deleted");
    describe_counter!(
        "loopvol_volume_create_failures_total",
        "Total number of failed volume creations (by kind)"
    );
    describe_counter!(
        "loopvol_allocation_fallback_total",
        "Total number of allocations that fell back to zero-fill"
    );

    // Mounts and leases
    describe_counter!("loopvol_mount_total", "Total number of physical mounts");
    describe_counter!("loopvol_unmount_total", "Total number of physical unmounts");
    describe_counter!("loopvol_lease_acquired_total", "Total number of leases acquired");
    describe_counter!("loopvol_lease_released_total", "Total number of leases released");
    describe_gauge!("loopvol_volume_leases", "Current number of leases held (by volume)");
}

pub fn set_lease_count(volume: &str, count: usize) {
    gauge!("loopvol_volume_leases", "volume" => volume.to_string()).set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_exporter_is_noop() {
        register_core_metrics();
        set_lease_count("db", 2);
        set_lease_count("db", 0);
    }
}
