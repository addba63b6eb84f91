//! Lease lock metrics.
//!
//! Counters for acquisition, contention, renewal, and loss. Table and flow
//! crates register their own metrics alongside these.

use metrics::{counter, describe_counter};

// ============================================================================
// Lease Metrics
// ============================================================================

/// Leases acquired.
pub const LEASE_ACQUIRED: &str = "strata_lease_acquired_total";

/// Acquisition attempts that found the lease held.
pub const LEASE_CONTENTION: &str = "strata_lease_contention_total";

/// Successful renewals.
pub const LEASE_RENEWED: &str = "strata_lease_renewed_total";

/// Failed renewals (lease lost).
pub const LEASE_LOST: &str = "strata_lease_lost_total";

// ============================================================================
// Metric Registration
// ============================================================================

/// Registers lease metric descriptions.
///
/// Call once at startup after installing a metrics recorder.
pub fn register_metrics() {
    describe_counter!(LEASE_ACQUIRED, "Total leases acquired");
    describe_counter!(
        LEASE_CONTENTION,
        "Total acquisition attempts that found the lease held"
    );
    describe_counter!(LEASE_RENEWED, "Total successful lease renewals");
    describe_counter!(LEASE_LOST, "Total lease renewals that failed");
}

// ============================================================================
// Recording
// ============================================================================

/// Records a successful acquisition.
pub fn record_lease_acquired(lock: &str) {
    counter!(LEASE_ACQUIRED, "lock" => lock.to_string()).increment(1);
}

/// Records an attempt that found the lease held.
pub fn record_lease_contention(lock: &str) {
    counter!(LEASE_CONTENTION, "lock" => lock.to_string()).increment(1);
}

/// Records a successful renewal.
pub fn record_lease_renewed(lock: &str) {
    counter!(LEASE_RENEWED, "lock" => lock.to_string()).increment(1);
}

/// Records a lost lease.
pub fn record_lease_lost(lock: &str) {
    counter!(LEASE_LOST, "lock" => lock.to_string()).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_noop() {
        register_metrics();
        record_lease_acquired("bronze");
        record_lease_contention("bronze");
        record_lease_renewed("bronze");
        record_lease_lost("bronze");
    }
}
