//! Table, materializer, and reconciler metrics.

use metrics::{counter, describe_counter};

// ============================================================================
// Table Metrics
// ============================================================================

/// Commits written, by operation.
pub const TABLE_COMMITS: &str = "strata_table_commits_total";

/// Rows written across all commits.
pub const TABLE_ROWS_WRITTEN: &str = "strata_table_rows_written_total";

// ============================================================================
// Materializer Metrics
// ============================================================================

/// Rows written by the by-date materializer.
pub const MATERIALIZE_ROWS: &str = "strata_materialize_rows_total";

/// Per-entity source tables skipped after a load failure.
pub const MATERIALIZE_TABLES_FAILED: &str = "strata_materialize_tables_failed_total";

// ============================================================================
// Reconciler Metrics
// ============================================================================

/// Orphaned downstream entities purged.
pub const ORPHANS_PURGED: &str = "strata_reconcile_orphans_purged_total";

/// Objects deleted by orphan purges.
pub const BLOBS_DELETED: &str = "strata_reconcile_blobs_deleted_total";

/// Rows dropped by retroactive cutoff enforcement.
pub const CUTOFF_ROWS_DROPPED: &str = "strata_cutoff_rows_dropped_total";

/// Registers metric descriptions.
pub fn register_metrics() {
    describe_counter!(TABLE_COMMITS, "Total table commits by operation");
    describe_counter!(TABLE_ROWS_WRITTEN, "Total rows written to tables");
    describe_counter!(MATERIALIZE_ROWS, "Total rows written by the by-date materializer");
    describe_counter!(
        MATERIALIZE_TABLES_FAILED,
        "Total source tables skipped after a load failure"
    );
    describe_counter!(ORPHANS_PURGED, "Total orphaned downstream entities purged");
    describe_counter!(BLOBS_DELETED, "Total objects deleted by orphan purges");
    describe_counter!(CUTOFF_ROWS_DROPPED, "Total rows dropped by cutoff enforcement");
}

pub(crate) fn record_commit(operation: &'static str, rows: u64) {
    counter!(TABLE_COMMITS, "operation" => operation).increment(1);
    counter!(TABLE_ROWS_WRITTEN).increment(rows);
}

pub(crate) fn record_materialized(target: &str, rows: u64, tables_failed: usize) {
    counter!(MATERIALIZE_ROWS, "target" => target.to_string()).increment(rows);
    counter!(MATERIALIZE_TABLES_FAILED, "target" => target.to_string())
        .increment(tables_failed as u64);
}

pub(crate) fn record_purge(downstream: &str, orphans: usize, blobs: usize) {
    counter!(ORPHANS_PURGED, "downstream" => downstream.to_string()).increment(orphans as u64);
    counter!(BLOBS_DELETED, "downstream" => downstream.to_string()).increment(blobs as u64);
}

pub(crate) fn record_cutoff(downstream: &str, rows: usize) {
    counter!(CUTOFF_ROWS_DROPPED, "downstream" => downstream.to_string()).increment(rows as u64);
}
