//! Gateway, trigger, ingestion, and job metrics.

use std::time::Duration;

use metrics::{counter, describe_counter, describe_histogram, histogram};

// ============================================================================
// Gateway Metrics
// ============================================================================

/// Gateway requests, by outcome.
pub const GATEWAY_REQUESTS: &str = "strata_gateway_requests_total";

/// Warm-up probes, by outcome.
pub const GATEWAY_PROBES: &str = "strata_gateway_probes_total";

// ============================================================================
// Trigger Metrics
// ============================================================================

/// Control-plane start attempts, by outcome.
pub const TRIGGER_ATTEMPTS: &str = "strata_trigger_attempts_total";

// ============================================================================
// Ingestion Metrics
// ============================================================================

/// Per-entity ingestion outcomes.
pub const INGEST_OUTCOMES: &str = "strata_ingest_outcomes_total";

// ============================================================================
// Job Metrics
// ============================================================================

/// Job runs, by exit.
pub const JOB_RUNS: &str = "strata_job_runs_total";

/// Job run duration in seconds.
pub const JOB_DURATION: &str = "strata_job_duration_seconds";

// ============================================================================
// Metric Registration
// ============================================================================

/// Registers flow metric descriptions.
pub fn register_metrics() {
    describe_counter!(GATEWAY_REQUESTS, "Total gateway requests by outcome");
    describe_counter!(GATEWAY_PROBES, "Total gateway warm-up probes by outcome");
    describe_counter!(TRIGGER_ATTEMPTS, "Total control-plane start attempts by outcome");
    describe_counter!(INGEST_OUTCOMES, "Total per-entity ingestion outcomes");
    describe_counter!(JOB_RUNS, "Total job runs by exit");
    describe_histogram!(JOB_DURATION, "Job run duration in seconds");
}

pub(crate) fn record_gateway_request(outcome: &'static str) {
    counter!(GATEWAY_REQUESTS, "outcome" => outcome).increment(1);
}

pub(crate) fn record_probe(outcome: &'static str) {
    counter!(GATEWAY_PROBES, "outcome" => outcome).increment(1);
}

pub(crate) fn record_trigger_attempt(job: &str, outcome: &'static str) {
    counter!(TRIGGER_ATTEMPTS, "job" => job.to_string(), "outcome" => outcome).increment(1);
}

pub(crate) fn record_ingest_outcome(collection: &str, outcome: &'static str) {
    counter!(INGEST_OUTCOMES, "collection" => collection.to_string(), "outcome" => outcome)
        .increment(1);
}

pub(crate) fn record_job_run(job: &str, exit: &'static str, elapsed: Duration) {
    counter!(JOB_RUNS, "job" => job.to_string(), "exit" => exit).increment(1);
    histogram!(JOB_DURATION, "job" => job.to_string()).record(elapsed.as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_noop() {
        register_metrics();
        record_gateway_request("ok");
        record_probe("ok");
        record_trigger_attempt("silver", "started");
        record_ingest_outcome("bronze", "wrote");
        record_job_run("bronze", "completed", Duration::from_secs(1));
    }
}
