//! Downstream job trigger.
//!
//! After a successful run, each configured downstream job is started with
//! `POST {control_plane}/jobs/{name}/start`. A 409 means the job is already
//! starting or running and counts as success.

use std::time::Duration;

use strata_core::config::TriggerSettings;
use strata_core::observability::truncate_detail;
use tracing::{info, warn};

use crate::backoff;
use crate::error::TriggerError;
use crate::metrics;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_DELAY: Duration = Duration::from_secs(30);

/// Statuses retried with backoff.
const RETRYABLE_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Result of one start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// 2xx.
    Started,
    /// 409.
    AlreadyRunning,
}

/// Outcome of triggering a list of jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerReport {
    /// Jobs accepted with 2xx.
    pub started: Vec<String>,
    /// Jobs that answered 409.
    pub already_running: Vec<String>,
    /// Jobs that could not be started, with the failure detail.
    pub failed: Vec<(String, String)>,
}

impl TriggerReport {
    /// Returns true if every job was started or already running.
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Starts jobs through the control plane.
#[derive(Debug, Clone)]
pub struct JobTrigger {
    http: reqwest::Client,
    control_plane_url: String,
    max_attempts: u32,
    base_delay: Duration,
}

impl JobTrigger {
    /// Creates a trigger for `control_plane_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        control_plane_url: impl Into<String>,
        max_attempts: u32,
        base_delay: Duration,
    ) -> Result<Self, TriggerError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| TriggerError::Client(e.to_string()))?;
        Ok(Self {
            http,
            control_plane_url: control_plane_url.into().trim_end_matches('/').to_string(),
            max_attempts: max_attempts.max(1),
            base_delay,
        })
    }

    /// Creates a trigger from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`TriggerError::NotConfigured`] if no control-plane URL is set.
    pub fn from_settings(settings: &TriggerSettings) -> Result<Self, TriggerError> {
        let url = settings
            .control_plane_url
            .as_deref()
            .ok_or(TriggerError::NotConfigured)?;
        Self::new(url, settings.max_attempts, settings.base_delay)
    }

    /// Resource URL of a job.
    #[must_use]
    pub fn resource_url(&self, job: &str) -> String {
        format!("{}/jobs/{job}", self.control_plane_url)
    }

    /// Starts one job, retrying transient failures.
    ///
    /// # Errors
    ///
    /// Returns [`TriggerError::StartFailed`] on a non-retryable status or
    /// once every attempt has failed.
    pub async fn start(&self, job: &str) -> Result<StartOutcome, TriggerError> {
        let endpoint = format!("{}/start", self.resource_url(job));
        let mut attempt = 0;
        loop {
            attempt += 1;
            let (status, detail) = match self
                .http
                .post(&endpoint)
                .timeout(REQUEST_TIMEOUT)
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => {
                    metrics::record_trigger_attempt(job, "started");
                    return Ok(StartOutcome::Started);
                }
                Ok(resp) if resp.status().as_u16() == 409 => {
                    metrics::record_trigger_attempt(job, "already_running");
                    return Ok(StartOutcome::AlreadyRunning);
                }
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let body = resp.text().await.unwrap_or_default();
                    (Some(status), format!("status {status}: {}", body.trim()))
                }
                Err(e) => (None, e.to_string()),
            };

            let retryable = status.is_none_or(|s| RETRYABLE_STATUSES.contains(&s));
            if !retryable || attempt >= self.max_attempts {
                metrics::record_trigger_attempt(job, "failed");
                return Err(TriggerError::StartFailed {
                    job: job.to_string(),
                    attempts: attempt,
                    status,
                    detail: truncate_detail(&detail),
                });
            }

            metrics::record_trigger_attempt(job, "retry");
            let delay =
                backoff::with_jitter(backoff::exponential(self.base_delay, attempt, MAX_DELAY));
            warn!(
                job,
                attempt,
                max_attempts = self.max_attempts,
                status,
                error = %truncate_detail(&detail),
                "job start failed; retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Starts every job in `jobs`.
    ///
    /// Every job is attempted even after a failure.
    ///
    /// # Errors
    ///
    /// If `required`, returns the first start failure. Otherwise failures are
    /// logged and reported in the returned [`TriggerReport`].
    pub async fn trigger_next(
        &self,
        jobs: &[String],
        required: bool,
    ) -> Result<TriggerReport, TriggerError> {
        let mut report = TriggerReport::default();
        let mut first_error = None;
        for job in jobs {
            match self.start(job).await {
                Ok(StartOutcome::Started) => {
                    info!(job = %job, "downstream job started");
                    report.started.push(job.clone());
                }
                Ok(StartOutcome::AlreadyRunning) => {
                    info!(job = %job, "downstream job already running");
                    report.already_running.push(job.clone());
                }
                Err(e) => {
                    warn!(job = %job, required, error = %e, "downstream job not started");
                    report.failed.push((job.clone(), e.to_string()));
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) if required => Err(e),
            _ => Ok(report),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_url_trims_trailing_slash() {
        let trigger = JobTrigger::new("http://cp.local/", 3, Duration::from_millis(1)).unwrap();
        assert_eq!(trigger.resource_url("silver"), "http://cp.local/jobs/silver");
    }

    #[test]
    fn missing_control_plane_is_not_configured() {
        let err = JobTrigger::from_settings(&TriggerSettings::default()).unwrap_err();
        assert!(matches!(err, TriggerError::NotConfigured));
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        let trigger = JobTrigger::new("http://cp.local", 0, Duration::from_millis(1)).unwrap();
        assert_eq!(trigger.max_attempts, 1);
    }
}
