//! Job execution: lock, work, trigger, release.
//!
//! ```text
//! acquire lease(job) ──held elsewhere──▶ Skipped (exit 0)
//!        │
//!        ▼
//!      work ──error──▶ Failed (exit 1)
//!        │
//!        ▼
//! trigger next jobs ──required & failed──▶ Failed (exit 1)
//!        │
//!        ▼
//!    Completed (exit 0)        lease released on every path
//! ```

use std::future::Future;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use strata_core::config::PipelineConfig;
use strata_core::lock::{LeaseLock, WaitPolicy};
use strata_core::observability::{job_span, truncate_detail};
use tracing::{Instrument, error, info};

use crate::error::Result;
use crate::metrics;
use crate::trigger::{JobTrigger, TriggerReport};

/// Process-level result of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobExit {
    /// The work and any required triggers succeeded.
    Completed,
    /// Another execution holds the job's lock.
    Skipped,
    /// The work, the lock, or a required trigger failed.
    Failed,
}

impl JobExit {
    /// Process exit code.
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::Completed | Self::Skipped => 0,
            Self::Failed => 1,
        }
    }

    /// Stable label for logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }
}

impl From<JobExit> for ExitCode {
    fn from(exit: JobExit) -> Self {
        ExitCode::from(exit.code())
    }
}

/// Identity of one job execution, passed to the work closure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobContext {
    /// Job name; also the lock name.
    pub job: String,
    /// Unique id of this execution.
    pub execution: String,
}

/// Result of [`JobRunner::run`].
#[derive(Debug)]
pub struct JobRun<T> {
    /// Exit classification.
    pub exit: JobExit,
    /// Value returned by the work, if it ran and succeeded.
    pub output: Option<T>,
    /// Downstream trigger outcome, if triggering ran.
    pub triggered: Option<TriggerReport>,
    /// Truncated failure detail.
    pub error: Option<String>,
}

impl<T> JobRun<T> {
    fn skipped() -> Self {
        Self {
            exit: JobExit::Skipped,
            output: None,
            triggered: None,
            error: None,
        }
    }

    fn failed(detail: &str) -> Self {
        Self {
            exit: JobExit::Failed,
            output: None,
            triggered: None,
            error: Some(truncate_detail(detail)),
        }
    }
}

#[derive(Debug, Clone)]
struct NextJobs {
    trigger: JobTrigger,
    jobs: Vec<String>,
    required: bool,
}

/// Runs jobs under their lease lock.
#[derive(Debug, Clone)]
pub struct JobRunner {
    lock: LeaseLock,
    tenant: String,
    lease_duration: Duration,
    wait: WaitPolicy,
    next: Option<NextJobs>,
}

impl JobRunner {
    /// Creates a runner with lease and wait settings from `config`.
    #[must_use]
    pub fn new(lock: LeaseLock, config: &PipelineConfig) -> Self {
        Self {
            lock,
            tenant: config.tenant.as_str().to_string(),
            lease_duration: config.lease_duration,
            wait: config.lock_wait,
            next: None,
        }
    }

    /// Starts `jobs` after each successful run.
    ///
    /// When `required`, a failed start fails the run.
    #[must_use]
    pub fn with_trigger(mut self, trigger: JobTrigger, jobs: Vec<String>, required: bool) -> Self {
        self.next = (!jobs.is_empty()).then_some(NextJobs {
            trigger,
            jobs,
            required,
        });
        self
    }

    /// Runs `work` as job `job`.
    ///
    /// The lease is released on every path once acquired.
    pub async fn run<T, F, Fut>(&self, job: &str, work: F) -> JobRun<T>
    where
        F: FnOnce(JobContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let execution = ulid::Ulid::new().to_string().to_lowercase();
        let span = job_span(job, &execution, &self.tenant);
        let started = Instant::now();
        let run = self
            .run_locked(
                JobContext {
                    job: job.to_string(),
                    execution,
                },
                work,
            )
            .instrument(span)
            .await;
        metrics::record_job_run(job, run.exit.as_str(), started.elapsed());
        run
    }

    async fn run_locked<T, F, Fut>(&self, ctx: JobContext, work: F) -> JobRun<T>
    where
        F: FnOnce(JobContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let job = ctx.job.clone();
        let lock = self
            .lock
            .clone()
            .with_holder(format!("{}/{}", ctx.job, ctx.execution));
        let handle = match lock.acquire(&job, self.lease_duration, self.wait).await {
            Ok(handle) => handle,
            Err(e) if e.is_contention() => {
                info!(job = %job, reason = %e, "job already running elsewhere; skipping");
                return JobRun::skipped();
            }
            Err(e) => {
                error!(
                    job = %job,
                    resource = %job,
                    error = %truncate_detail(&e.to_string()),
                    "lock acquisition failed"
                );
                return JobRun::failed(&e.to_string());
            }
        };

        let mut run = match work(ctx).await {
            Ok(output) => JobRun {
                exit: JobExit::Completed,
                output: Some(output),
                triggered: None,
                error: None,
            },
            Err(e) => {
                error!(
                    job = %job,
                    resource = %job,
                    error = %truncate_detail(&e.to_string()),
                    "job failed"
                );
                JobRun::failed(&e.to_string())
            }
        };

        if let Err(e) = handle.ensure_held() {
            error!(
                job = %job,
                resource = %handle.resource_id(),
                error = %e,
                "lease lost during job"
            );
            run = JobRun::failed(&e.to_string());
        }

        if run.exit == JobExit::Completed {
            if let Some(next) = &self.next {
                match next.trigger.trigger_next(&next.jobs, next.required).await {
                    Ok(report) => run.triggered = Some(report),
                    Err(e) => {
                        error!(
                            job = %job,
                            resource = %job,
                            error = %e,
                            "required downstream trigger failed"
                        );
                        run.exit = JobExit::Failed;
                        run.error = Some(truncate_detail(&e.to_string()));
                    }
                }
            }
        }

        handle.release().await;
        info!(job = %job, exit = run.exit.as_str(), "job finished");
        run
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes() {
        assert_eq!(JobExit::Completed.code(), 0);
        assert_eq!(JobExit::Skipped.code(), 0);
        assert_eq!(JobExit::Failed.code(), 1);
        assert_eq!(JobExit::Skipped.as_str(), "skipped");
    }
}
