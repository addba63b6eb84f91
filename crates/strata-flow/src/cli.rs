//! `strata-job` command line.
//!
//! ## Commands
//!
//! - `strata-job materialize` - rebuild by-date partitions from per-entity tables
//! - `strata-job reconcile` - purge orphans and re-apply the backfill cutoff
//! - `strata-job lock-status` - show who holds a job lock
//! - `strata-job trigger` - start downstream jobs through the control plane
//!
//! Everything not given on the command line comes from
//! [`PipelineConfig::from_env`](strata_core::PipelineConfig::from_env).

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use strata_core::lease::{LeaseStore, ObjectLeaseStore};
use strata_core::lock::{LeaseLock, LockOptions};
use strata_core::observability::LogFormat;
use strata_core::partition::{PartitionScope, YearMonth};
use strata_core::{ObjectStoreBackend, PipelineConfig, ScopedStorage, StorageBackend};
use strata_table::{MaterializeRequest, Materializer, Reconciler, entity_table_root};

use crate::error::FlowError;
use crate::runner::{JobExit, JobRunner};
use crate::trigger::JobTrigger;

/// Job runner for the strata pipeline.
#[derive(Debug, Parser)]
#[command(name = "strata-job")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log output format (`json` or `pretty`).
    #[arg(long, env = "STRATA_LOG_FORMAT", default_value = "json", global = true)]
    pub log_format: LogFormat,

    /// Storage location (`file:///data`, `s3://bucket/prefix`, `memory://`).
    #[arg(long, env = "STRATA_STORAGE_URL", global = true)]
    pub storage_url: Option<String>,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Rebuild by-date partitions from per-entity tables.
    Materialize(MaterializeArgs),
    /// Purge orphaned downstream entities and re-apply the backfill cutoff.
    Reconcile(ReconcileArgs),
    /// Show the current holder of a job lock.
    LockStatus(LockStatusArgs),
    /// Start downstream jobs.
    Trigger(TriggerArgs),
}

/// Arguments for `materialize`.
#[derive(Debug, Args)]
pub struct MaterializeArgs {
    /// Root holding one table per entity (repeatable).
    #[arg(long = "source-root", required = true)]
    pub source_roots: Vec<String>,

    /// Root of the by-date table.
    #[arg(long)]
    pub target_root: String,

    /// Month to rebuild, `YYYY-MM` (repeatable). Defaults to the trailing
    /// window ending this month.
    #[arg(long = "month", conflicts_with = "all")]
    pub months: Vec<YearMonth>,

    /// Rebuild every month.
    #[arg(long)]
    pub all: bool,

    /// Entity column name.
    #[arg(long, default_value = strata_table::materializer::DEFAULT_ENTITY_COLUMN)]
    pub entity_column: String,

    /// Date column name.
    #[arg(long, default_value = strata_table::materializer::DEFAULT_DATE_COLUMN)]
    pub date_column: String,

    /// Entities to read when discovery finds none (comma-separated).
    #[arg(long, value_delimiter = ',')]
    pub fallback_universe: Vec<String>,

    /// Job (and lock) name.
    #[arg(long, default_value = "materialize_by_date")]
    pub job_name: String,
}

impl MaterializeArgs {
    fn scope(&self, window_months: u32) -> PartitionScope {
        if self.all {
            PartitionScope::All
        } else if self.months.is_empty() {
            PartitionScope::trailing(chrono::Utc::now().date_naive(), window_months)
        } else {
            PartitionScope::Months(self.months.iter().copied().collect::<BTreeSet<_>>())
        }
    }
}

/// Arguments for `reconcile`.
#[derive(Debug, Args)]
pub struct ReconcileArgs {
    /// Root holding the upstream per-entity tables.
    #[arg(long)]
    pub upstream_root: String,

    /// Root holding the downstream per-entity tables.
    #[arg(long)]
    pub downstream_root: String,

    /// Date column the cutoff is applied to.
    #[arg(long, default_value = strata_table::materializer::DEFAULT_DATE_COLUMN)]
    pub date_column: String,

    /// Report without deleting or rewriting.
    #[arg(long)]
    pub dry_run: bool,

    /// Purge every downstream entity even when upstream is empty.
    #[arg(long)]
    pub allow_empty_upstream: bool,

    /// Job (and lock) name.
    #[arg(long, default_value = "reconcile")]
    pub job_name: String,
}

/// Arguments for `lock-status`.
#[derive(Debug, Args)]
pub struct LockStatusArgs {
    /// Lock (job) name.
    #[arg(long)]
    pub lock_name: String,
}

/// Arguments for `trigger`.
#[derive(Debug, Args)]
pub struct TriggerArgs {
    /// Jobs to start (comma-separated). Defaults to `STRATA_TRIGGER_NEXT_JOBS`.
    #[arg(long, value_delimiter = ',')]
    pub jobs: Vec<String>,

    /// Fail when a job cannot be started. Defaults to `STRATA_TRIGGER_REQUIRED`.
    #[arg(long)]
    pub required: Option<bool>,
}

/// Storage, lock, and configuration shared by every command.
#[derive(Clone)]
pub struct Runtime {
    /// Process configuration.
    pub config: PipelineConfig,
    /// Tenant-scoped storage.
    pub storage: Arc<dyn StorageBackend>,
    /// Job lock over `storage`.
    pub lock: LeaseLock,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("lock", &self.lock)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Opens tenant-scoped storage and the lease lock.
    ///
    /// # Errors
    ///
    /// Returns an error if no storage URL is configured or it cannot be opened.
    pub fn open(config: PipelineConfig, storage_url: Option<&str>) -> Result<Self> {
        let url = storage_url
            .or(config.storage_url.as_deref())
            .context("storage URL is required. Set STRATA_STORAGE_URL or use --storage-url")?;
        let backend: Arc<dyn StorageBackend> = Arc::new(
            ObjectStoreBackend::from_url(url)
                .with_context(|| format!("failed to open storage at {url}"))?,
        );
        Ok(Self::with_storage(config, backend))
    }

    /// Wraps an existing backend.
    #[must_use]
    pub fn with_storage(config: PipelineConfig, backend: Arc<dyn StorageBackend>) -> Self {
        let storage: Arc<dyn StorageBackend> =
            Arc::new(ScopedStorage::new(backend, config.tenant.clone()));
        let leases: Arc<dyn LeaseStore> = Arc::new(ObjectLeaseStore::new(Arc::clone(&storage)));
        let lock = LeaseLock::new(leases).with_options(LockOptions {
            poll_interval: config.lock_poll_interval,
            ..LockOptions::default()
        });
        Self {
            config,
            storage,
            lock,
        }
    }

    /// Job runner with the configured downstream trigger.
    ///
    /// # Errors
    ///
    /// Returns an error if the trigger client cannot be built.
    pub fn job_runner(&self) -> Result<JobRunner> {
        let runner = JobRunner::new(self.lock.clone(), &self.config);
        let trigger = &self.config.trigger;
        if trigger.control_plane_url.is_none() || trigger.next_jobs.is_empty() {
            return Ok(runner);
        }
        let client = JobTrigger::from_settings(trigger)?;
        Ok(runner.with_trigger(client, trigger.next_jobs.clone(), trigger.required))
    }
}

/// Executes `command`.
///
/// # Errors
///
/// Returns an error for setup failures. Job failures are reported through
/// the returned [`JobExit`].
pub async fn execute(command: Commands, runtime: &Runtime) -> Result<JobExit> {
    match command {
        Commands::Materialize(args) => materialize(args, runtime).await,
        Commands::Reconcile(args) => reconcile(args, runtime).await,
        Commands::LockStatus(args) => lock_status(&args, runtime).await,
        Commands::Trigger(args) => trigger(args, runtime).await,
    }
}

async fn materialize(args: MaterializeArgs, runtime: &Runtime) -> Result<JobExit> {
    let scope = args.scope(runtime.config.materialize_window_months);
    let request = MaterializeRequest::new(args.source_roots, args.target_root, scope)
        .with_entity_column(args.entity_column)
        .with_date_column(args.date_column)
        .with_fallback_universe(args.fallback_universe);
    let materializer = Materializer::new(
        Arc::clone(&runtime.storage),
        runtime.config.backfill.window(),
    );

    let (materializer, request) = (&materializer, &request);
    let run = runtime
        .job_runner()?
        .run(&args.job_name, move |_ctx| async move {
            Ok::<_, FlowError>(materializer.materialize(request).await?)
        })
        .await;
    if let Some(report) = &run.output {
        println!(
            "materialized {} rows into {} partition(s) from {}/{} tables ({} failed)",
            report.rows_written,
            report.partitions.len(),
            report.tables_loaded,
            report.tables_scanned,
            report.tables_failed,
        );
    }
    Ok(run.exit)
}

async fn reconcile(args: ReconcileArgs, runtime: &Runtime) -> Result<JobExit> {
    let reconciler = Reconciler::new(
        Arc::clone(&runtime.storage),
        runtime.config.backfill.window(),
    )
    .with_dry_run(args.dry_run)
    .allow_empty_upstream(args.allow_empty_upstream);
    let reconciler = &reconciler;
    let (upstream, downstream, date_column) =
        (&args.upstream_root, &args.downstream_root, &args.date_column);

    let run = runtime
        .job_runner()?
        .run(&args.job_name, move |_ctx| async move {
            let report = reconciler
                .sweep(
                    upstream,
                    downstream,
                    |entity| entity_table_root(downstream, entity),
                    date_column,
                )
                .await?;
            Ok::<_, FlowError>(report)
        })
        .await;
    if let Some(report) = &run.output {
        let prefix = if report.reconcile.dry_run { "[dry run] " } else { "" };
        println!(
            "{prefix}purged {} orphan(s) ({} objects); cutoff dropped {} rows, deleted {} table(s)",
            report.reconcile.orphans_purged.len(),
            report.reconcile.blobs_deleted,
            report.cutoff.rows_dropped,
            report.cutoff.tables_deleted,
        );
        if report.reconcile.refused_empty_upstream {
            println!("upstream {} is empty; orphan purge refused", args.upstream_root);
        }
    }
    Ok(run.exit)
}

async fn lock_status(args: &LockStatusArgs, runtime: &Runtime) -> Result<JobExit> {
    let record = runtime
        .lock
        .inspect(&args.lock_name)
        .await
        .with_context(|| format!("failed to read lock {}", args.lock_name))?;
    match record {
        Some(record) if record.is_live() => println!(
            "{}: held by {} until {}",
            args.lock_name,
            record.holder.as_deref().unwrap_or("unknown"),
            record.expires_at.to_rfc3339(),
        ),
        Some(_) => println!("{}: free", args.lock_name),
        None => println!("{}: never acquired", args.lock_name),
    }
    Ok(JobExit::Completed)
}

async fn trigger(args: TriggerArgs, runtime: &Runtime) -> Result<JobExit> {
    let settings = &runtime.config.trigger;
    let jobs = if args.jobs.is_empty() {
        settings.next_jobs.clone()
    } else {
        args.jobs
    };
    let required = args.required.unwrap_or(settings.required);
    if jobs.is_empty() {
        println!("no jobs to trigger");
        return Ok(JobExit::Completed);
    }

    let client = JobTrigger::from_settings(settings)?;
    match client.trigger_next(&jobs, required).await {
        Ok(report) => {
            println!(
                "started: [{}]; already running: [{}]; failed: {}",
                report.started.join(", "),
                report.already_running.join(", "),
                report.failed.len(),
            );
            Ok(JobExit::Completed)
        }
        Err(e) => {
            tracing::error!(error = %e, "trigger failed");
            Ok(JobExit::Failed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn months_parse_into_a_scope() {
        let cli = Cli::parse_from([
            "strata-job",
            "materialize",
            "--source-root",
            "silver/prices",
            "--target-root",
            "gold/prices_by_date",
            "--month",
            "2025-01",
            "--month",
            "2024-12",
        ]);
        let Commands::Materialize(args) = cli.command else {
            panic!("expected materialize");
        };
        let scope = args.scope(1);
        let months = scope.months().unwrap();
        assert_eq!(months.len(), 2);
        assert!(scope.includes("2024-12".parse().unwrap()));
    }

    #[test]
    fn all_conflicts_with_month() {
        let result = Cli::try_parse_from([
            "strata-job",
            "materialize",
            "--source-root",
            "a",
            "--target-root",
            "b",
            "--all",
            "--month",
            "2025-01",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn trigger_jobs_are_comma_separated() {
        let cli = Cli::parse_from([
            "strata-job",
            "trigger",
            "--jobs",
            "silver,gold",
            "--required",
            "false",
        ]);
        let Commands::Trigger(args) = cli.command else {
            panic!("expected trigger");
        };
        assert_eq!(args.jobs, vec!["silver", "gold"]);
        assert_eq!(args.required, Some(false));
    }

    #[tokio::test]
    async fn lock_status_reads_through_scoped_storage() {
        let runtime = Runtime::with_storage(
            PipelineConfig::from_lookup(|_| None),
            Arc::new(strata_core::MemoryBackend::new()),
        );
        let exit = lock_status(
            &LockStatusArgs {
                lock_name: "bronze".to_string(),
            },
            &runtime,
        )
        .await
        .unwrap();
        assert_eq!(exit, JobExit::Completed);
    }
}
