//! Bounded, incremental ingestion.
//!
//! [`IngestionRunner`] decides per source object whether work is needed,
//! fans the work out to a fixed-size pool, and folds the outcomes back into
//! the run's state documents:
//!
//! - signatures are recorded only for objects that were written
//! - entities the provider reported as permanently absent are blacklisted
//! - watermarks and blacklist are persisted once, at the end
//! - the run checkpoint advances only when no entity failed

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use strata_core::config::PipelineConfig;
use strata_core::observability::truncate_detail;
use strata_core::storage::StorageBackend;
use strata_state::{
    BlacklistStore, ChangeTracker, CheckpointStore, RunCheckpoint, Signature, WatermarkStore,
};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{GatewayError, Result};
use crate::metrics;

/// Default worker pool size.
pub const DEFAULT_POOL_SIZE: usize = 8;

const PROGRESS_LOG_EVERY: usize = 50;

/// One source object to consider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceItem {
    /// Watermark key, usually the object path.
    pub key: String,
    /// Entity the object belongs to.
    pub entity: String,
    /// Signature observed at listing time.
    pub signature: Signature,
}

impl SourceItem {
    /// Creates an item.
    pub fn new(key: impl Into<String>, entity: impl Into<String>, signature: Signature) -> Self {
        Self {
            key: key.into(),
            entity: entity.into(),
            signature,
        }
    }
}

/// Result of processing one source object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Output was written; the signature is recorded.
    Wrote,
    /// Nothing to write; the signature is not recorded.
    Skipped,
    /// The provider reported the entity as permanently absent.
    Blacklisted(String),
    /// Processing failed; the checkpoint will not advance.
    Failed(String),
}

impl Outcome {
    /// Maps a gateway failure to an outcome: a permanent absence blacklists
    /// the entity, anything else fails it.
    #[must_use]
    pub fn from_gateway_error(error: &GatewayError) -> Self {
        if error.is_permanent_absence() {
            Self::Blacklisted(error.detail.clone())
        } else {
            Self::Failed(error.to_string())
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Wrote => "wrote",
            Self::Skipped => "skipped",
            Self::Blacklisted(_) => "blacklisted",
            Self::Failed(_) => "failed",
        }
    }
}

/// Per-entity work.
#[async_trait]
pub trait SourceProcessor: Send + Sync + 'static {
    /// Processes one source object.
    async fn process(&self, item: &SourceItem) -> Outcome;
}

/// Summary of an ingestion run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    /// Items considered.
    pub total: usize,
    /// Items skipped because their signature was unchanged.
    pub unchanged: usize,
    /// Items skipped because their entity was already blacklisted.
    pub already_blacklisted: usize,
    /// Items the processor wrote.
    pub wrote: usize,
    /// Items the processor skipped.
    pub skipped: usize,
    /// Entities newly blacklisted.
    pub blacklisted: Vec<String>,
    /// Failed items, with the reason.
    pub failures: Vec<(String, String)>,
    /// Whether the watermark document was written.
    pub watermarks_persisted: bool,
    /// Whether the run checkpoint advanced.
    pub checkpoint_advanced: bool,
}

impl IngestReport {
    /// Returns true if no item failed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Default)]
struct Progress {
    completed: usize,
    failed: usize,
}

/// Runs a [`SourceProcessor`] over changed source objects.
#[derive(Clone)]
pub struct IngestionRunner {
    storage: Arc<dyn StorageBackend>,
    collection: String,
    job: String,
    pool_size: usize,
    force: bool,
}

impl std::fmt::Debug for IngestionRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionRunner")
            .field("collection", &self.collection)
            .field("job", &self.job)
            .field("pool_size", &self.pool_size)
            .field("force", &self.force)
            .finish_non_exhaustive()
    }
}

impl IngestionRunner {
    /// Creates a runner for `collection`, checkpointed under `job`.
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        collection: impl Into<String>,
        job: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            collection: collection.into(),
            job: job.into(),
            pool_size: DEFAULT_POOL_SIZE,
            force: false,
        }
    }

    /// Applies pool size and force flag from configuration.
    #[must_use]
    pub fn configured(self, config: &PipelineConfig) -> Self {
        self.with_pool_size(config.worker_pool_size)
            .with_force(config.force_reprocess)
    }

    /// Sets the number of concurrent workers (at least 1).
    #[must_use]
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size.max(1);
        self
    }

    /// Processes every item regardless of signatures.
    #[must_use]
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Runs `processor` over the items that need work.
    ///
    /// Per-item failures are counted, not returned.
    ///
    /// # Errors
    ///
    /// Returns an error if a state document cannot be read or written.
    pub async fn run<P: SourceProcessor>(
        &self,
        processor: Arc<P>,
        items: Vec<SourceItem>,
    ) -> Result<IngestReport> {
        let run_started: DateTime<Utc> = Utc::now();
        let watermark_store = WatermarkStore::new(Arc::clone(&self.storage));
        let blacklist_store = BlacklistStore::new(Arc::clone(&self.storage));
        let checkpoints = CheckpointStore::new(Arc::clone(&self.storage));

        let mut watermarks = watermark_store.load(&self.collection).await?;
        let mut blacklist = blacklist_store.load(&self.collection).await?;
        let tracker = ChangeTracker::new(checkpoints.last_success(&self.job).await?, self.force);

        let mut report = IngestReport {
            total: items.len(),
            ..IngestReport::default()
        };

        let mut pending = Vec::new();
        for item in items {
            if blacklist.contains(&item.entity) {
                report.already_blacklisted += 1;
                continue;
            }
            let decision = tracker.should_process(&item.signature, watermarks.get(&item.key));
            if decision.requires_processing() {
                debug!(key = %item.key, decision = decision.as_str(), "queued");
                pending.push(item);
            } else {
                report.unchanged += 1;
            }
        }

        let queued = pending.len();
        let semaphore = Arc::new(Semaphore::new(self.pool_size));
        let progress = Arc::new(Mutex::new(Progress::default()));
        let mut workers = JoinSet::new();
        for item in pending {
            let semaphore = Arc::clone(&semaphore);
            let progress = Arc::clone(&progress);
            let processor = Arc::clone(&processor);
            let collection = self.collection.clone();
            workers.spawn(async move {
                let outcome = match semaphore.acquire_owned().await {
                    Ok(_permit) => processor.process(&item).await,
                    Err(e) => Outcome::Failed(format!("worker pool closed: {e}")),
                };
                let mut progress = progress.lock().await;
                progress.completed += 1;
                if matches!(outcome, Outcome::Failed(_)) {
                    progress.failed += 1;
                }
                if progress.completed % PROGRESS_LOG_EVERY == 0 || progress.completed == queued {
                    info!(
                        collection = %collection,
                        completed = progress.completed,
                        queued,
                        failed = progress.failed,
                        "ingestion progress"
                    );
                }
                (item, outcome)
            });
        }

        while let Some(joined) = workers.join_next().await {
            let (item, outcome) = match joined {
                Ok(done) => done,
                Err(e) => {
                    warn!(collection = %self.collection, error = %e, "ingestion worker aborted");
                    report
                        .failures
                        .push(("<unknown>".to_string(), format!("worker aborted: {e}")));
                    continue;
                }
            };
            metrics::record_ingest_outcome(&self.collection, outcome.label());
            match outcome {
                Outcome::Wrote => {
                    report.wrote += 1;
                    watermarks.record(item.key, item.signature);
                }
                Outcome::Skipped => report.skipped += 1,
                Outcome::Blacklisted(reason) => {
                    warn!(
                        entity = %item.entity,
                        reason = %truncate_detail(&reason),
                        "entity blacklisted"
                    );
                    if blacklist.add(item.entity.clone(), reason) {
                        report.blacklisted.push(item.entity);
                    }
                }
                Outcome::Failed(reason) => {
                    let reason = truncate_detail(&reason);
                    warn!(
                        key = %item.key,
                        entity = %item.entity,
                        error = %reason,
                        "ingestion failed"
                    );
                    report.failures.push((item.key, reason));
                }
            }
        }
        report.blacklisted.sort();
        report.failures.sort();

        report.watermarks_persisted = watermark_store.persist(&mut watermarks).await?;
        blacklist_store.persist(&mut blacklist).await?;

        if report.is_success() {
            let checkpoint = RunCheckpoint::new(run_started)
                .with_metadata("collection", self.collection.clone())
                .with_metadata("wrote", report.wrote)
                .with_metadata("unchanged", report.unchanged);
            checkpoints.save(&self.job, &checkpoint).await?;
            report.checkpoint_advanced = true;
        }

        info!(
            collection = %self.collection,
            job = %self.job,
            total = report.total,
            unchanged = report.unchanged,
            wrote = report.wrote,
            skipped = report.skipped,
            blacklisted = report.blacklisted.len(),
            failed = report.failures.len(),
            checkpoint_advanced = report.checkpoint_advanced,
            "ingestion finished"
        );
        Ok(report)
    }
}
