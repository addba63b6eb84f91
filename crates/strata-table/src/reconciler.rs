//! Reconciliation sweep.
//!
//! Two passes, both functions of current storage state only, so the sweep is
//! safe to run on every job invocation:
//!
//! 1. Orphan purge: downstream entities with no upstream table are deleted.
//! 2. Cutoff enforcement: surviving downstream tables are re-filtered with the
//!    current backfill window, rewritten or deleted, then vacuumed.

use std::collections::BTreeSet;
use std::sync::Arc;

use strata_core::backfill::BackfillWindow;
use strata_core::observability::truncate_detail;
use strata_core::storage::StorageBackend;
use tracing::{debug, info, warn};

use crate::discovery::{discover_entities, entity_table_root};
use crate::error::{Result, TableError};
use crate::frame::apply_cutoff;
use crate::metrics;
use crate::table::{ReadOptions, Table, WriteOptions};

/// Outcome of an orphan purge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Entities found upstream.
    pub upstream_entities: usize,
    /// Entities found downstream.
    pub downstream_entities: usize,
    /// Orphaned entities purged (or that would be, in dry-run mode).
    pub orphans_purged: Vec<String>,
    /// Objects deleted (or that would be).
    pub blobs_deleted: usize,
    /// True when the purge was refused because upstream was empty.
    pub refused_empty_upstream: bool,
    /// True when nothing was deleted.
    pub dry_run: bool,
}

/// Outcome of cutoff enforcement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CutoffReport {
    /// Tables examined.
    pub tables_checked: usize,
    /// Tables rewritten without their pre-cutoff rows.
    pub tables_rewritten: usize,
    /// Tables deleted because no rows survived.
    pub tables_deleted: usize,
    /// Rows dropped across all tables.
    pub rows_dropped: usize,
    /// Unreferenced data files removed after rewrites.
    pub files_vacuumed: usize,
    /// Tables skipped after a failure.
    pub tables_failed: usize,
}

/// Both passes of a sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Orphan purge.
    pub reconcile: ReconcileReport,
    /// Cutoff enforcement over non-orphan entities.
    pub cutoff: CutoffReport,
}

enum CutoffOutcome {
    Clean,
    Rewritten { dropped: usize, vacuumed: usize },
    Deleted { dropped: usize },
}

/// Purges downstream drift.
#[derive(Clone)]
pub struct Reconciler {
    storage: Arc<dyn StorageBackend>,
    window: BackfillWindow,
    dry_run: bool,
    allow_empty_upstream: bool,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("window", &self.window)
            .field("dry_run", &self.dry_run)
            .field("allow_empty_upstream", &self.allow_empty_upstream)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a reconciler enforcing `window`.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>, window: BackfillWindow) -> Self {
        Self {
            storage,
            window,
            dry_run: false,
            allow_empty_upstream: false,
        }
    }

    /// Reports what would change without deleting or rewriting anything.
    #[must_use]
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Allows purging every downstream entity when upstream discovery is
    /// empty. Off by default: an empty upstream usually means a wrong root.
    #[must_use]
    pub fn allow_empty_upstream(mut self, allow: bool) -> Self {
        self.allow_empty_upstream = allow;
        self
    }

    /// Deletes everything under `path_builder(entity)` for each downstream
    /// entity with no upstream table.
    ///
    /// # Errors
    ///
    /// Returns an error if discovery or a delete fails.
    pub async fn reconcile<F>(
        &self,
        upstream_root: &str,
        downstream_root: &str,
        path_builder: F,
    ) -> Result<ReconcileReport>
    where
        F: Fn(&str) -> String,
    {
        let upstream = discover_entities(self.storage.as_ref(), upstream_root).await?;
        let downstream = discover_entities(self.storage.as_ref(), downstream_root).await?;
        self.purge(upstream_root, downstream_root, &upstream, &downstream, &path_builder)
            .await
    }

    async fn purge<F>(
        &self,
        upstream_root: &str,
        downstream_root: &str,
        upstream: &BTreeSet<String>,
        downstream: &BTreeSet<String>,
        path_builder: &F,
    ) -> Result<ReconcileReport>
    where
        F: Fn(&str) -> String,
    {
        let mut report = ReconcileReport {
            upstream_entities: upstream.len(),
            downstream_entities: downstream.len(),
            dry_run: self.dry_run,
            ..ReconcileReport::default()
        };

        let orphans: Vec<&String> = downstream.difference(upstream).collect();
        if orphans.is_empty() {
            debug!(upstream = upstream_root, downstream = downstream_root, "no orphans");
            return Ok(report);
        }
        if upstream.is_empty() && !self.allow_empty_upstream {
            warn!(
                upstream = upstream_root,
                downstream = downstream_root,
                orphans = orphans.len(),
                "upstream has no entities; refusing to purge"
            );
            report.refused_empty_upstream = true;
            return Ok(report);
        }

        for entity in orphans {
            let prefix = format!("{}/", path_builder(entity).trim_end_matches('/'));
            let deleted = if self.dry_run {
                self.storage.list(&prefix).await?.len()
            } else {
                self.storage.delete_prefix(&prefix).await?
            };
            info!(
                entity = %entity,
                prefix = %prefix,
                deleted,
                dry_run = self.dry_run,
                "purged orphaned entity"
            );
            report.blobs_deleted += deleted;
            report.orphans_purged.push(entity.clone());
        }

        if !self.dry_run {
            metrics::record_purge(downstream_root, report.orphans_purged.len(), report.blobs_deleted);
        }
        Ok(report)
    }

    /// Re-applies the backfill cutoff to every downstream table.
    ///
    /// A table that fails is logged, counted, and skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if discovery fails.
    pub async fn enforce_cutoff(
        &self,
        downstream_root: &str,
        date_column: &str,
    ) -> Result<CutoffReport> {
        let entities = discover_entities(self.storage.as_ref(), downstream_root).await?;
        Ok(self.enforce_for(downstream_root, &entities, date_column).await)
    }

    /// Runs the orphan purge, then cutoff enforcement over the entities that
    /// are not orphans.
    ///
    /// # Errors
    ///
    /// Returns an error if discovery or a purge delete fails.
    pub async fn sweep<F>(
        &self,
        upstream_root: &str,
        downstream_root: &str,
        path_builder: F,
        date_column: &str,
    ) -> Result<SweepReport>
    where
        F: Fn(&str) -> String,
    {
        let upstream = discover_entities(self.storage.as_ref(), upstream_root).await?;
        let downstream = discover_entities(self.storage.as_ref(), downstream_root).await?;
        let reconcile = self
            .purge(upstream_root, downstream_root, &upstream, &downstream, &path_builder)
            .await?;
        let survivors: BTreeSet<String> = if reconcile.refused_empty_upstream {
            downstream
        } else {
            downstream.intersection(&upstream).cloned().collect()
        };
        let cutoff = self.enforce_for(downstream_root, &survivors, date_column).await;
        Ok(SweepReport { reconcile, cutoff })
    }

    async fn enforce_for(
        &self,
        downstream_root: &str,
        entities: &BTreeSet<String>,
        date_column: &str,
    ) -> CutoffReport {
        let mut report = CutoffReport::default();
        for entity in entities {
            let root = entity_table_root(downstream_root, entity);
            report.tables_checked += 1;
            match self.enforce_table(&root, date_column).await {
                Ok(CutoffOutcome::Clean) => {}
                Ok(CutoffOutcome::Rewritten { dropped, vacuumed }) => {
                    report.tables_rewritten += 1;
                    report.rows_dropped += dropped;
                    report.files_vacuumed += vacuumed;
                }
                Ok(CutoffOutcome::Deleted { dropped }) => {
                    report.tables_deleted += 1;
                    report.rows_dropped += dropped;
                }
                Err(e) => {
                    warn!(
                        table = %root,
                        error = %truncate_detail(&e.to_string()),
                        "cutoff enforcement failed"
                    );
                    report.tables_failed += 1;
                }
            }
        }
        if !self.dry_run {
            metrics::record_cutoff(downstream_root, report.rows_dropped);
        }
        info!(
            downstream = downstream_root,
            start = %self.window.start,
            tables_checked = report.tables_checked,
            tables_rewritten = report.tables_rewritten,
            tables_deleted = report.tables_deleted,
            rows_dropped = report.rows_dropped,
            tables_failed = report.tables_failed,
            dry_run = self.dry_run,
            "cutoff enforced"
        );
        report
    }

    async fn enforce_table(&self, root: &str, date_column: &str) -> Result<CutoffOutcome> {
        let table = Table::open(Arc::clone(&self.storage), root);
        let snapshot = table.snapshot().await?.ok_or_else(|| TableError::NotFound {
            table: root.to_string(),
        })?;
        let batch = table.read_snapshot(&snapshot, &ReadOptions::default()).await?;
        let (kept, dropped) = apply_cutoff(&batch, date_column, self.window.start)?;
        if dropped == 0 {
            return Ok(CutoffOutcome::Clean);
        }

        if kept.num_rows() == 0 {
            if !self.dry_run {
                table.delete_table().await?;
            }
            info!(table = %root, dropped, "table emptied by cutoff; deleted");
            return Ok(CutoffOutcome::Deleted { dropped });
        }

        if self.dry_run {
            return Ok(CutoffOutcome::Rewritten {
                dropped,
                vacuumed: 0,
            });
        }
        let options =
            WriteOptions::overwrite().partitioned_by(snapshot.partition_columns.iter().cloned());
        let summary = table.write(&[kept], &options).await?;
        let vacuumed = table.vacuum().await?;
        info!(
            table = %root,
            dropped,
            version = summary.version,
            vacuumed,
            "table rewritten by cutoff"
        );
        Ok(CutoffOutcome::Rewritten { dropped, vacuumed })
    }
}
