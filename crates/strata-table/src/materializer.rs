//! Cross-sectional ("by-date") materialization.
//!
//! Merges many per-entity tables into one table partitioned by `year_month`.
//! A scoped run overwrites only the months in its scope; re-running the same
//! scope over unchanged sources reproduces the same partitions.

use std::collections::BTreeSet;
use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use futures::stream::{self, StreamExt};
use strata_core::backfill::BackfillWindow;
use strata_core::observability::truncate_detail;
use strata_core::partition::{PartitionScope, YEAR_MONTH_COLUMN, YearMonth};
use strata_core::storage::StorageBackend;
use tracing::{Instrument, debug, info, warn};

use crate::discovery::{discover_entities, entity_table_root};
use crate::error::Result;
use crate::frame::{
    apply_cutoff, coerce_date_column, date_values, dedupe_keep_last, ensure_constant_column,
    filter_months, normalize_column_names, normalize_name, sort_by_keys, union_frames,
    with_year_month,
};
use crate::metrics;
use crate::predicate::Predicate;
use crate::table::{ReadOptions, SchemaMode, Table, WriteOptions};

/// Default entity column.
pub const DEFAULT_ENTITY_COLUMN: &str = "symbol";

/// Default date column.
pub const DEFAULT_DATE_COLUMN: &str = "date";

/// Default number of source tables loaded concurrently.
pub const DEFAULT_LOAD_CONCURRENCY: usize = 8;

/// What to materialize.
#[derive(Debug, Clone)]
pub struct MaterializeRequest {
    /// Roots holding per-entity tables (`{root}/{entity}/_delta_log`).
    pub source_roots: Vec<String>,
    /// Root of the by-date table.
    pub target_root: String,
    /// Months to overwrite, or all.
    pub scope: PartitionScope,
    /// Entity column, filled from the directory name when absent.
    pub entity_column: String,
    /// Date column.
    pub date_column: String,
    /// Entities to try when discovery finds none.
    pub fallback_universe: Vec<String>,
}

impl MaterializeRequest {
    /// A request with default column names and no fallback universe.
    pub fn new<I, S>(source_roots: I, target_root: impl Into<String>, scope: PartitionScope) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            source_roots: source_roots.into_iter().map(Into::into).collect(),
            target_root: target_root.into(),
            scope,
            entity_column: DEFAULT_ENTITY_COLUMN.to_string(),
            date_column: DEFAULT_DATE_COLUMN.to_string(),
            fallback_universe: Vec::new(),
        }
    }

    /// Sets the entity column.
    #[must_use]
    pub fn with_entity_column(mut self, column: impl Into<String>) -> Self {
        self.entity_column = column.into();
        self
    }

    /// Sets the date column.
    #[must_use]
    pub fn with_date_column(mut self, column: impl Into<String>) -> Self {
        self.date_column = column.into();
        self
    }

    /// Sets the entities tried when discovery finds none.
    #[must_use]
    pub fn with_fallback_universe<I, S>(mut self, entities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fallback_universe = entities.into_iter().map(Into::into).collect();
        self
    }
}

/// A source table skipped after a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFailure {
    /// Source table root.
    pub table: String,
    /// Truncated error text.
    pub reason: String,
}

/// Outcome of a materialization run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaterializeReport {
    /// Rows written to the target.
    pub rows_written: u64,
    /// Source tables considered.
    pub tables_scanned: usize,
    /// Source tables that contributed rows.
    pub tables_loaded: usize,
    /// Source tables skipped after a failure.
    pub tables_failed: usize,
    /// `year_month` partitions written.
    pub partitions: BTreeSet<String>,
    /// Per-table failures.
    pub failures: Vec<SourceFailure>,
    /// Target version committed, if a write happened.
    pub version: Option<u64>,
}

enum Loaded {
    Rows(RecordBatch),
    Empty,
    Missing,
    Failed(String),
}

/// Builds by-date tables from per-entity tables.
#[derive(Clone)]
pub struct Materializer {
    storage: Arc<dyn StorageBackend>,
    window: BackfillWindow,
    concurrency: usize,
}

impl std::fmt::Debug for Materializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Materializer")
            .field("window", &self.window)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

impl Materializer {
    /// Creates a materializer applying `window` to every source.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>, window: BackfillWindow) -> Self {
        Self {
            storage,
            window,
            concurrency: DEFAULT_LOAD_CONCURRENCY,
        }
    }

    /// Sets how many source tables load concurrently.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Materializes `request` into its target table.
    ///
    /// A source table that fails to load is logged, counted, and skipped.
    /// When no rows survive, the target is left untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if discovery fails or the target write fails.
    pub async fn materialize(&self, request: &MaterializeRequest) -> Result<MaterializeReport> {
        let span = strata_core::observability::table_span("materialize", &request.target_root);
        self.materialize_inner(request).instrument(span).await
    }

    async fn materialize_inner(&self, request: &MaterializeRequest) -> Result<MaterializeReport> {
        let sources = self.sources(request).await?;
        let entity_column = normalize_name(&request.entity_column);
        let date_column = normalize_name(&request.date_column);

        let loaded: Vec<(String, Loaded)> = stream::iter(sources)
            .map(|(table_root, entity)| {
                let entity_column = entity_column.as_str();
                let date_column = date_column.as_str();
                async move {
                    let outcome = match self
                        .load_entity(&table_root, &entity, entity_column, date_column, &request.scope)
                        .await
                    {
                        Ok(Some(batch)) if batch.num_rows() > 0 => Loaded::Rows(batch),
                        Ok(Some(_)) => Loaded::Empty,
                        Ok(None) => Loaded::Missing,
                        Err(e) => Loaded::Failed(truncate_detail(&e.to_string())),
                    };
                    (table_root, outcome)
                }
            })
            .buffered(self.concurrency)
            .collect()
            .await;

        let mut report = MaterializeReport {
            tables_scanned: loaded.len(),
            ..MaterializeReport::default()
        };
        let mut frames = Vec::new();
        for (table, outcome) in loaded {
            match outcome {
                Loaded::Rows(batch) => {
                    report.tables_loaded += 1;
                    frames.push(batch);
                }
                Loaded::Empty => report.tables_loaded += 1,
                Loaded::Missing => debug!(table = %table, "no source table"),
                Loaded::Failed(reason) => {
                    warn!(table = %table, error = %reason, "skipping source table");
                    report.tables_failed += 1;
                    report.failures.push(SourceFailure { table, reason });
                }
            }
        }

        if frames.is_empty() {
            info!(
                scope = %request.scope,
                tables_scanned = report.tables_scanned,
                tables_failed = report.tables_failed,
                "no rows to materialize"
            );
            metrics::record_materialized(&request.target_root, 0, report.tables_failed);
            return Ok(report);
        }

        let keys = [date_column.as_str(), entity_column.as_str()];
        let combined = union_frames(&frames)?;
        let combined = dedupe_keep_last(&combined, &keys)?;
        let combined = sort_by_keys(&combined, &keys)?;

        let mut options = WriteOptions::overwrite()
            .with_schema_mode(SchemaMode::Merge)
            .partitioned_by([YEAR_MONTH_COLUMN]);
        if let Some(predicate) = Predicate::for_scope(&request.scope) {
            options = options.with_predicate(predicate);
        }

        let target = Table::open(Arc::clone(&self.storage), request.target_root.clone());
        let summary = target.write(&[combined.clone()], &options).await?;

        report.rows_written = summary.rows_written;
        report.version = Some(summary.version);
        report.partitions = date_values(&combined, &date_column)?
            .into_iter()
            .flatten()
            .map(|d| YearMonth::from_date(d).to_string())
            .collect();

        metrics::record_materialized(&request.target_root, report.rows_written, report.tables_failed);
        info!(
            scope = %request.scope,
            rows_written = report.rows_written,
            tables_scanned = report.tables_scanned,
            tables_loaded = report.tables_loaded,
            tables_failed = report.tables_failed,
            partitions = ?report.partitions,
            version = summary.version,
            "materialized by date"
        );
        Ok(report)
    }

    /// Resolves `(table_root, entity)` pairs, discovered or from the fallback.
    async fn sources(&self, request: &MaterializeRequest) -> Result<Vec<(String, String)>> {
        let mut sources = Vec::new();
        for root in &request.source_roots {
            let entities = discover_entities(self.storage.as_ref(), root).await?;
            sources.extend(
                entities
                    .into_iter()
                    .map(|entity| (entity_table_root(root, &entity), entity)),
            );
        }
        if sources.is_empty() && !request.fallback_universe.is_empty() {
            info!(
                entities = request.fallback_universe.len(),
                "discovery found no tables; using fallback universe"
            );
            for root in &request.source_roots {
                let universe: BTreeSet<&String> = request.fallback_universe.iter().collect();
                sources.extend(
                    universe
                        .into_iter()
                        .map(|entity| (entity_table_root(root, entity), entity.clone())),
                );
            }
        }
        Ok(sources)
    }

    /// Loads and shapes one entity table. `None` when the table does not exist.
    async fn load_entity(
        &self,
        table_root: &str,
        entity: &str,
        entity_column: &str,
        date_column: &str,
        scope: &PartitionScope,
    ) -> Result<Option<RecordBatch>> {
        let table = Table::open(Arc::clone(&self.storage), table_root);
        let Some(snapshot) = table.snapshot().await? else {
            return Ok(None);
        };

        let mut options = ReadOptions::default();
        if snapshot.partition_columns.iter().any(|c| c == YEAR_MONTH_COLUMN) {
            if let Some(filter) = Predicate::for_scope(scope) {
                options = options.with_partition_filter(filter);
            }
        }
        let batch = table.read_snapshot(&snapshot, &options).await?;

        let batch = normalize_column_names(&batch)?;
        let batch = ensure_constant_column(&batch, entity_column, entity)?;
        let (batch, unparseable) = coerce_date_column(&batch, date_column)?;
        let (batch, before_cutoff) = apply_cutoff(&batch, date_column, self.window.start)?;
        let batch = match scope.months() {
            Some(months) => filter_months(&batch, date_column, months)?,
            None => batch,
        };
        let batch = with_year_month(&batch, date_column)?;
        let batch = dedupe_keep_last(&batch, &[date_column, entity_column])?;

        debug!(
            table = %table_root,
            rows = batch.num_rows(),
            unparseable,
            before_cutoff,
            "loaded source table"
        );
        Ok(Some(batch))
    }
}
