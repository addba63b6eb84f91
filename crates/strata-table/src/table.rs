//! Partitioned tables over a commit log.
//!
//! A [`Table`] is addressed by a root path inside a [`StorageBackend`]. Data
//! lives in Parquet files under Hive-style partition directories; the live
//! file set is whatever replaying `_delta_log` yields.
//!
//! Writes are two-phase: data files land first under fresh ULID names, then a
//! single commit publishes them. A writer that loses the commit race cleans
//! up its data files and reports [`TableError::CommitConflict`]; readers never
//! observe its files.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, UInt32Array};
use arrow::compute::{concat_batches, take_record_batch};
use arrow::datatypes::{Field, FieldRef, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use arrow::util::display::{ArrayFormatter, FormatOptions};
use bytes::Bytes;
use chrono::Utc;
use strata_core::storage::{StorageBackend, WritePrecondition, WriteResult};
use tracing::{Instrument, debug, info, warn};
use ulid::Ulid;

use crate::error::{Result, TableError};
use crate::frame::{align_to_schema, union_frames};
use crate::log::{AddFile, Commit, LOG_DIR, RemoveFile, SchemaDef, commit_file, parse_commit_file};
use crate::metrics;
use crate::parquet_util;
use crate::predicate::Predicate;

/// Partition value written for null partition cells.
pub const NULL_PARTITION: &str = "__HIVE_DEFAULT_PARTITION__";

/// How a write treats existing data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WriteMode {
    /// Add files; keep everything already live.
    #[default]
    Append,
    /// Replace live files, all of them or those matching the predicate.
    Overwrite,
}

/// How a write treats schema differences.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SchemaMode {
    /// Incoming columns must match the table exactly.
    #[default]
    Strict,
    /// Incoming columns are cast to table types, missing columns become
    /// null, and new columns are appended as nullable.
    Merge,
}

/// Options for [`Table::write`].
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Append or overwrite.
    pub mode: WriteMode,
    /// Restricts an overwrite to matching partitions.
    pub predicate: Option<Predicate>,
    /// Strict or merging schema handling.
    pub schema_mode: SchemaMode,
    /// Partition columns for a new table, or for a full overwrite.
    pub partition_by: Vec<String>,
}

impl WriteOptions {
    /// Append with strict schema.
    #[must_use]
    pub fn append() -> Self {
        Self::default()
    }

    /// Overwrite with strict schema.
    #[must_use]
    pub fn overwrite() -> Self {
        Self {
            mode: WriteMode::Overwrite,
            ..Self::default()
        }
    }

    /// Scopes an overwrite to partitions matching `predicate`.
    #[must_use]
    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// Sets the schema mode.
    #[must_use]
    pub fn with_schema_mode(mut self, schema_mode: SchemaMode) -> Self {
        self.schema_mode = schema_mode;
        self
    }

    /// Sets the partition columns.
    #[must_use]
    pub fn partitioned_by<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.partition_by = columns.into_iter().map(Into::into).collect();
        self
    }
}

/// Options for [`Table::read`].
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Columns to read, in order. `None` reads all.
    pub columns: Option<Vec<String>>,
    /// Prunes files by partition value.
    pub partition_filter: Option<Predicate>,
}

impl ReadOptions {
    /// Reads only `columns`.
    #[must_use]
    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Reads only partitions matching `filter`.
    #[must_use]
    pub fn with_partition_filter(mut self, filter: Predicate) -> Self {
        self.partition_filter = Some(filter);
        self
    }
}

/// Table state at one version.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Latest committed version.
    pub version: u64,
    /// Table schema.
    pub schema: SchemaRef,
    /// Partition columns.
    pub partition_columns: Vec<String>,
    /// Live data files, in commit order.
    pub files: Vec<AddFile>,
}

impl Snapshot {
    /// Total rows across live files.
    #[must_use]
    pub fn num_rows(&self) -> u64 {
        self.files.iter().map(|f| f.num_rows).sum()
    }

    /// Distinct values of a partition column across live files.
    #[must_use]
    pub fn partition_values(&self, column: &str) -> BTreeSet<String> {
        self.files
            .iter()
            .filter_map(|f| f.partition_values.get(column).cloned())
            .collect()
    }
}

/// Outcome of a committed write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitSummary {
    /// Version created by the write.
    pub version: u64,
    /// Data files added.
    pub files_added: usize,
    /// Data files removed from the live set.
    pub files_removed: usize,
    /// Rows written.
    pub rows_written: u64,
}

/// A table rooted at a storage path.
#[derive(Clone)]
pub struct Table {
    storage: Arc<dyn StorageBackend>,
    root: String,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table").field("root", &self.root).finish()
    }
}

impl Table {
    /// Opens the table at `root`. Does not touch storage.
    #[must_use]
    pub fn open(storage: Arc<dyn StorageBackend>, root: impl Into<String>) -> Self {
        let root = root.into().trim_end_matches('/').to_string();
        Self { storage, root }
    }

    /// Table root path.
    #[must_use]
    pub fn root(&self) -> &str {
        &self.root
    }

    fn prefix(&self) -> String {
        if self.root.is_empty() {
            String::new()
        } else {
            format!("{}/", self.root)
        }
    }

    fn path(&self, relative: &str) -> String {
        format!("{}{relative}", self.prefix())
    }

    async fn versions(&self) -> Result<Vec<u64>> {
        let log_prefix = self.path(&format!("{LOG_DIR}/"));
        let mut versions: Vec<u64> = self
            .storage
            .list(&log_prefix)
            .await?
            .iter()
            .filter_map(|m| parse_commit_file(&m.path))
            .collect();
        versions.sort_unstable();
        Ok(versions)
    }

    /// Returns true if the table has at least one commit.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be listed.
    pub async fn exists(&self) -> Result<bool> {
        Ok(!self.versions().await?.is_empty())
    }

    /// Replays the commit log. Returns `None` for a table with no commits.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::InvalidLog`] if an entry cannot be parsed.
    pub async fn snapshot(&self) -> Result<Option<Snapshot>> {
        let versions = self.versions().await?;
        let Some(&latest) = versions.last() else {
            return Ok(None);
        };

        let mut live: Vec<AddFile> = Vec::new();
        let mut schema_def = None;
        let mut partition_columns = Vec::new();
        for version in versions {
            let path = self.path(&commit_file(version));
            let bytes = self.storage.get(&path).await?;
            let commit: Commit =
                serde_json::from_slice(&bytes).map_err(|e| TableError::InvalidLog {
                    path: path.clone(),
                    message: e.to_string(),
                })?;
            if commit.version != version {
                return Err(TableError::InvalidLog {
                    path,
                    message: format!("entry claims version {}", commit.version),
                });
            }
            let replaced: BTreeSet<&str> = commit
                .remove
                .iter()
                .map(|r| r.path.as_str())
                .chain(commit.add.iter().map(|a| a.path.as_str()))
                .collect();
            live.retain(|f| !replaced.contains(f.path.as_str()));
            live.extend(commit.add);
            schema_def = Some((path, commit.schema));
            partition_columns = commit.partition_columns;
        }

        let Some((path, schema_def)) = schema_def else {
            return Ok(None);
        };
        let schema = schema_def
            .to_arrow()
            .map_err(|message| TableError::InvalidLog { path, message })?;

        Ok(Some(Snapshot {
            version: latest,
            schema,
            partition_columns,
            files: live,
        }))
    }

    async fn require_snapshot(&self) -> Result<Snapshot> {
        self.snapshot().await?.ok_or_else(|| TableError::NotFound {
            table: self.root.clone(),
        })
    }

    /// Reads the table into one batch.
    ///
    /// Files written under an older schema are aligned to the current one;
    /// columns they lack read as null.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::NotFound`] if the table has no commits,
    /// [`TableError::InvalidFrame`] for unknown columns, and
    /// [`TableError::InvalidPredicate`] for a filter on a non-partition column.
    pub async fn read(&self, options: &ReadOptions) -> Result<RecordBatch> {
        let span = strata_core::observability::table_span("read", &self.root);
        async {
            let snapshot = self.require_snapshot().await?;
            self.read_snapshot(&snapshot, options).await
        }
        .instrument(span)
        .await
    }

    /// Reads the files of an already-replayed snapshot.
    ///
    /// # Errors
    ///
    /// As for [`Table::read`], minus the existence check.
    pub async fn read_snapshot(
        &self,
        snapshot: &Snapshot,
        options: &ReadOptions,
    ) -> Result<RecordBatch> {
        if let Some(filter) = &options.partition_filter {
            if !snapshot.partition_columns.iter().any(|c| c == filter.column()) {
                return Err(TableError::InvalidPredicate(format!(
                    "{} is not a partition column of {}",
                    filter.column(),
                    self.root
                )));
            }
        }

        let target: SchemaRef = match &options.columns {
            Some(columns) => {
                let fields = columns
                    .iter()
                    .map(|c| {
                        snapshot
                            .schema
                            .field_with_name(c)
                            .map(|f| Arc::new(f.clone()))
                            .map_err(|_| {
                                TableError::InvalidFrame(format!("unknown column {c}"))
                            })
                    })
                    .collect::<Result<Vec<FieldRef>>>()?;
                Arc::new(Schema::new(fields))
            }
            None => Arc::clone(&snapshot.schema),
        };
        let wanted: Vec<String> = target.fields().iter().map(|f| f.name().clone()).collect();

        let mut batches = Vec::new();
        let mut files_read = 0_usize;
        for file in &snapshot.files {
            if let Some(filter) = &options.partition_filter {
                if !filter.matches(&file.partition_values) {
                    continue;
                }
            }
            let bytes = self.storage.get(&self.path(&file.path)).await?;
            for batch in parquet_util::decode(bytes, Some(&wanted))? {
                batches.push(align_to_schema(&batch, &target)?);
            }
            files_read += 1;
        }
        debug!(files_read, live_files = snapshot.files.len(), "table read");

        concat_batches(&target, &batches).map_err(|e| TableError::arrow("concat read", &e))
    }

    /// Writes `batches` as one commit.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::SchemaMismatch`] when the data does not fit the
    /// table schema, [`TableError::InvalidPredicate`] when rows fall outside an
    /// overwrite predicate, and [`TableError::CommitConflict`] when another
    /// writer took the version first.
    pub async fn write(
        &self,
        batches: &[RecordBatch],
        options: &WriteOptions,
    ) -> Result<CommitSummary> {
        let span = strata_core::observability::table_span("write", &self.root);
        self.write_inner(batches, options).instrument(span).await
    }

    async fn write_inner(
        &self,
        batches: &[RecordBatch],
        options: &WriteOptions,
    ) -> Result<CommitSummary> {
        let data = match batches {
            [] => {
                return Err(TableError::InvalidFrame(
                    "write needs at least one batch".into(),
                ));
            }
            [single] => single.clone(),
            many => union_frames(many)?,
        };
        let snapshot = self.snapshot().await?;

        let (schema, data) = match &snapshot {
            Some(snapshot) => {
                conform(&self.root, &snapshot.schema, &data, options.schema_mode)?
            }
            None => (data.schema(), data),
        };

        let repartition = options.mode == WriteMode::Overwrite
            && options.predicate.is_none()
            && !options.partition_by.is_empty();
        let partition_columns = match &snapshot {
            Some(snapshot) if !repartition => {
                if !options.partition_by.is_empty()
                    && options.partition_by != snapshot.partition_columns
                {
                    warn!(
                        requested = ?options.partition_by,
                        existing = ?snapshot.partition_columns,
                        "ignoring partition_by for existing table"
                    );
                }
                snapshot.partition_columns.clone()
            }
            _ => options.partition_by.clone(),
        };
        for column in &partition_columns {
            if schema.field_with_name(column).is_err() {
                return Err(TableError::InvalidFrame(format!(
                    "partition column {column} not in schema"
                )));
            }
        }

        if let Some(predicate) = &options.predicate {
            if options.mode != WriteMode::Overwrite {
                return Err(TableError::InvalidPredicate(
                    "a predicate requires overwrite mode".into(),
                ));
            }
            if !partition_columns.iter().any(|c| c == predicate.column()) {
                return Err(TableError::InvalidPredicate(format!(
                    "{} is not a partition column",
                    predicate.column()
                )));
            }
        }

        let groups = group_by_partition(&data, &partition_columns)?;
        if let Some(predicate) = &options.predicate {
            for values in groups.keys() {
                let partition: BTreeMap<String, String> = partition_columns
                    .iter()
                    .cloned()
                    .zip(values.iter().cloned())
                    .collect();
                if !predicate.matches(&partition) {
                    return Err(TableError::InvalidPredicate(format!(
                        "rows in partition {} fall outside {predicate}",
                        partition_dir(&partition_columns, values)
                    )));
                }
            }
        }

        let now = Utc::now();
        let mut added = Vec::with_capacity(groups.len());
        for (values, indices) in &groups {
            let indices = UInt32Array::from(indices.clone());
            let part = take_record_batch(&data, &indices)
                .map_err(|e| TableError::arrow("partition rows", &e))?;
            let bytes = parquet_util::encode(Arc::clone(&schema), &[part])?;
            let relative = format!(
                "{}part-{}.parquet",
                partition_dir(&partition_columns, values),
                Ulid::new().to_string().to_lowercase()
            );
            let size = bytes.len() as u64;
            let written = self
                .storage
                .put(&self.path(&relative), bytes, WritePrecondition::DoesNotExist)
                .await;
            match written {
                Ok(WriteResult::Success { .. }) => {}
                Ok(WriteResult::PreconditionFailed { .. }) => {
                    self.discard(&added).await;
                    return Err(TableError::Core(strata_core::Error::internal(format!(
                        "data file name collision: {relative}"
                    ))));
                }
                Err(e) => {
                    self.discard(&added).await;
                    return Err(e.into());
                }
            }
            added.push(AddFile {
                path: relative,
                partition_values: partition_columns
                    .iter()
                    .cloned()
                    .zip(values.iter().cloned())
                    .collect(),
                size,
                num_rows: indices.len() as u64,
                modification_time: now,
            });
        }

        let removed: Vec<RemoveFile> = match (&snapshot, options.mode) {
            (Some(snapshot), WriteMode::Overwrite) => snapshot
                .files
                .iter()
                .filter(|f| {
                    options
                        .predicate
                        .as_ref()
                        .is_none_or(|p| p.matches(&f.partition_values))
                })
                .map(|f| RemoveFile {
                    path: f.path.clone(),
                    deletion_time: now,
                })
                .collect(),
            _ => Vec::new(),
        };

        let version = snapshot.as_ref().map_or(0, |s| s.version + 1);
        let operation = match options.mode {
            WriteMode::Append => "WRITE",
            WriteMode::Overwrite => "OVERWRITE",
        };
        let commit = Commit {
            version,
            timestamp: now,
            operation: operation.to_string(),
            predicate: options.predicate.as_ref().map(ToString::to_string),
            schema: SchemaDef::from_arrow(&schema)?,
            partition_columns,
            add: added,
            remove: removed,
        };
        let body = serde_json::to_vec_pretty(&commit)
            .map_err(|e| strata_core::Error::serialization(e.to_string()))?;

        let commit_path = self.path(&commit_file(version));
        let result = self
            .storage
            .put(&commit_path, Bytes::from(body), WritePrecondition::DoesNotExist)
            .await;
        match result {
            Ok(WriteResult::Success { .. }) => {}
            Ok(WriteResult::PreconditionFailed { .. }) => {
                self.discard(&commit.add).await;
                warn!(version, "commit conflict");
                return Err(TableError::CommitConflict {
                    table: self.root.clone(),
                    version,
                });
            }
            Err(e) => {
                self.discard(&commit.add).await;
                return Err(e.into());
            }
        }

        let summary = CommitSummary {
            version,
            files_added: commit.add.len(),
            files_removed: commit.remove.len(),
            rows_written: data.num_rows() as u64,
        };
        metrics::record_commit(operation, summary.rows_written);
        info!(
            version,
            operation,
            predicate = commit.predicate.as_deref().unwrap_or(""),
            files_added = summary.files_added,
            files_removed = summary.files_removed,
            rows = summary.rows_written,
            "table commit"
        );
        Ok(summary)
    }

    async fn discard(&self, files: &[AddFile]) {
        for file in files {
            if let Err(e) = self.storage.delete(&self.path(&file.path)).await {
                warn!(path = %file.path, error = %e, "failed to clean up data file");
            }
        }
    }

    /// Deletes every object under the table root. Returns the count deleted.
    ///
    /// # Errors
    ///
    /// Returns the first storage failure.
    pub async fn delete_table(&self) -> Result<usize> {
        let deleted = self.storage.delete_prefix(&self.prefix()).await?;
        info!(table = %self.root, deleted, "table deleted");
        Ok(deleted)
    }

    /// Deletes data files the latest snapshot does not reference.
    ///
    /// Does nothing for a table with no commits. Returns the count deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be built or a delete fails.
    pub async fn vacuum(&self) -> Result<usize> {
        let Some(snapshot) = self.snapshot().await? else {
            return Ok(0);
        };
        let live: BTreeSet<String> = snapshot
            .files
            .iter()
            .map(|f| self.path(&f.path))
            .collect();
        let log_prefix = self.path(&format!("{LOG_DIR}/"));

        let mut objects = self.storage.list(&self.prefix()).await?;
        objects.sort_by(|a, b| a.path.cmp(&b.path));
        let mut deleted = 0;
        for object in objects {
            if object.path.starts_with(&log_prefix)
                || live.contains(&object.path)
                || !object.path.ends_with(".parquet")
            {
                continue;
            }
            self.storage.delete(&object.path).await?;
            deleted += 1;
        }
        if deleted > 0 {
            info!(table = %self.root, deleted, "vacuumed unreferenced files");
        }
        Ok(deleted)
    }
}

/// Conforms `data` to the table schema under `mode`, returning the schema to
/// commit and the conformed data.
fn conform(
    table: &str,
    existing: &SchemaRef,
    data: &RecordBatch,
    mode: SchemaMode,
) -> Result<(SchemaRef, RecordBatch)> {
    let incoming = data.schema();
    let mismatch = |details: Vec<String>| TableError::SchemaMismatch {
        table: table.to_string(),
        details,
    };

    match mode {
        SchemaMode::Strict => {
            let mut details = Vec::new();
            for field in existing.fields() {
                match incoming.field_with_name(field.name()) {
                    Ok(other) if other.data_type() != field.data_type() => details.push(format!(
                        "column {}: table {}, write {}",
                        field.name(),
                        field.data_type(),
                        other.data_type()
                    )),
                    Ok(_) => {}
                    Err(_) => details.push(format!("missing column {}", field.name())),
                }
            }
            for field in incoming.fields() {
                if existing.field_with_name(field.name()).is_err() {
                    details.push(format!("unexpected column {}", field.name()));
                }
            }
            if !details.is_empty() {
                return Err(mismatch(details));
            }
            let aligned =
                align_to_schema(data, existing).map_err(|e| mismatch(vec![e.to_string()]))?;
            Ok((Arc::clone(existing), aligned))
        }
        SchemaMode::Merge => {
            let mut fields: Vec<Field> = existing
                .fields()
                .iter()
                .map(|f| {
                    let present = incoming.field_with_name(f.name()).is_ok();
                    f.as_ref().clone().with_nullable(f.is_nullable() || !present)
                })
                .collect();
            for field in incoming.fields() {
                if existing.field_with_name(field.name()).is_err() {
                    fields.push(field.as_ref().clone().with_nullable(true));
                }
            }
            let merged = Arc::new(Schema::new(fields));
            let aligned =
                align_to_schema(data, &merged).map_err(|e| mismatch(vec![e.to_string()]))?;
            Ok((merged, aligned))
        }
    }
}

fn partition_value(array: &ArrayRef, formatter: &ArrayFormatter<'_>, row: usize) -> Result<String> {
    if array.is_null(row) {
        return Ok(NULL_PARTITION.to_string());
    }
    let value = formatter.value(row).to_string();
    if value.is_empty() || value.contains('/') || value.contains('=') {
        return Err(TableError::InvalidFrame(format!(
            "partition value {value:?} is not path-safe"
        )));
    }
    Ok(value)
}

fn group_by_partition(
    data: &RecordBatch,
    columns: &[String],
) -> Result<BTreeMap<Vec<String>, Vec<u32>>> {
    let mut groups: BTreeMap<Vec<String>, Vec<u32>> = BTreeMap::new();
    if data.num_rows() == 0 {
        return Ok(groups);
    }
    let arrays = columns
        .iter()
        .map(|c| {
            data.column_by_name(c)
                .cloned()
                .ok_or_else(|| TableError::InvalidFrame(format!("missing partition column {c}")))
        })
        .collect::<Result<Vec<ArrayRef>>>()?;
    let options = FormatOptions::default();
    let formatters = arrays
        .iter()
        .map(|a| ArrayFormatter::try_new(a.as_ref(), &options))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| TableError::arrow("format partition values", &e))?;

    for row in 0..data.num_rows() {
        let key = arrays
            .iter()
            .zip(&formatters)
            .map(|(array, formatter)| partition_value(array, formatter, row))
            .collect::<Result<Vec<_>>>()?;
        let row = u32::try_from(row)
            .map_err(|_| TableError::InvalidFrame("batch exceeds u32 rows".into()))?;
        groups.entry(key).or_default().push(row);
    }
    Ok(groups)
}

fn partition_dir(columns: &[String], values: &[String]) -> String {
    columns
        .iter()
        .zip(values)
        .map(|(c, v)| format!("{c}={v}/"))
        .collect()
}
