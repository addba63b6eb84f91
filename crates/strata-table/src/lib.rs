//! # strata-table
//!
//! Partitioned Parquet tables with a JSON commit log, plus the two jobs that
//! maintain shared tables across entities:
//!
//! - [`Table`]: append, overwrite, and predicate-scoped overwrite over an
//!   optimistic commit log, with strict or merging schema handling
//! - [`Materializer`]: merges per-entity tables into a by-date table,
//!   overwriting only the months in scope
//! - [`Reconciler`]: purges downstream entities whose upstream disappeared and
//!   re-applies the backfill cutoff to what remains
//!
//! ## Layout
//!
//! ```text
//! {root}/_delta_log/00000000000000000000.json
//! {root}/year_month=2025-01/part-01jb....parquet
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod discovery;
pub mod error;
pub mod frame;
pub mod log;
pub mod materializer;
pub mod metrics;
pub mod parquet_util;
pub mod predicate;
pub mod reconciler;
pub mod table;

pub use discovery::{discover_entities, entity_table_root};
pub use error::{Result, TableError};
pub use materializer::{MaterializeReport, MaterializeRequest, Materializer, SourceFailure};
pub use predicate::Predicate;
pub use reconciler::{CutoffReport, ReconcileReport, Reconciler, SweepReport};
pub use table::{
    CommitSummary, ReadOptions, SchemaMode, Snapshot, Table, WriteMode, WriteOptions,
};
