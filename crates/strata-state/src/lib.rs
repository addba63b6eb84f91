//! # strata-state
//!
//! Small JSON state documents that make strata jobs incremental.
//!
//! - **Signatures**: etag / modification-time identity of a source object
//! - **Watermarks**: last processed signature per source key, one document
//!   per collection, written once per run and only when changed
//! - **Checkpoints**: last fully successful run per job
//! - **Change tracking**: the per-object process-or-skip decision
//! - **Blacklist**: entities the provider reported as permanently absent
//!
//! Documents are read once at job start and written once at job end. They
//! carry no locking of their own; callers serialize runs with a
//! `strata_core::LeaseLock`.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod blacklist;
pub mod checkpoint;
pub mod error;
pub mod signature;
pub mod tracker;
pub mod watermark;

pub use blacklist::{BlacklistEntry, BlacklistStore, EntityBlacklist};
pub use checkpoint::{CheckpointStore, RunCheckpoint};
pub use error::{Result, StateError};
pub use signature::Signature;
pub use tracker::{ChangeDecision, ChangeTracker, classify, should_process};
pub use watermark::{WatermarkDocument, WatermarkEntry, WatermarkStore, Watermarks};
