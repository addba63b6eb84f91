//! # strata-core
//!
//! Shared primitives for the strata pipeline, a fleet of independently
//! scheduled jobs that incrementally mutate partitioned tables on shared
//! object storage.
//!
//! - **Storage**: the [`StorageBackend`] contract, an in-memory backend for
//!   tests, an `object_store`-backed backend, and tenant scoping
//! - **Leases**: a CAS lease store and the [`LeaseLock`] built on it, with
//!   background renewal and fail-fast lease loss
//! - **Backfill policy**: the floor-clamped, open-ended cutoff window
//! - **Partitions**: `YYYY-MM` partition keys and materialization scopes
//! - **Configuration**: [`PipelineConfig`], read once from the environment
//! - **Observability**: logging setup, span helpers, and lease metrics
//!
//! ## Example
//!
//! ```rust
//! use strata_core::prelude::*;
//!
//! let config = PipelineConfig::from_lookup(|_| None);
//! assert_eq!(config.tenant.as_str(), "default");
//! assert_eq!(config.backfill.window().end, None);
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod backfill;
pub mod config;
pub mod error;
pub mod lease;
pub mod lock;
pub mod metrics;
pub mod object_store_backend;
pub mod observability;
pub mod partition;
pub mod scoped_storage;
pub mod storage;
pub mod tenant;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::backfill::{BACKFILL_FLOOR, BackfillPolicy, BackfillWindow};
    pub use crate::config::{GatewaySettings, PipelineConfig, TriggerSettings};
    pub use crate::error::{Error, Result};
    pub use crate::lease::{LeaseStore, ObjectLeaseStore};
    pub use crate::lock::{LeaseHandle, LeaseLock, LockError, WaitPolicy};
    pub use crate::object_store_backend::ObjectStoreBackend;
    pub use crate::partition::{PartitionKey, PartitionScope, YearMonth};
    pub use crate::scoped_storage::ScopedStorage;
    pub use crate::storage::{
        MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult,
    };
    pub use crate::tenant::TenantId;
}

// Crate-root re-exports
pub use backfill::{BACKFILL_FLOOR, BackfillPolicy, BackfillWindow};
pub use config::{
    GatewaySettings, PipelineConfig, ReadinessSettings, TriggerSettings, WarmupSettings,
};
pub use error::{Error, Result};
pub use lease::{LeaseGrant, LeaseRecord, LeaseStore, LeaseStoreError, ObjectLeaseStore};
pub use lock::{
    LEASE_LOST_EXIT_CODE, LeaseHandle, LeaseLock, LeaseLossHandler, LeaseLost, LockError,
    LockOptions, WaitPolicy,
};
pub use object_store_backend::ObjectStoreBackend;
pub use observability::{LogFormat, Redacted, init_logging};
pub use partition::{PartitionKey, PartitionScope, YearMonth};
pub use scoped_storage::ScopedStorage;
pub use storage::{
    MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult, read_json,
    write_json,
};
pub use tenant::TenantId;
