//! Run checkpoints.
//!
//! One document per job records when the job last completed without failures.
//! The change tracker uses it to reprocess sources modified after that point
//! even when their signature was recorded by a run that later failed.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strata_core::{StorageBackend, read_json, write_json};

use crate::error::{Result, validate_key};

/// Prefix for checkpoint documents.
pub const CHECKPOINT_PREFIX: &str = "state/checkpoints";

/// Returns the storage path of a job's checkpoint.
#[must_use]
pub fn checkpoint_path(job: &str) -> String {
    format!("{CHECKPOINT_PREFIX}/{job}.json")
}

/// Last successful run of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunCheckpoint {
    /// When the last fully successful run started.
    pub last_success: DateTime<Utc>,
    /// When the checkpoint was written.
    pub updated_at: DateTime<Utc>,
    /// Free-form run details (counts, execution id).
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl RunCheckpoint {
    /// Creates a checkpoint for a run that succeeded at `last_success`.
    #[must_use]
    pub fn new(last_success: DateTime<Utc>) -> Self {
        Self {
            last_success,
            updated_at: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Loads and saves run checkpoints.
#[derive(Clone)]
pub struct CheckpointStore {
    storage: Arc<dyn StorageBackend>,
}

impl std::fmt::Debug for CheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointStore").finish_non_exhaustive()
    }
}

impl CheckpointStore {
    /// Creates a store over `storage`.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Loads a job's checkpoint, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid or the read fails.
    pub async fn load(&self, job: &str) -> Result<Option<RunCheckpoint>> {
        validate_key(job)?;
        Ok(read_json(self.storage.as_ref(), &checkpoint_path(job)).await?)
    }

    /// Returns the last success time of a job, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid or the read fails.
    pub async fn last_success(&self, job: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.load(job).await?.map(|c| c.last_success))
    }

    /// Writes a job's checkpoint (last write wins).
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid or the write fails.
    pub async fn save(&self, job: &str, checkpoint: &RunCheckpoint) -> Result<()> {
        validate_key(job)?;
        write_json(self.storage.as_ref(), &checkpoint_path(job), checkpoint).await?;
        tracing::info!(job, last_success = %checkpoint.last_success, "checkpoint advanced");
        Ok(())
    }
}
