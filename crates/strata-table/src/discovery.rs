//! Entity discovery.
//!
//! An entity exists under a root when `{root}/{entity}/_delta_log/` holds at
//! least one commit. Directories without a log (partial writes, stray files)
//! are not entities.

use std::collections::BTreeSet;

use strata_core::storage::StorageBackend;

use crate::error::Result;
use crate::log::{LOG_DIR, parse_commit_file};

/// Returns the table root for `entity` under `root`.
#[must_use]
pub fn entity_table_root(root: &str, entity: &str) -> String {
    let root = root.trim_end_matches('/');
    if root.is_empty() {
        entity.to_string()
    } else {
        format!("{root}/{entity}")
    }
}

/// Lists the entities with a committed table under `root`.
///
/// # Errors
///
/// Returns an error if the listing fails.
pub async fn discover_entities<S>(storage: &S, root: &str) -> Result<BTreeSet<String>>
where
    S: StorageBackend + ?Sized,
{
    let root = root.trim_end_matches('/');
    let prefix = if root.is_empty() {
        String::new()
    } else {
        format!("{root}/")
    };

    let entities = storage
        .list(&prefix)
        .await?
        .into_iter()
        .filter_map(|meta| {
            let relative = meta.path.strip_prefix(&prefix)?;
            let mut segments = relative.split('/');
            let entity = segments.next()?;
            let log_dir = segments.next()?;
            let file = segments.next()?;
            (log_dir == LOG_DIR && segments.next().is_none() && parse_commit_file(file).is_some())
                .then(|| entity.to_string())
        })
        .collect();
    Ok(entities)
}
