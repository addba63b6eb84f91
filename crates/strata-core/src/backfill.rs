//! Backfill window policy.
//!
//! The window's start is the configured override clamped up to
//! [`BACKFILL_FLOOR`]; the end is always open. The window is resolved once at
//! startup (as part of [`crate::config::PipelineConfig`]) and shared by
//! ingestion, materialization, and reconciliation.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Earliest date any layer may retain.
pub const BACKFILL_FLOOR: NaiveDate = match NaiveDate::from_ymd_opt(2016, 1, 1) {
    Some(date) => date,
    None => NaiveDate::MIN,
};

/// Effective cutoff window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillWindow {
    /// Rows strictly before this date are dropped.
    pub start: NaiveDate,
    /// Always `None`: forward-looking jobs have no upper bound.
    pub end: Option<NaiveDate>,
}

impl Default for BackfillWindow {
    fn default() -> Self {
        BackfillPolicy::default().window()
    }
}

impl BackfillWindow {
    /// Returns true if a row dated `date` is retained.
    #[must_use]
    pub fn admits(&self, date: NaiveDate) -> bool {
        date >= self.start && self.end.is_none_or(|end| date <= end)
    }
}

/// Resolved backfill configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillPolicy {
    start: NaiveDate,
    requested_start: Option<NaiveDate>,
    requested_end: Option<NaiveDate>,
}

impl Default for BackfillPolicy {
    fn default() -> Self {
        Self::resolve(None, None)
    }
}

impl BackfillPolicy {
    /// Resolves the policy from optional start and end overrides.
    ///
    /// A start before [`BACKFILL_FLOOR`] is clamped to the floor with a
    /// warning. A configured end is recorded but does not bound the window.
    #[must_use]
    pub fn resolve(start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
        let effective = match start {
            Some(requested) if requested < BACKFILL_FLOOR => {
                tracing::warn!(
                    requested = %requested,
                    floor = %BACKFILL_FLOOR,
                    "backfill start predates the supported floor; clamping"
                );
                BACKFILL_FLOOR
            }
            Some(requested) => requested,
            None => BACKFILL_FLOOR,
        };

        if let Some(end) = end {
            tracing::debug!(end = %end, "backfill end is configured but the window stays open-ended");
        }

        Self {
            start: effective,
            requested_start: start,
            requested_end: end,
        }
    }

    /// Returns the effective window.
    #[must_use]
    pub fn window(&self) -> BackfillWindow {
        BackfillWindow {
            start: self.start,
            end: None,
        }
    }

    /// Returns the effective start date.
    #[must_use]
    pub fn start(&self) -> NaiveDate {
        self.start
    }

    /// Returns the start override as configured, before clamping.
    #[must_use]
    pub fn requested_start(&self) -> Option<NaiveDate> {
        self.requested_start
    }

    /// Returns the configured end, which the window ignores.
    #[must_use]
    pub fn requested_end(&self) -> Option<NaiveDate> {
        self.requested_end
    }

    /// Returns true if the configured start was raised to the floor.
    #[must_use]
    pub fn was_clamped(&self) -> bool {
        self.requested_start.is_some_and(|s| s < BACKFILL_FLOOR)
    }
}
