//! Incremental change tracker.
//!
//! Decides per source object whether it needs processing:
//!
//! 1. forced reprocessing always processes
//! 2. no prior signature: first sight, process
//! 3. signature differs from the prior one: process
//! 4. signature unchanged but the object was modified strictly after the last
//!    successful run: process (a previous run saw it and then failed)
//! 5. otherwise skip

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::signature::Signature;

/// Why an object is or is not processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeDecision {
    /// Reprocessing was forced.
    Forced,
    /// No prior signature.
    FirstSight,
    /// The signature changed.
    SignatureChanged,
    /// Unchanged signature, but modified after the last successful run.
    ModifiedSinceLastSuccess,
    /// Nothing to do.
    Unchanged,
}

impl ChangeDecision {
    /// Returns true unless the decision is [`ChangeDecision::Unchanged`].
    #[must_use]
    pub fn requires_processing(self) -> bool {
        !matches!(self, Self::Unchanged)
    }

    /// Returns a short label for logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Forced => "forced",
            Self::FirstSight => "first_sight",
            Self::SignatureChanged => "signature_changed",
            Self::ModifiedSinceLastSuccess => "modified_since_last_success",
            Self::Unchanged => "unchanged",
        }
    }
}

/// Classifies one object.
#[must_use]
pub fn classify(
    current: &Signature,
    prior: Option<&Signature>,
    last_success: Option<DateTime<Utc>>,
    force: bool,
) -> ChangeDecision {
    if force {
        return ChangeDecision::Forced;
    }
    let Some(prior) = prior else {
        return ChangeDecision::FirstSight;
    };
    if !current.matches(prior) {
        return ChangeDecision::SignatureChanged;
    }
    match (last_success, current.last_modified) {
        (Some(success), Some(modified)) if modified > success => {
            ChangeDecision::ModifiedSinceLastSuccess
        }
        _ => ChangeDecision::Unchanged,
    }
}

/// Boolean form of [`classify`].
#[must_use]
pub fn should_process(
    current: &Signature,
    prior: Option<&Signature>,
    last_success: Option<DateTime<Utc>>,
    force: bool,
) -> bool {
    classify(current, prior, last_success, force).requires_processing()
}

/// Per-run tracker holding the run-wide inputs.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChangeTracker {
    last_success: Option<DateTime<Utc>>,
    force: bool,
}

impl ChangeTracker {
    /// Creates a tracker.
    #[must_use]
    pub fn new(last_success: Option<DateTime<Utc>>, force: bool) -> Self {
        Self {
            last_success,
            force,
        }
    }

    /// Classifies one object against its prior signature.
    #[must_use]
    pub fn should_process(&self, current: &Signature, prior: Option<&Signature>) -> ChangeDecision {
        classify(current, prior, self.last_success, self.force)
    }

    /// Returns the last successful run time.
    #[must_use]
    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        self.last_success
    }

    /// Returns true if reprocessing is forced.
    #[must_use]
    pub fn is_forced(&self) -> bool {
        self.force
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().expect("timestamp")
    }

    fn sig(etag: &str, secs: i64) -> Signature {
        Signature::new(Some(etag.to_string()), Some(at(secs)))
    }

    #[test]
    fn force_wins() {
        let s = sig("e", 1);
        assert_eq!(classify(&s, Some(&s), None, true), ChangeDecision::Forced);
    }

    #[test]
    fn first_sight() {
        assert_eq!(
            classify(&sig("e", 1), None, None, false),
            ChangeDecision::FirstSight
        );
    }

    #[test]
    fn changed_signature() {
        assert_eq!(
            classify(&sig("e2", 2), Some(&sig("e1", 1)), None, false),
            ChangeDecision::SignatureChanged
        );
    }

    #[test]
    fn modified_after_last_success() {
        let s = sig("e", 100);
        assert_eq!(
            classify(&s, Some(&s), Some(at(50)), false),
            ChangeDecision::ModifiedSinceLastSuccess
        );
        // Equal times are not strictly after.
        assert_eq!(
            classify(&s, Some(&s), Some(at(100)), false),
            ChangeDecision::Unchanged
        );
    }

    #[test]
    fn unchanged_skips() {
        let s = sig("e", 10);
        let decision = ChangeTracker::new(Some(at(20)), false).should_process(&s, Some(&s));
        assert_eq!(decision, ChangeDecision::Unchanged);
        assert!(!decision.requires_processing());
    }

    proptest! {
        #[test]
        fn unchanged_is_idempotent(
            etag in "[a-f0-9]{1,16}",
            modified in 0i64..1_000_000,
            success_offset in 0i64..1_000_000,
        ) {
            let current = sig(&etag, modified);
            let last_success = Some(at(modified + success_offset));
            let first = should_process(&current, Some(&current), last_success, false);
            let second = should_process(&current, Some(&current), last_success, false);
            prop_assert!(!first);
            prop_assert_eq!(first, second);
        }
    }
}
