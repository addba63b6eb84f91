//! Partition predicates for pruned reads and scoped overwrites.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use strata_core::partition::{PartitionScope, YEAR_MONTH_COLUMN};

/// A predicate over one partition column's string value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    /// `column IN (values)`.
    In {
        /// Partition column.
        column: String,
        /// Accepted values.
        values: BTreeSet<String>,
    },
    /// `column BETWEEN low AND high`, inclusive, compared as strings.
    Between {
        /// Partition column.
        column: String,
        /// Lower bound.
        low: String,
        /// Upper bound.
        high: String,
    },
}

impl Predicate {
    /// `column IN (values)`.
    pub fn is_in<I, S>(column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::In {
            column: column.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// `column BETWEEN low AND high`.
    pub fn between(
        column: impl Into<String>,
        low: impl Into<String>,
        high: impl Into<String>,
    ) -> Self {
        Self::Between {
            column: column.into(),
            low: low.into(),
            high: high.into(),
        }
    }

    /// The `year_month IN (...)` predicate for a scope, or `None` for all.
    #[must_use]
    pub fn for_scope(scope: &PartitionScope) -> Option<Self> {
        scope
            .months()
            .map(|months| Self::is_in(YEAR_MONTH_COLUMN, months.iter().map(ToString::to_string)))
    }

    /// Returns the partition column the predicate reads.
    #[must_use]
    pub fn column(&self) -> &str {
        match self {
            Self::In { column, .. } | Self::Between { column, .. } => column,
        }
    }

    /// Evaluates the predicate against one value.
    #[must_use]
    pub fn matches_value(&self, value: &str) -> bool {
        match self {
            Self::In { values, .. } => values.contains(value),
            Self::Between { low, high, .. } => low.as_str() <= value && value <= high.as_str(),
        }
    }

    /// Evaluates the predicate against a file's partition values.
    ///
    /// A file without the column does not match.
    #[must_use]
    pub fn matches(&self, partition_values: &BTreeMap<String, String>) -> bool {
        partition_values
            .get(self.column())
            .is_some_and(|v| self.matches_value(v))
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::In { column, values } => {
                let quoted: Vec<String> = values.iter().map(|v| format!("'{v}'")).collect();
                write!(f, "{column} IN ({})", quoted.join(", "))
            }
            Self::Between { column, low, high } => {
                write!(f, "{column} BETWEEN '{low}' AND '{high}'")
            }
        }
    }
}
