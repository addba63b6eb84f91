//! Partition keys for by-date tables.
//!
//! Materialized tables are physically partitioned by `year_month` (`YYYY-MM`)
//! and logically filtered by the entity date.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Name of the physical partition column.
pub const YEAR_MONTH_COLUMN: &str = "year_month";

/// A calendar month, formatted `YYYY-MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct YearMonth {
    year: i32,
    month: u32,
}

impl YearMonth {
    /// Creates a year-month.
    ///
    /// # Errors
    ///
    /// Returns an error if `month` is not in `1..=12` or `year` is outside
    /// `0..=9999`.
    pub fn new(year: i32, month: u32) -> Result<Self> {
        if !(1..=12).contains(&month) {
            return Err(Error::InvalidInput(format!("month out of range: {month}")));
        }
        if !(0..=9999).contains(&year) {
            return Err(Error::InvalidInput(format!("year out of range: {year}")));
        }
        Ok(Self { year, month })
    }

    /// Returns the month containing `date`.
    #[must_use]
    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    /// Returns the year.
    #[must_use]
    pub fn year(self) -> i32 {
        self.year
    }

    /// Returns the month (1-12).
    #[must_use]
    pub fn month(self) -> u32 {
        self.month
    }

    /// Returns the first day of the month.
    #[must_use]
    pub fn first_day(self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or(NaiveDate::MIN)
    }

    /// Returns the month before this one.
    #[must_use]
    pub fn previous(self) -> Self {
        if self.month == 1 {
            Self {
                year: self.year - 1,
                month: 12,
            }
        } else {
            Self {
                year: self.year,
                month: self.month - 1,
            }
        }
    }

    /// Returns true if `date` falls in this month.
    #[must_use]
    pub fn contains(self, date: NaiveDate) -> bool {
        date.year() == self.year && date.month() == self.month
    }

    /// Returns the partition directory segment, e.g. `year_month=2025-01`.
    #[must_use]
    pub fn partition_dir(self) -> String {
        format!("{YEAR_MONTH_COLUMN}={self}")
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for YearMonth {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidInput(format!("invalid year-month (expected YYYY-MM): {s}"));
        let (year, month) = s.trim().split_once('-').ok_or_else(invalid)?;
        if year.len() != 4 || month.len() != 2 {
            return Err(invalid());
        }
        let year = year.parse::<i32>().map_err(|_| invalid())?;
        let month = month.parse::<u32>().map_err(|_| invalid())?;
        Self::new(year, month)
    }
}

impl TryFrom<String> for YearMonth {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<YearMonth> for String {
    fn from(value: YearMonth) -> Self {
        value.to_string()
    }
}

/// `(year_month, entity_date)` for one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionKey {
    /// Physical partition.
    pub year_month: YearMonth,
    /// Logical date.
    pub entity_date: NaiveDate,
}

impl PartitionKey {
    /// Derives the key for a date.
    #[must_use]
    pub fn for_date(entity_date: NaiveDate) -> Self {
        Self {
            year_month: YearMonth::from_date(entity_date),
            entity_date,
        }
    }
}

/// Which partitions a materialization rewrites.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PartitionScope {
    /// Overwrite the whole table.
    #[default]
    All,
    /// Overwrite only these months; others are left untouched.
    Months(BTreeSet<YearMonth>),
}

impl PartitionScope {
    /// Scope of a single month.
    #[must_use]
    pub fn month(month: YearMonth) -> Self {
        Self::Months(BTreeSet::from([month]))
    }

    /// The `months` most recent months ending with the month containing `end`.
    ///
    /// `months == 0` is treated as 1.
    #[must_use]
    pub fn trailing(end: NaiveDate, months: u32) -> Self {
        let mut current = YearMonth::from_date(end);
        let mut set = BTreeSet::new();
        for _ in 0..months.max(1) {
            set.insert(current);
            current = current.previous();
        }
        Self::Months(set)
    }

    /// Returns true if the scope includes `month`.
    #[must_use]
    pub fn includes(&self, month: YearMonth) -> bool {
        match self {
            Self::All => true,
            Self::Months(set) => set.contains(&month),
        }
    }

    /// Returns true if the scope includes the month of `date`.
    #[must_use]
    pub fn includes_date(&self, date: NaiveDate) -> bool {
        self.includes(YearMonth::from_date(date))
    }

    /// Returns the scoped months, or `None` for [`PartitionScope::All`].
    #[must_use]
    pub fn months(&self) -> Option<&BTreeSet<YearMonth>> {
        match self {
            Self::All => None,
            Self::Months(set) => Some(set),
        }
    }
}

impl fmt::Display for PartitionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::Months(set) => {
                let months: Vec<String> = set.iter().map(ToString::to_string).collect();
                write!(f, "{YEAR_MONTH_COLUMN} IN ({})", months.join(", "))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    #[test]
    fn year_month_parses_and_formats() {
        let ym: YearMonth = "2025-01".parse().expect("parse");
        assert_eq!(ym.to_string(), "2025-01");
        assert_eq!(ym.partition_dir(), "year_month=2025-01");
        assert_eq!(ym.first_day(), date(2025, 1, 1));

        assert!("2025-13".parse::<YearMonth>().is_err());
        assert!("2025-1".parse::<YearMonth>().is_err());
        assert!("202501".parse::<YearMonth>().is_err());
    }

    #[test]
    fn year_month_serde_is_string() {
        let ym = YearMonth::new(2024, 12).expect("valid");
        let json = serde_json::to_string(&ym).expect("serialize");
        assert_eq!(json, "\"2024-12\"");
        let back: YearMonth = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, ym);
    }

    #[test]
    fn previous_wraps_year() {
        let jan = YearMonth::new(2025, 1).expect("valid");
        assert_eq!(jan.previous().to_string(), "2024-12");
    }

    #[test]
    fn trailing_scope_covers_window() {
        let scope = PartitionScope::trailing(date(2025, 2, 10), 3);
        let months: Vec<String> = scope
            .months()
            .expect("scoped")
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(months, vec!["2024-12", "2025-01", "2025-02"]);
        assert!(scope.includes_date(date(2025, 1, 15)));
        assert!(!scope.includes_date(date(2024, 11, 30)));
        assert_eq!(
            scope.to_string(),
            "year_month IN (2024-12, 2025-01, 2025-02)"
        );
    }

    #[test]
    fn all_scope_includes_everything() {
        assert!(PartitionScope::All.includes_date(date(1999, 1, 1)));
        assert!(PartitionScope::All.months().is_none());
    }

    #[test]
    fn partition_key_for_date() {
        let key = PartitionKey::for_date(date(2025, 1, 15));
        assert_eq!(key.year_month.to_string(), "2025-01");
    }
}
