//! Commit log.
//!
//! Each table keeps an append-only log of JSON commits:
//!
//! ```text
//! {root}/_delta_log/00000000000000000000.json
//! {root}/_delta_log/00000000000000000001.json
//! ```
//!
//! A commit lists the data files it adds and removes plus the table schema
//! and partition columns as of that commit. Commits are written with a
//! `DoesNotExist` precondition, so two writers racing for the same version
//! conflict instead of overwriting each other. Replaying every commit in
//! version order yields the live file set.

use std::collections::BTreeMap;
use std::sync::Arc;

use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TableError};

/// Directory holding commit log entries, relative to the table root.
pub const LOG_DIR: &str = "_delta_log";

/// Returns the log entry name for `version`, relative to the table root.
#[must_use]
pub fn commit_file(version: u64) -> String {
    format!("{LOG_DIR}/{version:020}.json")
}

/// Parses the version from a log entry name (`…/00000000000000000007.json`).
#[must_use]
pub fn parse_commit_file(path: &str) -> Option<u64> {
    let name = path.rsplit('/').next()?;
    let stem = name.strip_suffix(".json")?;
    if stem.len() != 20 || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

/// A data file added to the table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddFile {
    /// Path relative to the table root.
    pub path: String,
    /// Partition column values for every row in the file.
    #[serde(default)]
    pub partition_values: BTreeMap<String, String>,
    /// File size in bytes.
    pub size: u64,
    /// Number of rows.
    pub num_rows: u64,
    /// When the file was written.
    pub modification_time: DateTime<Utc>,
}

/// A data file removed from the table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveFile {
    /// Path relative to the table root.
    pub path: String,
    /// When the file was removed.
    pub deletion_time: DateTime<Utc>,
}

/// One commit log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Commit {
    /// Version of this commit.
    pub version: u64,
    /// When the commit was created.
    pub timestamp: DateTime<Utc>,
    /// Operation label (`WRITE`, `OVERWRITE`, ...).
    pub operation: String,
    /// Predicate of a predicate-scoped overwrite.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicate: Option<String>,
    /// Table schema after this commit.
    pub schema: SchemaDef,
    /// Partition columns after this commit.
    #[serde(default)]
    pub partition_columns: Vec<String>,
    /// Files added.
    #[serde(default)]
    pub add: Vec<AddFile>,
    /// Files removed.
    #[serde(default)]
    pub remove: Vec<RemoveFile>,
}

/// Serializable table schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDef {
    /// Columns in order.
    pub fields: Vec<FieldDef>,
}

/// Serializable column definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    /// Column name.
    pub name: String,
    /// Type name, e.g. `utf8`, `float64`, `date32`, `timestamp[us, UTC]`.
    #[serde(rename = "type")]
    pub data_type: String,
    /// Whether the column accepts nulls.
    pub nullable: bool,
}

impl SchemaDef {
    /// Converts an Arrow schema.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::InvalidFrame`] for column types tables do not
    /// support.
    pub fn from_arrow(schema: &Schema) -> Result<Self> {
        let fields = schema
            .fields()
            .iter()
            .map(|f| {
                Ok(FieldDef {
                    name: f.name().clone(),
                    data_type: type_name(f.data_type()).ok_or_else(|| {
                        TableError::InvalidFrame(format!(
                            "column {} has unsupported type {}",
                            f.name(),
                            f.data_type()
                        ))
                    })?,
                    nullable: f.is_nullable(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { fields })
    }

    /// Converts back to an Arrow schema.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first unknown type.
    pub fn to_arrow(&self) -> std::result::Result<SchemaRef, String> {
        let fields = self
            .fields
            .iter()
            .map(|f| {
                parse_type(&f.data_type)
                    .map(|t| Field::new(&f.name, t, f.nullable))
                    .ok_or_else(|| format!("unknown type {} for column {}", f.data_type, f.name))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Arc::new(Schema::new(fields)))
    }
}

fn unit_name(unit: TimeUnit) -> &'static str {
    match unit {
        TimeUnit::Second => "s",
        TimeUnit::Millisecond => "ms",
        TimeUnit::Microsecond => "us",
        TimeUnit::Nanosecond => "ns",
    }
}

fn type_name(data_type: &DataType) -> Option<String> {
    let name = match data_type {
        DataType::Boolean => "boolean",
        DataType::Int8 => "int8",
        DataType::Int16 => "int16",
        DataType::Int32 => "int32",
        DataType::Int64 => "int64",
        DataType::UInt8 => "uint8",
        DataType::UInt16 => "uint16",
        DataType::UInt32 => "uint32",
        DataType::UInt64 => "uint64",
        DataType::Float32 => "float32",
        DataType::Float64 => "float64",
        DataType::Utf8 => "utf8",
        DataType::LargeUtf8 => "large_utf8",
        DataType::Date32 => "date32",
        DataType::Date64 => "date64",
        DataType::Timestamp(unit, None) => return Some(format!("timestamp[{}]", unit_name(*unit))),
        DataType::Timestamp(unit, Some(tz)) => {
            return Some(format!("timestamp[{}, {tz}]", unit_name(*unit)));
        }
        _ => return None,
    };
    Some(name.to_string())
}

fn parse_type(name: &str) -> Option<DataType> {
    let data_type = match name {
        "boolean" => DataType::Boolean,
        "int8" => DataType::Int8,
        "int16" => DataType::Int16,
        "int32" => DataType::Int32,
        "int64" => DataType::Int64,
        "uint8" => DataType::UInt8,
        "uint16" => DataType::UInt16,
        "uint32" => DataType::UInt32,
        "uint64" => DataType::UInt64,
        "float32" => DataType::Float32,
        "float64" => DataType::Float64,
        "utf8" => DataType::Utf8,
        "large_utf8" => DataType::LargeUtf8,
        "date32" => DataType::Date32,
        "date64" => DataType::Date64,
        other => {
            let inner = other.strip_prefix("timestamp[")?.strip_suffix(']')?;
            let (unit, tz) = match inner.split_once(", ") {
                Some((unit, tz)) => (unit, Some(tz)),
                None => (inner, None),
            };
            let unit = match unit {
                "s" => TimeUnit::Second,
                "ms" => TimeUnit::Millisecond,
                "us" => TimeUnit::Microsecond,
                "ns" => TimeUnit::Nanosecond,
                _ => return None,
            };
            DataType::Timestamp(unit, tz.map(Into::into))
        }
    };
    Some(data_type)
}
