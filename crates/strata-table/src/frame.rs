//! Frame helpers over Arrow record batches.
//!
//! The materializer and reconciler shape per-entity tables with these before
//! writing: column-name normalization, date coercion, the backfill cutoff,
//! month filtering, `(date, entity)` deduplication, and schema-unioning
//! concatenation.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, AsArray, BooleanArray, Date32Array, StringArray, UInt32Array,
    new_null_array,
};
use arrow::compute::{
    CastOptions, SortColumn, cast, cast_with_options, concat_batches, filter_record_batch,
    lexsort_to_indices, take_record_batch,
};
use arrow::datatypes::{DataType, Date32Type, Field, FieldRef, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use arrow::row::{OwnedRow, RowConverter, SortField};
use chrono::NaiveDate;
use strata_core::partition::{YEAR_MONTH_COLUMN, YearMonth};

use crate::error::{Result, TableError};

/// Normalizes a column name: trimmed, lowercase, spaces replaced by `_`.
#[must_use]
pub fn normalize_name(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

/// Renames every column with [`normalize_name`].
///
/// # Errors
///
/// Returns [`TableError::InvalidFrame`] if two columns normalize to the same name.
pub fn normalize_column_names(batch: &RecordBatch) -> Result<RecordBatch> {
    let mut seen = BTreeSet::new();
    let mut fields: Vec<FieldRef> = Vec::with_capacity(batch.num_columns());
    for field in batch.schema().fields() {
        let name = normalize_name(field.name());
        if !seen.insert(name.clone()) {
            return Err(TableError::InvalidFrame(format!(
                "columns collide after normalization: {name}"
            )));
        }
        fields.push(Arc::new(field.as_ref().clone().with_name(name)));
    }
    let schema = Schema::new(fields).with_metadata(batch.schema().metadata().clone());
    RecordBatch::try_new(Arc::new(schema), batch.columns().to_vec())
        .map_err(|e| TableError::arrow("rename columns", &e))
}

/// Parses the leading `YYYY-MM-DD` of a date or timestamp string.
#[must_use]
pub fn parse_date_str(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    let head = value.get(..10)?;
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

fn column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a ArrayRef> {
    batch
        .column_by_name(name)
        .ok_or_else(|| TableError::InvalidFrame(format!("missing column {name}")))
}

/// Reads a date-like column as calendar dates.
///
/// Accepts `Date32`, `Date64`, timestamps (timezone dropped), and `YYYY-MM-DD`
/// strings. Unparseable strings read as `None`.
///
/// # Errors
///
/// Returns an error if the column is missing or not date-like.
pub fn date_values(batch: &RecordBatch, name: &str) -> Result<Vec<Option<NaiveDate>>> {
    let array = column(batch, name)?;
    array_dates(array, name)
}

fn array_dates(array: &ArrayRef, name: &str) -> Result<Vec<Option<NaiveDate>>> {
    match array.data_type() {
        DataType::Date32 => Ok(array
            .as_primitive::<Date32Type>()
            .iter()
            .map(|v| v.map(Date32Type::to_naive_date))
            .collect()),
        DataType::Utf8 => Ok(array
            .as_string::<i32>()
            .iter()
            .map(|v| v.and_then(parse_date_str))
            .collect()),
        DataType::LargeUtf8 => Ok(array
            .as_string::<i64>()
            .iter()
            .map(|v| v.and_then(parse_date_str))
            .collect()),
        DataType::Date64 | DataType::Timestamp(_, _) => {
            let naive = match array.data_type() {
                DataType::Timestamp(unit, Some(_)) => {
                    cast(array, &DataType::Timestamp(*unit, None))
                        .map_err(|e| TableError::arrow("drop timezone", &e))?
                }
                _ => Arc::clone(array),
            };
            let dates = cast(&naive, &DataType::Date32)
                .map_err(|e| TableError::arrow("cast to date", &e))?;
            array_dates(&dates, name)
        }
        other => Err(TableError::InvalidFrame(format!(
            "column {name} is not date-like ({other})"
        ))),
    }
}

fn replace_column(
    batch: &RecordBatch,
    name: &str,
    field: Field,
    array: ArrayRef,
) -> Result<RecordBatch> {
    let schema = batch.schema();
    let mut fields: Vec<FieldRef> = schema.fields().iter().cloned().collect();
    let mut columns = batch.columns().to_vec();
    match schema.index_of(name) {
        Ok(idx) => {
            fields[idx] = Arc::new(field);
            columns[idx] = array;
        }
        Err(_) => {
            fields.push(Arc::new(field));
            columns.push(array);
        }
    }
    let schema = Schema::new(fields).with_metadata(schema.metadata().clone());
    RecordBatch::try_new(Arc::new(schema), columns)
        .map_err(|e| TableError::arrow("replace column", &e))
}

fn keep_rows(batch: &RecordBatch, mask: Vec<bool>) -> Result<RecordBatch> {
    if mask.iter().all(|keep| *keep) {
        return Ok(batch.clone());
    }
    filter_record_batch(batch, &BooleanArray::from(mask))
        .map_err(|e| TableError::arrow("filter rows", &e))
}

/// Converts a date-like column to `Date32` and drops rows without a valid date.
///
/// Returns the coerced batch and the number of rows dropped.
///
/// # Errors
///
/// Returns an error if the column is missing or not date-like.
pub fn coerce_date_column(batch: &RecordBatch, name: &str) -> Result<(RecordBatch, usize)> {
    let dates = date_values(batch, name)?;
    let array: Date32Array = dates
        .iter()
        .map(|d| d.map(Date32Type::from_naive_date))
        .collect();
    let coerced = replace_column(
        batch,
        name,
        Field::new(name, DataType::Date32, true),
        Arc::new(array),
    )?;
    let mask: Vec<bool> = dates.iter().map(Option::is_some).collect();
    let dropped = mask.iter().filter(|keep| !**keep).count();
    Ok((keep_rows(&coerced, mask)?, dropped))
}

/// Drops rows dated strictly before `start`. Rows without a date are kept.
///
/// Returns the filtered batch and the number of rows dropped.
///
/// # Errors
///
/// Returns an error if the column is missing or not date-like.
pub fn apply_cutoff(
    batch: &RecordBatch,
    date_column: &str,
    start: NaiveDate,
) -> Result<(RecordBatch, usize)> {
    let mask: Vec<bool> = date_values(batch, date_column)?
        .into_iter()
        .map(|d| d.is_none_or(|d| d >= start))
        .collect();
    let dropped = mask.iter().filter(|keep| !**keep).count();
    Ok((keep_rows(batch, mask)?, dropped))
}

/// Keeps rows whose date falls in one of `months`.
///
/// # Errors
///
/// Returns an error if the column is missing or not date-like.
pub fn filter_months(
    batch: &RecordBatch,
    date_column: &str,
    months: &BTreeSet<YearMonth>,
) -> Result<RecordBatch> {
    let mask = date_values(batch, date_column)?
        .into_iter()
        .map(|d| d.is_some_and(|d| months.contains(&YearMonth::from_date(d))))
        .collect();
    keep_rows(batch, mask)
}

/// Adds (or replaces) the `year_month` column derived from `date_column`.
///
/// # Errors
///
/// Returns an error if the column is missing or not date-like.
pub fn with_year_month(batch: &RecordBatch, date_column: &str) -> Result<RecordBatch> {
    let values: StringArray = date_values(batch, date_column)?
        .into_iter()
        .map(|d| d.map(|d| YearMonth::from_date(d).to_string()))
        .collect();
    replace_column(
        batch,
        YEAR_MONTH_COLUMN,
        Field::new(YEAR_MONTH_COLUMN, DataType::Utf8, true),
        Arc::new(values),
    )
}

/// Adds a constant string column when `name` is absent.
///
/// # Errors
///
/// Returns an error if the batch cannot be rebuilt.
pub fn ensure_constant_column(batch: &RecordBatch, name: &str, value: &str) -> Result<RecordBatch> {
    if batch.schema().index_of(name).is_ok() {
        return Ok(batch.clone());
    }
    let array = StringArray::from(vec![value; batch.num_rows()]);
    replace_column(
        batch,
        name,
        Field::new(name, DataType::Utf8, true),
        Arc::new(array),
    )
}

fn key_columns(batch: &RecordBatch, keys: &[&str]) -> Result<Vec<ArrayRef>> {
    keys.iter()
        .map(|k| column(batch, k).cloned())
        .collect()
}

/// Deduplicates on `keys`, keeping the last occurrence of each key.
///
/// Surviving rows keep their relative order.
///
/// # Errors
///
/// Returns an error if a key column is missing.
pub fn dedupe_keep_last(batch: &RecordBatch, keys: &[&str]) -> Result<RecordBatch> {
    if batch.num_rows() == 0 {
        return Ok(batch.clone());
    }
    let columns = key_columns(batch, keys)?;
    let fields = columns
        .iter()
        .map(|c| SortField::new(c.data_type().clone()))
        .collect();
    let converter = RowConverter::new(fields).map_err(|e| TableError::arrow("row converter", &e))?;
    let rows = converter
        .convert_columns(&columns)
        .map_err(|e| TableError::arrow("convert key rows", &e))?;

    let mut last: HashMap<OwnedRow, u32> = HashMap::with_capacity(batch.num_rows());
    for (idx, row) in (0u32..).zip(rows.iter()) {
        last.insert(row.owned(), idx);
    }
    if last.len() == batch.num_rows() {
        return Ok(batch.clone());
    }

    let mut indices: Vec<u32> = last.into_values().collect();
    indices.sort_unstable();
    take_record_batch(batch, &UInt32Array::from(indices))
        .map_err(|e| TableError::arrow("take deduplicated rows", &e))
}

/// Sorts ascending by `keys`.
///
/// # Errors
///
/// Returns an error if a key column is missing.
pub fn sort_by_keys(batch: &RecordBatch, keys: &[&str]) -> Result<RecordBatch> {
    if batch.num_rows() <= 1 {
        return Ok(batch.clone());
    }
    let sort_columns: Vec<SortColumn> = key_columns(batch, keys)?
        .into_iter()
        .map(|values| SortColumn {
            values,
            options: None,
        })
        .collect();
    let indices =
        lexsort_to_indices(&sort_columns, None).map_err(|e| TableError::arrow("sort", &e))?;
    take_record_batch(batch, &indices).map_err(|e| TableError::arrow("take sorted rows", &e))
}

/// Unions schemas by column name in first-seen order.
///
/// A column's type comes from its first occurrence. Columns absent from some
/// schema become nullable.
#[must_use]
pub fn union_schema(schemas: &[SchemaRef]) -> Schema {
    let mut fields: Vec<Field> = Vec::new();
    for schema in schemas {
        for field in schema.fields() {
            match fields.iter_mut().find(|f| f.name() == field.name()) {
                Some(existing) => {
                    if field.is_nullable() {
                        *existing = existing.clone().with_nullable(true);
                    }
                }
                None => fields.push(field.as_ref().clone()),
            }
        }
    }
    for field in &mut fields {
        if schemas
            .iter()
            .any(|s| s.field_with_name(field.name()).is_err())
        {
            *field = field.clone().with_nullable(true);
        }
    }
    Schema::new(fields)
}

/// Conforms `batch` to `schema`: reorders, casts, and null-fills columns.
///
/// Columns not in `schema` are dropped.
///
/// # Errors
///
/// Returns an error if a column cannot be cast to the target type.
pub fn align_to_schema(batch: &RecordBatch, schema: &SchemaRef) -> Result<RecordBatch> {
    if batch.schema().as_ref() == schema.as_ref() {
        return Ok(batch.clone());
    }
    let strict = CastOptions {
        safe: false,
        ..CastOptions::default()
    };
    let mut columns = Vec::with_capacity(schema.fields().len());
    for field in schema.fields() {
        let array = match batch.column_by_name(field.name()) {
            Some(array) if array.data_type() == field.data_type() => Arc::clone(array),
            Some(array) => cast_with_options(array, field.data_type(), &strict).map_err(|e| {
                TableError::InvalidFrame(format!(
                    "cannot cast column {} from {} to {}: {e}",
                    field.name(),
                    array.data_type(),
                    field.data_type()
                ))
            })?,
            None => new_null_array(field.data_type(), batch.num_rows()),
        };
        columns.push(array);
    }
    RecordBatch::try_new(Arc::clone(schema), columns)
        .map_err(|e| TableError::arrow("align to schema", &e))
}

/// Concatenates frames under their [`union_schema`].
///
/// # Errors
///
/// Returns an error if a frame cannot be aligned to the union schema.
pub fn union_frames(frames: &[RecordBatch]) -> Result<RecordBatch> {
    let schemas: Vec<SchemaRef> = frames.iter().map(RecordBatch::schema).collect();
    let schema = Arc::new(union_schema(&schemas));
    let aligned = frames
        .iter()
        .map(|f| align_to_schema(f, &schema))
        .collect::<Result<Vec<_>>>()?;
    concat_batches(&schema, &aligned).map_err(|e| TableError::arrow("concat frames", &e))
}

/// Projects `batch` to `columns`, in the given order.
///
/// # Errors
///
/// Returns an error if a column is missing.
pub fn project(batch: &RecordBatch, columns: &[String]) -> Result<RecordBatch> {
    let schema = batch.schema();
    let indices = columns
        .iter()
        .map(|c| {
            schema
                .index_of(c)
                .map_err(|_| TableError::InvalidFrame(format!("missing column {c}")))
        })
        .collect::<Result<Vec<_>>>()?;
    batch
        .project(&indices)
        .map_err(|e| TableError::arrow("project", &e))
}
