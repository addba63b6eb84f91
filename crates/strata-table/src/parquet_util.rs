//! Parquet encoding and decoding for table data files.

use std::io::Cursor;
use std::sync::Arc;

use arrow::datatypes::Schema;
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::{ArrowWriter, ProjectionMask};
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue;

use crate::error::{Result, TableError};

fn failed<E: std::fmt::Display>(stage: &'static str) -> impl Fn(E) -> TableError {
    move |e| TableError::Parquet {
        message: format!("{stage}: {e}"),
    }
}

fn writer_properties() -> WriterProperties {
    WriterProperties::builder()
        .set_compression(Compression::ZSTD(ZstdLevel::default()))
        .set_key_value_metadata(Some(vec![KeyValue::new(
            "writer".to_string(),
            "strata-table".to_string(),
        )]))
        .build()
}

/// Encodes batches sharing `schema` as one Parquet file.
///
/// # Errors
///
/// Returns an error if the writer fails.
pub fn encode(schema: Arc<Schema>, batches: &[RecordBatch]) -> Result<Bytes> {
    let mut cursor = Cursor::new(Vec::<u8>::new());
    let mut writer = ArrowWriter::try_new(&mut cursor, schema, Some(writer_properties()))
        .map_err(failed("writer init"))?;
    for batch in batches {
        writer.write(batch).map_err(failed("write"))?;
    }
    writer.close().map_err(failed("close"))?;
    Ok(Bytes::from(cursor.into_inner()))
}

/// Decodes a Parquet file, reading only `columns` when given.
///
/// Requested columns absent from the file are skipped; callers align the
/// result to the table schema afterwards.
///
/// # Errors
///
/// Returns an error if the file cannot be decoded.
pub fn decode(bytes: Bytes, columns: Option<&[String]>) -> Result<Vec<RecordBatch>> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(bytes).map_err(failed("reader init"))?;

    let builder = match columns {
        Some(columns) => {
            let file_schema = Arc::clone(builder.schema());
            let indices: Vec<usize> = file_schema
                .fields()
                .iter()
                .enumerate()
                .filter(|(_, f)| columns.iter().any(|c| c == f.name()))
                .map(|(i, _)| i)
                .collect();
            let mask = ProjectionMask::roots(builder.parquet_schema(), indices);
            builder.with_projection(mask)
        }
        None => builder,
    };

    let reader = builder.build().map_err(failed("reader build"))?;

    reader
        .map(|batch| {
            batch.map_err(failed("read batch"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Float64Array, StringArray};
    use arrow::datatypes::{DataType, Field};

    fn batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("symbol", DataType::Utf8, false),
            Field::new("close", DataType::Float64, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec!["AAPL", "MSFT"])),
                Arc::new(Float64Array::from(vec![Some(1.0), None])),
            ],
        )
        .expect("batch")
    }

    #[test]
    fn projection_reads_requested_columns_only() {
        let batch = batch();
        let bytes = encode(batch.schema(), &[batch]).expect("encode");

        let projected = decode(bytes.clone(), Some(&["close".to_string(), "absent".to_string()]))
            .expect("decode");
        assert_eq!(projected[0].num_columns(), 1);
        assert_eq!(projected[0].schema().field(0).name(), "close");

        let full = decode(bytes, None).expect("decode");
        assert_eq!(full[0].num_columns(), 2);
        assert_eq!(full[0].num_rows(), 2);
    }

    #[test]
    fn garbage_is_a_parquet_error() {
        let err = decode(Bytes::from_static(b"not parquet"), None).expect_err("garbage");
        assert!(matches!(err, TableError::Parquet { .. }));
    }
}
