//! Commit-log table behaviour over in-memory storage.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use arrow::array::{Array, AsArray, Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use strata_table::{Predicate, ReadOptions, SchemaMode, Table, TableError, WriteOptions};
use strata_test_utils::{StorageOp, TestContext, TracingMemoryBackend};

fn monthly(rows: &[(&str, &str, f64)]) -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![
        Field::new("year_month", DataType::Utf8, false),
        Field::new("symbol", DataType::Utf8, false),
        Field::new("close", DataType::Float64, true),
    ]));
    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(
                rows.iter().map(|r| r.0).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rows.iter().map(|r| r.1).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                rows.iter().map(|r| r.2).collect::<Vec<_>>(),
            )),
        ],
    )
    .unwrap()
}

fn partitioned() -> WriteOptions {
    WriteOptions::append().partitioned_by(["year_month"])
}

fn symbols(batch: &RecordBatch) -> Vec<String> {
    let column = batch.column_by_name("symbol").unwrap().as_string::<i32>();
    (0..column.len()).map(|i| column.value(i).to_string()).collect()
}

#[tokio::test]
async fn missing_table_reads_as_not_found() {
    let ctx = TestContext::new();
    let table = Table::open(ctx.backend(), "gold/by_date");

    assert!(!table.exists().await.unwrap());
    assert!(table.snapshot().await.unwrap().is_none());
    let err = table.read(&ReadOptions::default()).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn append_writes_partitioned_files_and_a_commit() {
    let ctx = TestContext::new();
    let table = Table::open(ctx.backend(), "gold/by_date");

    let summary = table
        .write(
            &[monthly(&[
                ("2025-01", "AAPL", 1.0),
                ("2025-02", "AAPL", 2.0),
                ("2025-01", "MSFT", 3.0),
            ])],
            &partitioned(),
        )
        .await
        .unwrap();
    assert_eq!(summary.version, 0);
    assert_eq!(summary.files_added, 2);
    assert_eq!(summary.rows_written, 3);

    let paths = ctx.storage.paths_under("gold/by_date/");
    assert!(paths.contains(&"gold/by_date/_delta_log/00000000000000000000.json".to_string()));
    assert_eq!(
        paths
            .iter()
            .filter(|p| p.starts_with("gold/by_date/year_month=2025-01/part-"))
            .count(),
        1
    );

    let snapshot = table.snapshot().await.unwrap().unwrap();
    assert_eq!(snapshot.partition_columns, vec!["year_month".to_string()]);
    assert_eq!(snapshot.num_rows(), 3);
    assert_eq!(
        snapshot.partition_values("year_month").into_iter().collect::<Vec<_>>(),
        vec!["2025-01".to_string(), "2025-02".to_string()]
    );

    let january = table
        .read(
            &ReadOptions::default()
                .with_partition_filter(Predicate::is_in("year_month", ["2025-01"])),
        )
        .await
        .unwrap();
    assert_eq!(january.num_rows(), 2);

    let projected = table
        .read(&ReadOptions::default().with_columns(["close"]))
        .await
        .unwrap();
    assert_eq!(projected.num_columns(), 1);
    assert_eq!(projected.num_rows(), 3);
}

#[tokio::test]
async fn predicate_overwrite_replaces_only_matching_partitions() {
    let ctx = TestContext::new();
    let table = Table::open(ctx.backend(), "gold/by_date");
    table
        .write(
            &[monthly(&[("2024-12", "AAPL", 1.0), ("2025-01", "AAPL", 2.0)])],
            &partitioned(),
        )
        .await
        .unwrap();
    let december_files: Vec<String> = table
        .snapshot()
        .await
        .unwrap()
        .unwrap()
        .files
        .iter()
        .filter(|f| f.partition_values["year_month"] == "2024-12")
        .map(|f| f.path.clone())
        .collect();

    let summary = table
        .write(
            &[monthly(&[("2025-01", "AAPL", 20.0), ("2025-01", "MSFT", 30.0)])],
            &WriteOptions::overwrite().with_predicate(Predicate::is_in("year_month", ["2025-01"])),
        )
        .await
        .unwrap();
    assert_eq!(summary.files_removed, 1);
    assert_eq!(summary.files_added, 1);

    let snapshot = table.snapshot().await.unwrap().unwrap();
    let december_after: Vec<String> = snapshot
        .files
        .iter()
        .filter(|f| f.partition_values["year_month"] == "2024-12")
        .map(|f| f.path.clone())
        .collect();
    assert_eq!(december_files, december_after);
    assert_eq!(snapshot.num_rows(), 3);

    let january = table
        .read(
            &ReadOptions::default()
                .with_partition_filter(Predicate::is_in("year_month", ["2025-01"])),
        )
        .await
        .unwrap();
    assert_eq!(symbols(&january), vec!["AAPL", "MSFT"]);
}

#[tokio::test]
async fn rows_outside_the_predicate_are_rejected() {
    let ctx = TestContext::new();
    let table = Table::open(ctx.backend(), "gold/by_date");
    table
        .write(&[monthly(&[("2025-01", "AAPL", 1.0)])], &partitioned())
        .await
        .unwrap();

    let err = table
        .write(
            &[monthly(&[("2025-02", "AAPL", 2.0)])],
            &WriteOptions::overwrite().with_predicate(Predicate::is_in("year_month", ["2025-01"])),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TableError::InvalidPredicate(_)), "{err}");

    let err = table
        .write(
            &[monthly(&[("2025-01", "AAPL", 2.0)])],
            &WriteOptions::overwrite().with_predicate(Predicate::is_in("symbol", ["AAPL"])),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TableError::InvalidPredicate(_)), "{err}");

    assert_eq!(table.snapshot().await.unwrap().unwrap().version, 0);
}

#[tokio::test]
async fn strict_mode_reports_column_differences() {
    let ctx = TestContext::new();
    let table = Table::open(ctx.backend(), "silver/prices/AAPL");
    table
        .write(&[monthly(&[("2025-01", "AAPL", 1.0)])], &WriteOptions::append())
        .await
        .unwrap();

    let other = RecordBatch::try_new(
        Arc::new(Schema::new(vec![
            Field::new("year_month", DataType::Utf8, false),
            Field::new("symbol", DataType::Utf8, false),
            Field::new("close", DataType::Utf8, true),
            Field::new("volume", DataType::Int64, true),
        ])),
        vec![
            Arc::new(StringArray::from(vec!["2025-01"])),
            Arc::new(StringArray::from(vec!["AAPL"])),
            Arc::new(StringArray::from(vec!["1.5"])),
            Arc::new(Int64Array::from(vec![100])),
        ],
    )
    .unwrap();

    let err = table
        .write(&[other], &WriteOptions::append())
        .await
        .unwrap_err();
    match err {
        TableError::SchemaMismatch { table, details } => {
            assert_eq!(table, "silver/prices/AAPL");
            assert!(details.iter().any(|d| d.contains("close")), "{details:?}");
            assert!(details.iter().any(|d| d.contains("volume")), "{details:?}");
        }
        other => panic!("expected schema mismatch, got {other}"),
    }
}

#[tokio::test]
async fn merge_mode_widens_the_schema() {
    let ctx = TestContext::new();
    let table = Table::open(ctx.backend(), "silver/prices/AAPL");
    table
        .write(&[monthly(&[("2025-01", "AAPL", 1.0)])], &WriteOptions::append())
        .await
        .unwrap();

    let wider = RecordBatch::try_new(
        Arc::new(Schema::new(vec![
            Field::new("year_month", DataType::Utf8, false),
            Field::new("symbol", DataType::Utf8, false),
            Field::new("volume", DataType::Int64, true),
        ])),
        vec![
            Arc::new(StringArray::from(vec!["2025-02"])),
            Arc::new(StringArray::from(vec!["AAPL"])),
            Arc::new(Int64Array::from(vec![100])),
        ],
    )
    .unwrap();
    table
        .write(
            &[wider],
            &WriteOptions::append().with_schema_mode(SchemaMode::Merge),
        )
        .await
        .unwrap();

    let all = table.read(&ReadOptions::default()).await.unwrap();
    let schema = all.schema();
    let names: Vec<&str> = schema.fields().iter().map(|f| f.name().as_str()).collect();
    assert_eq!(names, vec!["year_month", "symbol", "close", "volume"]);
    assert_eq!(all.num_rows(), 2);
    assert_eq!(all.column_by_name("volume").unwrap().null_count(), 1);
    assert_eq!(all.column_by_name("close").unwrap().null_count(), 1);
}

#[tokio::test]
async fn vacuum_deletes_files_dropped_by_overwrite() {
    let ctx = TestContext::new();
    let table = Table::open(ctx.backend(), "gold/by_date");
    table
        .write(&[monthly(&[("2025-01", "AAPL", 1.0)])], &partitioned())
        .await
        .unwrap();
    table
        .write(
            &[monthly(&[("2025-01", "AAPL", 2.0)])],
            &WriteOptions::overwrite(),
        )
        .await
        .unwrap();

    let parquet = |paths: Vec<String>| paths.into_iter().filter(|p| p.ends_with(".parquet")).count();
    assert_eq!(parquet(ctx.storage.paths_under("gold/by_date/")), 2);

    assert_eq!(table.vacuum().await.unwrap(), 1);
    assert_eq!(parquet(ctx.storage.paths_under("gold/by_date/")), 1);
    assert_eq!(table.vacuum().await.unwrap(), 0);

    let close = table.read(&ReadOptions::default()).await.unwrap();
    assert_eq!(
        close
            .column_by_name("close")
            .unwrap()
            .as_primitive::<arrow::datatypes::Float64Type>()
            .value(0),
        2.0
    );
}

#[tokio::test]
async fn delete_table_removes_everything_under_the_root() {
    let ctx = TestContext::new();
    let table = Table::open(ctx.backend(), "gold/by_date");
    table
        .write(&[monthly(&[("2025-01", "AAPL", 1.0)])], &partitioned())
        .await
        .unwrap();
    let sibling = Table::open(ctx.backend(), "gold/by_date_v2");
    sibling
        .write(&[monthly(&[("2025-01", "AAPL", 1.0)])], &partitioned())
        .await
        .unwrap();

    assert_eq!(table.delete_table().await.unwrap(), 2);
    assert!(!table.exists().await.unwrap());
    assert!(sibling.exists().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn racing_writers_conflict_instead_of_clobbering() {
    let storage = Arc::new(TracingMemoryBackend::with_latency(Duration::from_millis(10)));
    let table = Table::open(storage.clone(), "gold/by_date");
    table
        .write(&[monthly(&[("2025-01", "AAPL", 1.0)])], &partitioned())
        .await
        .unwrap();

    let first = monthly(&[("2025-01", "MSFT", 2.0)]);
    let second = monthly(&[("2025-01", "GOOG", 3.0)]);
    let options = partitioned();
    let (a, b) = tokio::join!(
        table.write(std::slice::from_ref(&first), &options),
        table.write(std::slice::from_ref(&second), &options),
    );

    let conflicts = [&a, &b]
        .iter()
        .filter(|r| matches!(r, Err(TableError::CommitConflict { version: 1, .. })))
        .count();
    assert_eq!(conflicts, 1, "{a:?} / {b:?}");
    assert_eq!(a.is_ok() as usize + b.is_ok() as usize, 1);

    let snapshot = table.snapshot().await.unwrap().unwrap();
    assert_eq!(snapshot.version, 1);
    assert_eq!(snapshot.num_rows(), 2);
    // The loser's data file was cleaned up.
    let parquet = storage
        .paths_under("gold/by_date/")
        .into_iter()
        .filter(|p| p.ends_with(".parquet"))
        .count();
    assert_eq!(parquet, 2);
    assert!(
        storage
            .operations()
            .iter()
            .any(|op| matches!(op, StorageOp::Delete { .. }))
    );
}
