//! Orphan purge and retroactive cutoff enforcement.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use strata_core::backfill::BackfillWindow;
use strata_table::{ReadOptions, Reconciler, Table, WriteOptions};
use strata_test_utils::{TestContext, date, price_frame};

const UPSTREAM: &str = "silver/prices";
const DOWNSTREAM: &str = "gold/features";

async fn seed(ctx: &TestContext, root: &str, symbol: &str, rows: &[(&str, f64)]) {
    Table::open(ctx.backend(), format!("{root}/{symbol}"))
        .write(&[price_frame(symbol, rows)], &WriteOptions::append())
        .await
        .unwrap();
}

fn downstream_path(entity: &str) -> String {
    format!("{DOWNSTREAM}/{entity}")
}

fn window(y: i32, m: u32, d: u32) -> BackfillWindow {
    BackfillWindow {
        start: date(y, m, d),
        end: None,
    }
}

#[tokio::test]
async fn orphans_are_purged_exactly() {
    let ctx = TestContext::new();
    seed(&ctx, UPSTREAM, "A", &[("2025-01-15", 1.0)]).await;
    seed(&ctx, DOWNSTREAM, "A", &[("2025-01-15", 1.0)]).await;
    seed(&ctx, DOWNSTREAM, "B", &[("2025-01-15", 2.0)]).await;
    seed(&ctx, DOWNSTREAM, "B", &[("2025-01-16", 3.0)]).await;

    let report = Reconciler::new(ctx.backend(), BackfillWindow::default())
        .reconcile(UPSTREAM, DOWNSTREAM, downstream_path)
        .await
        .unwrap();

    assert_eq!(report.orphans_purged, vec!["B".to_string()]);
    // Two commits and two data files.
    assert_eq!(report.blobs_deleted, 4);
    assert!(ctx.storage.paths_under("gold/features/B/").is_empty());
    assert!(!ctx.storage.paths_under("gold/features/A/").is_empty());
    assert!(ctx.storage.deleted_paths().iter().all(|p| p.starts_with("gold/features/B/")));
}

#[tokio::test]
async fn purge_does_not_touch_prefix_siblings() {
    let ctx = TestContext::new();
    seed(&ctx, UPSTREAM, "BRK", &[("2025-01-15", 1.0)]).await;
    seed(&ctx, DOWNSTREAM, "BRK", &[("2025-01-15", 1.0)]).await;
    seed(&ctx, DOWNSTREAM, "BR", &[("2025-01-15", 1.0)]).await;

    let report = Reconciler::new(ctx.backend(), BackfillWindow::default())
        .reconcile(UPSTREAM, DOWNSTREAM, downstream_path)
        .await
        .unwrap();
    assert_eq!(report.orphans_purged, vec!["BR".to_string()]);
    assert!(Table::open(ctx.backend(), downstream_path("BRK")).exists().await.unwrap());
}

#[tokio::test]
async fn dry_run_reports_without_deleting() {
    let ctx = TestContext::new();
    seed(&ctx, UPSTREAM, "A", &[("2025-01-15", 1.0)]).await;
    seed(&ctx, DOWNSTREAM, "B", &[("2025-01-15", 2.0)]).await;

    let report = Reconciler::new(ctx.backend(), BackfillWindow::default())
        .with_dry_run(true)
        .reconcile(UPSTREAM, DOWNSTREAM, downstream_path)
        .await
        .unwrap();
    assert!(report.dry_run);
    assert_eq!(report.orphans_purged, vec!["B".to_string()]);
    assert_eq!(report.blobs_deleted, 2);
    assert!(ctx.storage.deleted_paths().is_empty());
}

#[tokio::test]
async fn empty_upstream_refuses_to_purge_unless_allowed() {
    let ctx = TestContext::new();
    seed(&ctx, DOWNSTREAM, "A", &[("2025-01-15", 1.0)]).await;

    let report = Reconciler::new(ctx.backend(), BackfillWindow::default())
        .reconcile(UPSTREAM, DOWNSTREAM, downstream_path)
        .await
        .unwrap();
    assert!(report.refused_empty_upstream);
    assert!(report.orphans_purged.is_empty());
    assert!(Table::open(ctx.backend(), downstream_path("A")).exists().await.unwrap());

    let report = Reconciler::new(ctx.backend(), BackfillWindow::default())
        .allow_empty_upstream(true)
        .reconcile(UPSTREAM, DOWNSTREAM, downstream_path)
        .await
        .unwrap();
    assert_eq!(report.orphans_purged, vec!["A".to_string()]);
}

#[tokio::test]
async fn cutoff_drops_early_rows_and_deletes_emptied_tables() {
    let ctx = TestContext::new();
    seed(
        &ctx,
        DOWNSTREAM,
        "AAPL",
        &[("2019-12-31", 1.0), ("2020-01-02", 2.0), ("2021-06-01", 3.0)],
    )
    .await;
    seed(&ctx, DOWNSTREAM, "OLD", &[("2018-03-01", 4.0)]).await;
    seed(&ctx, DOWNSTREAM, "NEW", &[("2024-03-01", 5.0)]).await;

    let report = Reconciler::new(ctx.backend(), window(2020, 1, 1))
        .enforce_cutoff(DOWNSTREAM, "Date")
        .await
        .unwrap();

    assert_eq!(report.tables_checked, 3);
    assert_eq!(report.tables_rewritten, 1);
    assert_eq!(report.tables_deleted, 1);
    assert_eq!(report.rows_dropped, 2);
    assert_eq!(report.tables_failed, 0);
    assert_eq!(report.files_vacuumed, 1);

    let aapl = Table::open(ctx.backend(), downstream_path("AAPL"))
        .read(&ReadOptions::default())
        .await
        .unwrap();
    assert_eq!(aapl.num_rows(), 2);
    assert!(ctx.storage.paths_under("gold/features/OLD/").is_empty());

    // Re-running finds nothing left to do.
    let again = Reconciler::new(ctx.backend(), window(2020, 1, 1))
        .enforce_cutoff(DOWNSTREAM, "Date")
        .await
        .unwrap();
    assert_eq!(again.rows_dropped, 0);
    assert_eq!(again.tables_checked, 2);
}

#[tokio::test]
async fn cutoff_failure_on_one_table_is_counted() {
    let ctx = TestContext::new();
    seed(&ctx, DOWNSTREAM, "AAPL", &[("2019-12-31", 1.0)]).await;
    seed(&ctx, DOWNSTREAM, "MSFT", &[("2019-12-31", 1.0)]).await;

    let report = Reconciler::new(ctx.backend(), window(2020, 1, 1))
        .enforce_cutoff(DOWNSTREAM, "missing_column")
        .await
        .unwrap();
    assert_eq!(report.tables_failed, 2);
    assert_eq!(report.tables_deleted, 0);
}

#[tokio::test]
async fn sweep_purges_then_enforces_on_survivors() {
    let ctx = TestContext::new();
    seed(&ctx, UPSTREAM, "A", &[("2025-01-15", 1.0)]).await;
    seed(&ctx, DOWNSTREAM, "A", &[("2019-06-01", 1.0), ("2025-01-15", 2.0)]).await;
    seed(&ctx, DOWNSTREAM, "B", &[("2019-06-01", 3.0)]).await;

    let report = Reconciler::new(ctx.backend(), window(2020, 1, 1))
        .with_dry_run(true)
        .sweep(UPSTREAM, DOWNSTREAM, downstream_path, "Date")
        .await
        .unwrap();
    assert_eq!(report.reconcile.orphans_purged, vec!["B".to_string()]);
    // B is an orphan, so cutoff only looks at A.
    assert_eq!(report.cutoff.tables_checked, 1);
    assert_eq!(report.cutoff.tables_rewritten, 1);
    assert_eq!(report.cutoff.rows_dropped, 1);
    assert!(ctx.storage.deleted_paths().is_empty());

    let report = Reconciler::new(ctx.backend(), window(2020, 1, 1))
        .sweep(UPSTREAM, DOWNSTREAM, downstream_path, "Date")
        .await
        .unwrap();
    assert_eq!(report.reconcile.orphans_purged, vec!["B".to_string()]);
    assert_eq!(report.cutoff.rows_dropped, 1);
    let a = Table::open(ctx.backend(), downstream_path("A"))
        .read(&ReadOptions::default())
        .await
        .unwrap();
    assert_eq!(a.num_rows(), 1);
}
