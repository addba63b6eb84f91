//! Pre-built fixtures for common test scenarios.

use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use chrono::NaiveDate;
use strata_core::{ScopedStorage, StorageBackend, TenantId};

use crate::storage::TracingMemoryBackend;

/// Test context with shared storage and a tenant.
pub struct TestContext {
    /// Raw backend, for operation assertions.
    pub storage: Arc<TracingMemoryBackend>,
    /// Tenant the scoped view is bound to.
    pub tenant: TenantId,
}

impl TestContext {
    /// Creates a context for tenant `test-tenant`.
    pub fn new() -> Self {
        Self::with_tenant("test-tenant")
    }

    /// Creates a context for a specific tenant.
    pub fn with_tenant(tenant: &str) -> Self {
        Self {
            storage: Arc::new(TracingMemoryBackend::new()),
            tenant: TenantId::new(tenant).expect("valid tenant"),
        }
    }

    /// Returns the backend as a trait object.
    pub fn backend(&self) -> Arc<dyn StorageBackend> {
        self.storage.clone()
    }

    /// Returns a tenant-scoped view of the storage.
    pub fn scoped(&self) -> Arc<dyn StorageBackend> {
        Arc::new(ScopedStorage::new(self.backend(), self.tenant.clone()))
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds a calendar date.
pub fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).expect("valid date")
}

/// Schema of [`price_frame`]: raw provider column names.
pub fn price_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("Date", DataType::Utf8, false),
        Field::new("Symbol", DataType::Utf8, false),
        Field::new("Close", DataType::Float64, true),
    ]))
}

/// Daily prices for one symbol as a provider would deliver them.
///
/// `rows` are `(YYYY-MM-DD, close)` pairs.
pub fn price_frame(symbol: &str, rows: &[(&str, f64)]) -> RecordBatch {
    let dates: Vec<&str> = rows.iter().map(|(d, _)| *d).collect();
    let symbols: Vec<&str> = rows.iter().map(|_| symbol).collect();
    let closes: Vec<f64> = rows.iter().map(|(_, c)| *c).collect();
    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(dates)),
        Arc::new(StringArray::from(symbols)),
        Arc::new(Float64Array::from(closes)),
    ];
    RecordBatch::try_new(price_schema(), columns).expect("valid batch")
}

/// Renders batches as a table for readable assertion failures.
pub fn pretty(batches: &[RecordBatch]) -> String {
    arrow::util::pretty::pretty_format_batches(batches)
        .map(|t| t.to_string())
        .unwrap_or_else(|e| format!("<unprintable: {e}>"))
}
