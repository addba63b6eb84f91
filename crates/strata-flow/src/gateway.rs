//! Provider gateway client.
//!
//! Every outbound call passes two gates first:
//!
//! - **Warm-up**: probes `GET {base}/healthz` with capped exponential backoff
//!   and jitter. A non-retryable status ends the probe loop early.
//! - **Readiness**: repeats the warm-up procedure with a fixed sleep between
//!   attempts and stops at the first success.
//!
//! Both outcomes are cached for the client's lifetime unless a caller forces
//! a re-attempt. A failed readiness gate fails calls immediately with an
//! [`GatewayErrorKind::Unavailable`] error, without spending provider quota.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use arrow::csv::reader::Format;
use arrow::csv::ReaderBuilder;
use arrow::datatypes::Schema;
use arrow::record_batch::RecordBatch;
use serde::de::DeserializeOwned;
use strata_core::config::GatewaySettings;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::backoff;
use crate::error::{GatewayError, GatewayErrorKind};
use crate::metrics;

/// Header naming the calling job.
pub const CALLER_JOB_HEADER: &str = "X-Caller-Job";

/// Header naming the calling execution.
pub const CALLER_EXECUTION_HEADER: &str = "X-Caller-Execution";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const CSV_INFER_RECORDS: usize = 1_000;

/// Identity attached to every outbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    /// Job name.
    pub job: String,
    /// Execution id.
    pub execution: String,
}

impl CallerIdentity {
    /// Creates an identity.
    pub fn new(job: impl Into<String>, execution: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            execution: execution.into(),
        }
    }
}

/// Cached state of one gate.
#[derive(Debug, Clone, Default)]
pub enum GateState {
    /// Not yet attempted.
    #[default]
    NotAttempted,
    /// Passed.
    Succeeded,
    /// Failed with the recorded error.
    Failed(GatewayError),
}

impl GateState {
    fn cached(&self) -> Option<Result<(), GatewayError>> {
        match self {
            Self::NotAttempted => None,
            Self::Succeeded => Some(Ok(())),
            Self::Failed(e) => Some(Err(e.clone())),
        }
    }

    fn record(result: &Result<(), GatewayError>) -> Self {
        match result {
            Ok(()) => Self::Succeeded,
            Err(e) => Self::Failed(e.clone()),
        }
    }
}

/// Gated HTTP client for the provider gateway.
#[derive(Clone)]
pub struct GatewayClient {
    http: reqwest::Client,
    base_url: String,
    settings: Arc<GatewaySettings>,
    caller: CallerIdentity,
    warmup: Arc<Mutex<GateState>>,
    readiness: Arc<Mutex<GateState>>,
}

impl std::fmt::Debug for GatewayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayClient")
            .field("base_url", &self.base_url)
            .field("caller", &self.caller)
            .field("api_key", &self.settings.api_key)
            .finish_non_exhaustive()
    }
}

impl GatewayClient {
    /// Creates a client. No request is made until the first call.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(settings: GatewaySettings, caller: CallerIdentity) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| {
                GatewayError::without_status(
                    GatewayErrorKind::Transport,
                    format!("failed to build HTTP client: {e}"),
                )
            })?;
        Ok(Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            settings: Arc::new(settings),
            caller,
            warmup: Arc::new(Mutex::new(GateState::NotAttempted)),
            readiness: Arc::new(Mutex::new(GateState::NotAttempted)),
        })
    }

    /// Base URL without a trailing slash.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Current warm-up gate state.
    pub async fn warmup_state(&self) -> GateState {
        self.warmup.lock().await.clone()
    }

    /// Current readiness gate state.
    pub async fn readiness_state(&self) -> GateState {
        self.readiness.lock().await.clone()
    }

    /// Runs the warm-up procedure once, or returns its cached outcome.
    ///
    /// # Errors
    ///
    /// Returns the last probe error when every probe failed or a probe got a
    /// non-retryable status.
    pub async fn warm_up(&self, force: bool) -> Result<(), GatewayError> {
        let mut gate = self.warmup.lock().await;
        if !force {
            if let Some(cached) = gate.cached() {
                return cached;
            }
        }
        let result = self.probe_with_backoff().await;
        *gate = GateState::record(&result);
        result
    }

    /// Ensures the gateway is ready, or returns the cached readiness outcome.
    ///
    /// # Errors
    ///
    /// Returns an `Unavailable` error when every warm-up attempt failed.
    pub async fn ensure_ready(&self, force: bool) -> Result<(), GatewayError> {
        let mut gate = self.readiness.lock().await;
        if !force {
            if let Some(cached) = gate.cached() {
                return cached;
            }
        }

        let attempts = self.settings.readiness.attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.warm_up(force || attempt > 1).await {
                Ok(()) => {
                    info!(gateway = %self.base_url, attempt, "gateway ready");
                    *gate = GateState::Succeeded;
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        gateway = %self.base_url,
                        attempt,
                        attempts,
                        error = %e,
                        "gateway warm-up failed"
                    );
                    last_error = Some(e);
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.settings.readiness.sleep).await;
            }
        }

        let detail = last_error
            .map_or_else(|| "no warm-up attempted".to_string(), |e| e.to_string());
        let error = GatewayError::unavailable(format!(
            "gateway not ready after {attempts} attempt(s): {detail}"
        ));
        *gate = GateState::Failed(error.clone());
        Err(error)
    }

    /// Fetches `path` and decodes the JSON body.
    ///
    /// # Errors
    ///
    /// Returns an error if the gateway is not ready, the request fails, the
    /// status is not 2xx, or the body is not valid JSON for `T`.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, GatewayError> {
        let body = self.get_text(path, query).await?;
        serde_json::from_str(&body).map_err(|e| {
            metrics::record_gateway_request(GatewayErrorKind::Decode.as_str());
            GatewayError::without_status(GatewayErrorKind::Decode, format!("{path}: {e}"))
        })
    }

    /// Fetches `path` and parses the CSV body into one batch.
    ///
    /// Column types are inferred from the header and the first rows. An
    /// empty body yields an empty batch.
    ///
    /// # Errors
    ///
    /// Returns an error if the gateway is not ready, the request fails, the
    /// status is not 2xx, or the body is not valid CSV.
    pub async fn get_csv(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<RecordBatch, GatewayError> {
        let body = self.get_text(path, query).await?;
        parse_csv(&body).map_err(|e| {
            metrics::record_gateway_request(GatewayErrorKind::Decode.as_str());
            GatewayError::without_status(GatewayErrorKind::Decode, format!("{path}: {e}"))
        })
    }

    async fn get_text(&self, path: &str, query: &[(&str, &str)]) -> Result<String, GatewayError> {
        if let Err(e) = self.ensure_ready(false).await {
            metrics::record_gateway_request("not_ready");
            return Err(e);
        }

        let url = self.url(path);
        let response = self
            .authorized(self.http.get(&url))
            .query(query)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| {
                metrics::record_gateway_request(GatewayErrorKind::Transport.as_str());
                GatewayError::without_status(GatewayErrorKind::Transport, format!("{path}: {e}"))
            })?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| {
            metrics::record_gateway_request(GatewayErrorKind::Transport.as_str());
            GatewayError::without_status(GatewayErrorKind::Transport, format!("{path}: {e}"))
        })?;
        if !(200..300).contains(&status) {
            let error = GatewayError::from_response(status, &body);
            metrics::record_gateway_request(error.kind.as_str());
            debug!(path, status, kind = %error.kind, "gateway request failed");
            return Err(error);
        }
        metrics::record_gateway_request("ok");
        Ok(body)
    }

    async fn probe_with_backoff(&self) -> Result<(), GatewayError> {
        let warmup = &self.settings.warmup;
        let attempts = warmup.attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.probe().await {
                Ok(()) => {
                    metrics::record_probe("ok");
                    debug!(gateway = %self.base_url, attempt, "warm-up probe succeeded");
                    return Ok(());
                }
                Err(e) if !e.is_retryable() || attempt >= attempts => {
                    metrics::record_probe("failed");
                    return Err(e);
                }
                Err(e) => {
                    metrics::record_probe("retry");
                    let delay = backoff::with_jitter(backoff::exponential(
                        warmup.base_delay,
                        attempt,
                        warmup.max_delay,
                    ));
                    debug!(
                        gateway = %self.base_url,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "warm-up probe failed; backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn probe(&self) -> Result<(), GatewayError> {
        let response = self
            .authorized(self.http.get(self.url("/healthz")))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(|e| GatewayError::without_status(GatewayErrorKind::Transport, e.to_string()))?;
        let status = response.status().as_u16();
        if (200..300).contains(&status) {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(GatewayError::from_response(status, &body))
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request
            .header(CALLER_JOB_HEADER, &self.caller.job)
            .header(CALLER_EXECUTION_HEADER, &self.caller.execution);
        match &self.settings.api_key {
            Some(key) => request.header(self.settings.api_key_header.as_str(), key.expose()),
            None => request,
        }
    }
}

fn parse_csv(body: &str) -> Result<RecordBatch, arrow::error::ArrowError> {
    if body.trim().is_empty() {
        return Ok(RecordBatch::new_empty(Arc::new(Schema::empty())));
    }
    let format = Format::default().with_header(true);
    let (schema, _) = format.infer_schema(Cursor::new(body.as_bytes()), Some(CSV_INFER_RECORDS))?;
    let schema = Arc::new(schema);
    let reader = ReaderBuilder::new(Arc::clone(&schema))
        .with_format(format)
        .build(Cursor::new(body.as_bytes()))?;
    let batches = reader.collect::<Result<Vec<_>, _>>()?;
    arrow::compute::concat_batches(&schema, &batches)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_types_are_inferred() {
        let batch = parse_csv("date,close\n2025-01-15,101.5\n2025-01-16,102\n").unwrap();
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.schema().field(0).name(), "date");
        assert_eq!(
            batch.schema().field(1).data_type(),
            &arrow::datatypes::DataType::Float64
        );
    }

    #[test]
    fn empty_csv_is_an_empty_batch() {
        let batch = parse_csv("  \n").unwrap();
        assert_eq!(batch.num_rows(), 0);
        assert_eq!(batch.num_columns(), 0);
    }

    #[test]
    fn debug_redacts_the_api_key() {
        let mut settings = GatewaySettings::new("http://gateway.local/");
        settings.api_key = Some(strata_core::Redacted::new("secret-key".to_string()));
        let client = GatewayClient::new(settings, CallerIdentity::new("bronze", "exec-1")).unwrap();
        let rendered = format!("{client:?}");
        assert!(!rendered.contains("secret-key"));
        assert_eq!(client.base_url(), "http://gateway.local");
        assert_eq!(client.url("/v1/prices"), "http://gateway.local/v1/prices");
    }
}
