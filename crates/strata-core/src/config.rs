//! Pipeline configuration.
//!
//! [`PipelineConfig::from_env`] is the single boundary where environment
//! variables are read. Every setting is optional; an invalid value falls back
//! to its default with a warning naming the variable instead of failing
//! startup.

use std::str::FromStr;
use std::time::Duration;

use chrono::NaiveDate;

use crate::backfill::BackfillPolicy;
use crate::lock::{DEFAULT_LEASE_DURATION, WaitPolicy};
use crate::observability::Redacted;
use crate::tenant::TenantId;

/// Default API key header for the provider gateway.
pub const DEFAULT_API_KEY_HEADER: &str = "X-API-Key";

/// Warm-up probe settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarmupSettings {
    /// Probe attempts before the warm-up gate fails.
    pub attempts: u32,
    /// First backoff delay; doubles each attempt.
    pub base_delay: Duration,
    /// Backoff cap.
    pub max_delay: Duration,
}

impl Default for WarmupSettings {
    fn default() -> Self {
        Self {
            attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(8_000),
        }
    }
}

/// Readiness gate settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessSettings {
    /// Warm-up procedures attempted before readiness fails.
    pub attempts: u32,
    /// Fixed sleep between warm-up procedures.
    pub sleep: Duration,
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            attempts: 3,
            sleep: Duration::from_millis(2_000),
        }
    }
}

/// Provider gateway settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewaySettings {
    /// Gateway base URL.
    pub base_url: String,
    /// API key sent in `api_key_header`.
    pub api_key: Option<Redacted<String>>,
    /// Header carrying the API key.
    pub api_key_header: String,
    /// Warm-up gate.
    pub warmup: WarmupSettings,
    /// Readiness gate.
    pub readiness: ReadinessSettings,
}

impl GatewaySettings {
    /// Settings for `base_url` with defaults for everything else.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            api_key_header: DEFAULT_API_KEY_HEADER.to_string(),
            warmup: WarmupSettings::default(),
            readiness: ReadinessSettings::default(),
        }
    }
}

/// Downstream trigger settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerSettings {
    /// Control-plane base URL; `None` disables triggering.
    pub control_plane_url: Option<String>,
    /// Jobs started after a successful run.
    pub next_jobs: Vec<String>,
    /// Whether an exhausted trigger fails the run.
    pub required: bool,
    /// Attempts per job.
    pub max_attempts: u32,
    /// First backoff delay; doubles each attempt.
    pub base_delay: Duration,
}

impl Default for TriggerSettings {
    fn default() -> Self {
        Self {
            control_plane_url: None,
            next_jobs: Vec::new(),
            required: true,
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
        }
    }
}

/// Immutable pipeline configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Tenant all storage paths are scoped to.
    pub tenant: TenantId,
    /// Storage location URL (`memory://`, `file://`, `s3://`, ...).
    pub storage_url: Option<String>,
    /// Resolved backfill policy.
    pub backfill: BackfillPolicy,
    /// Months materialized per run.
    pub materialize_window_months: u32,
    /// Lease duration.
    pub lease_duration: Duration,
    /// Lock wait policy.
    pub lock_wait: WaitPolicy,
    /// Poll interval while waiting for a lock.
    pub lock_poll_interval: Duration,
    /// Ingestion concurrency.
    pub worker_pool_size: usize,
    /// Provider gateway, if configured.
    pub gateway: Option<GatewaySettings>,
    /// Downstream triggering.
    pub trigger: TriggerSettings,
    /// Reprocess every source regardless of signatures.
    pub force_reprocess: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tenant: TenantId::default_tenant(),
            storage_url: None,
            backfill: BackfillPolicy::default(),
            materialize_window_months: 1,
            lease_duration: DEFAULT_LEASE_DURATION,
            lock_wait: WaitPolicy::NoWait,
            lock_poll_interval: Duration::from_secs(5),
            worker_pool_size: 8,
            gateway: None,
            trigger: TriggerSettings::default(),
            force_reprocess: false,
        }
    }
}

impl PipelineConfig {
    /// Reads configuration from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads configuration through `lookup`.
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let defaults = Self::default();

        let tenant = env
            .string("STRATA_TENANT_ID")
            .and_then(|raw| match TenantId::new(&raw) {
                Ok(tenant) => Some(tenant),
                Err(e) => {
                    warn_fallback("STRATA_TENANT_ID", &raw, &e.to_string());
                    None
                }
            })
            .unwrap_or(defaults.tenant);

        let backfill = BackfillPolicy::resolve(
            env.parsed::<NaiveDate>("STRATA_BACKFILL_START_DATE"),
            env.parsed::<NaiveDate>("STRATA_BACKFILL_END_DATE"),
        );

        let materialize_window_months = env
            .positive::<u32>("STRATA_MATERIALIZE_WINDOW_MONTHS")
            .unwrap_or(defaults.materialize_window_months);
        let lease_duration = env
            .positive::<u64>("STRATA_LEASE_DURATION_SECS")
            .map_or(defaults.lease_duration, Duration::from_secs);
        let lock_wait = env
            .parsed::<WaitPolicy>("STRATA_LOCK_WAIT")
            .unwrap_or(defaults.lock_wait);
        let lock_poll_interval = env
            .positive::<u64>("STRATA_LOCK_POLL_INTERVAL_SECS")
            .map_or(defaults.lock_poll_interval, Duration::from_secs);
        let worker_pool_size = env
            .positive::<usize>("STRATA_WORKER_POOL_SIZE")
            .unwrap_or(defaults.worker_pool_size);

        let gateway = env.string("STRATA_GATEWAY_URL").map(|base_url| {
            let warmup_defaults = WarmupSettings::default();
            let readiness_defaults = ReadinessSettings::default();
            GatewaySettings {
                base_url,
                api_key: env.string("STRATA_GATEWAY_API_KEY").map(Redacted::new),
                api_key_header: env
                    .string("STRATA_GATEWAY_API_KEY_HEADER")
                    .unwrap_or_else(|| DEFAULT_API_KEY_HEADER.to_string()),
                warmup: WarmupSettings {
                    attempts: env
                        .positive("STRATA_GATEWAY_WARMUP_ATTEMPTS")
                        .unwrap_or(warmup_defaults.attempts),
                    base_delay: env
                        .parsed::<u64>("STRATA_GATEWAY_WARMUP_BASE_DELAY_MS")
                        .map_or(warmup_defaults.base_delay, Duration::from_millis),
                    max_delay: env
                        .parsed::<u64>("STRATA_GATEWAY_WARMUP_MAX_DELAY_MS")
                        .map_or(warmup_defaults.max_delay, Duration::from_millis),
                },
                readiness: ReadinessSettings {
                    attempts: env
                        .positive("STRATA_GATEWAY_READINESS_ATTEMPTS")
                        .unwrap_or(readiness_defaults.attempts),
                    sleep: env
                        .parsed::<u64>("STRATA_GATEWAY_READINESS_SLEEP_MS")
                        .map_or(readiness_defaults.sleep, Duration::from_millis),
                },
            }
        });

        let trigger = TriggerSettings {
            control_plane_url: env.string("STRATA_CONTROL_PLANE_URL"),
            next_jobs: env
                .string("STRATA_TRIGGER_NEXT_JOBS")
                .map(|raw| parse_job_list(&raw))
                .unwrap_or_default(),
            required: env
                .boolean("STRATA_TRIGGER_REQUIRED")
                .unwrap_or(defaults.trigger.required),
            max_attempts: env
                .positive("STRATA_TRIGGER_MAX_ATTEMPTS")
                .unwrap_or(defaults.trigger.max_attempts),
            base_delay: env
                .parsed::<u64>("STRATA_TRIGGER_BASE_DELAY_MS")
                .map_or(defaults.trigger.base_delay, Duration::from_millis),
        };

        Self {
            tenant,
            storage_url: env.string("STRATA_STORAGE_URL"),
            backfill,
            materialize_window_months,
            lease_duration,
            lock_wait,
            lock_poll_interval,
            worker_pool_size,
            gateway,
            trigger,
            force_reprocess: env
                .boolean("STRATA_FORCE_REPROCESS")
                .unwrap_or(defaults.force_reprocess),
        }
    }
}

/// Splits a comma-delimited job list, dropping blanks.
#[must_use]
pub fn parse_job_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Parses a boolean flag (`true/1/yes/y`, `false/0/no/n`).
#[must_use]
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "y" => Some(true),
        "false" | "0" | "no" | "n" => Some(false),
        _ => None,
    }
}

fn warn_fallback(name: &str, value: &str, reason: &str) {
    tracing::warn!(
        variable = name,
        value = value,
        reason = reason,
        "invalid configuration value; using default"
    );
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).and_then(|v| {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    fn parsed<T>(&self, name: &str) -> Option<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let raw = self.string(name)?;
        match raw.parse::<T>() {
            Ok(v) => Some(v),
            Err(e) => {
                warn_fallback(name, &raw, &e.to_string());
                None
            }
        }
    }

    fn positive<T>(&self, name: &str) -> Option<T>
    where
        T: FromStr + Default + PartialOrd,
        T::Err: std::fmt::Display,
    {
        let value = self.parsed::<T>(name)?;
        if value > T::default() {
            Some(value)
        } else {
            warn_fallback(name, "0", "must be greater than zero");
            None
        }
    }

    fn boolean(&self, name: &str) -> Option<bool> {
        let raw = self.string(name)?;
        let parsed = parse_bool(&raw);
        if parsed.is_none() {
            warn_fallback(name, &raw, "must be a boolean (true/false/1/0)");
        }
        parsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> PipelineConfig {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        PipelineConfig::from_lookup(move |name| map.get(name).cloned())
    }

    #[test]
    fn empty_environment_yields_defaults() {
        assert_eq!(config(&[]), PipelineConfig::default());
        let cfg = config(&[]);
        assert_eq!(cfg.tenant.as_str(), "default");
        assert_eq!(cfg.worker_pool_size, 8);
        assert!(cfg.trigger.required);
        assert!(cfg.gateway.is_none());
    }

    #[test]
    fn values_are_parsed() {
        let cfg = config(&[
            ("STRATA_TENANT_ID", "acme"),
            ("STRATA_BACKFILL_START_DATE", "2020-03-01"),
            ("STRATA_MATERIALIZE_WINDOW_MONTHS", "3"),
            ("STRATA_LEASE_DURATION_SECS", "120"),
            ("STRATA_LOCK_WAIT", "300"),
            ("STRATA_WORKER_POOL_SIZE", "4"),
            ("STRATA_GATEWAY_URL", "http://gateway:8080"),
            ("STRATA_GATEWAY_API_KEY", "secret"),
            ("STRATA_TRIGGER_NEXT_JOBS", "silver_prices, gold_features,,"),
            ("STRATA_TRIGGER_REQUIRED", "no"),
            ("STRATA_FORCE_REPROCESS", "yes"),
        ]);
        assert_eq!(cfg.tenant.as_str(), "acme");
        assert_eq!(
            cfg.backfill.start(),
            NaiveDate::from_ymd_opt(2020, 3, 1).expect("date")
        );
        assert_eq!(cfg.materialize_window_months, 3);
        assert_eq!(cfg.lease_duration, Duration::from_secs(120));
        assert_eq!(cfg.lock_wait, WaitPolicy::Timeout(Duration::from_secs(300)));
        assert_eq!(cfg.worker_pool_size, 4);
        let gateway = cfg.gateway.expect("gateway");
        assert_eq!(gateway.api_key_header, "X-API-Key");
        assert_eq!(
            gateway.api_key.as_ref().map(|k| k.expose().as_str()),
            Some("secret")
        );
        assert_eq!(cfg.trigger.next_jobs, vec!["silver_prices", "gold_features"]);
        assert!(!cfg.trigger.required);
        assert!(cfg.force_reprocess);
    }

    #[test]
    fn invalid_values_fall_back_to_defaults() {
        let cfg = config(&[
            ("STRATA_TENANT_ID", "NOT VALID"),
            ("STRATA_BACKFILL_START_DATE", "yesterday"),
            ("STRATA_WORKER_POOL_SIZE", "0"),
            ("STRATA_LEASE_DURATION_SECS", "-5"),
            ("STRATA_LOCK_WAIT", "eventually"),
            ("STRATA_TRIGGER_REQUIRED", "maybe"),
        ]);
        let defaults = PipelineConfig::default();
        assert_eq!(cfg.tenant, defaults.tenant);
        assert_eq!(cfg.backfill, defaults.backfill);
        assert_eq!(cfg.worker_pool_size, defaults.worker_pool_size);
        assert_eq!(cfg.lease_duration, defaults.lease_duration);
        assert_eq!(cfg.lock_wait, WaitPolicy::NoWait);
        assert!(cfg.trigger.required);
    }

    #[test]
    fn early_backfill_override_is_clamped() {
        let cfg = config(&[("STRATA_BACKFILL_START_DATE", "1990-01-01")]);
        assert!(cfg.backfill.was_clamped());
        assert_eq!(cfg.backfill.start(), crate::backfill::BACKFILL_FLOOR);
    }

    #[test]
    fn api_key_is_not_printed() {
        let cfg = config(&[
            ("STRATA_GATEWAY_URL", "http://gateway"),
            ("STRATA_GATEWAY_API_KEY", "sk-live-abc"),
        ]);
        let printed = format!("{cfg:?}");
        assert!(!printed.contains("sk-live-abc"));
    }

    #[test]
    fn parse_bool_accepts_common_spellings() {
        for v in ["true", "1", "yes", "Y", "TRUE"] {
            assert_eq!(parse_bool(v), Some(true), "{v}");
        }
        for v in ["false", "0", "no", "N"] {
            assert_eq!(parse_bool(v), Some(false), "{v}");
        }
        assert_eq!(parse_bool("maybe"), None);
    }
}
