//! # strata-flow
//!
//! Job execution for the strata pipeline.
//!
//! - [`JobRunner`]: lease-locked job execution with exit-code mapping
//! - [`IngestionRunner`]: bounded worker pool over changed source objects,
//!   driving watermarks, blacklist, and run checkpoint
//! - [`GatewayClient`]: provider HTTP client behind warm-up and readiness
//!   gates, with a typed error taxonomy
//! - [`JobTrigger`]: idempotent start of downstream jobs through the control
//!   plane
//!
//! The `strata-job` binary wires these together; see [`cli`].

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]
// Command output goes to stdout
#![allow(clippy::print_stdout)]

pub mod backoff;
pub mod cli;
pub mod error;
pub mod gateway;
pub mod ingest;
pub mod metrics;
pub mod runner;
pub mod trigger;

pub use error::{FlowError, GatewayError, GatewayErrorKind, Result, TriggerError};
pub use gateway::{CallerIdentity, GateState, GatewayClient};
pub use ingest::{IngestReport, IngestionRunner, Outcome, SourceItem, SourceProcessor};
pub use runner::{JobContext, JobExit, JobRun, JobRunner};
pub use trigger::{JobTrigger, StartOutcome, TriggerReport};

/// Registers metric descriptions for every strata crate.
pub fn register_all_metrics() {
    strata_core::metrics::register_metrics();
    strata_table::metrics::register_metrics();
    metrics::register_metrics();
}
