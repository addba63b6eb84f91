//! `strata-job` entry point.

use std::process::ExitCode;

use clap::Parser;
use strata_core::{PipelineConfig, init_logging};
use strata_flow::cli::{Cli, Runtime, execute};
use strata_flow::register_all_metrics;

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_format);
    register_all_metrics();

    let config = PipelineConfig::from_env();
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "failed to start async runtime");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(async {
        let app = match Runtime::open(config, cli.storage_url.as_deref()) {
            Ok(app) => app,
            Err(e) => {
                tracing::error!(error = %format!("{e:#}"), "startup failed");
                return ExitCode::FAILURE;
            }
        };
        match execute(cli.command, &app).await {
            Ok(exit) => exit.into(),
            Err(e) => {
                tracing::error!(error = %format!("{e:#}"), "command failed");
                ExitCode::FAILURE
            }
        }
    })
}
