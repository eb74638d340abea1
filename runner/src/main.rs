//! Runs one typing and deduplication pass over the streams of a configured catalog.

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};

use crate::config::load_runner_config;
use crate::core::run_pass;

mod config;
mod core;

#[derive(Debug, Parser)]
#[command(version, about = "Types and deduplicates raw tables into final tables")]
struct Args {
    /// Catalog file to use instead of the configured `catalog_path`.
    #[arg(long)]
    catalog: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut runner_config = load_runner_config()?;
    if let Some(catalog) = args.catalog {
        runner_config.catalog_path = catalog;
    }

    let _log_flusher = telemetry::init_tracing(env!("CARGO_BIN_NAME"))?;

    let report = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run_pass(runner_config))?;

    if report.has_failures() {
        error!(%report, "pass finished with failed streams");
        anyhow::bail!(
            "{} of {} streams failed",
            report.failed_streams().count(),
            report.streams.len()
        );
    }

    info!(%report, "pass finished");

    Ok(())
}
