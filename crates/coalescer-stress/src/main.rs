//! Stress test for the coalescing caches.
//!
//! Every workload drives its own [`AsyncMruCache`](coalescer_cache::AsyncMruCache) with a
//! simulated computation for the configured duration, and reports throughput and latency
//! percentiles at the end.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use coalescer_cache::metrics;

use crate::config::Config;
use crate::workloads::WorkloadsConfig;

mod config;
mod logging;
mod stresstest;
mod workloads;

/// Command line interface parser.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the workload definition file.
    #[arg(long, short, value_name = "FILE")]
    workloads: PathBuf,

    /// Duration of the stresstest.
    #[arg(long, short, value_parser = humantime::parse_duration, default_value = "10s")]
    duration: Duration,
}

fn main() {
    match execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}

fn execute() -> Result<()> {
    let cli = Cli::parse();

    // parse configs
    let config = Config::get(cli.config.as_deref()).context("failed loading config")?;
    let workloads = WorkloadsConfig::get(&cli.workloads)?;

    // SAFETY: The runtime has not been started yet, so this is still single-threaded.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        metrics::configure_statsd(
            &config.metrics.prefix,
            statsd.as_str(),
            config.metrics.custom_tags.clone(),
        )
        .context("failed to set up metrics")?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("coalescer-stress")
        .enable_all()
        .build()
        .context("failed to start the runtime")?;

    runtime.block_on(stresstest::perform_stresstest(
        config,
        workloads,
        cli.duration,
    ))
}
