mod app;
mod boundary;
mod collector;
mod config;
mod entity;
mod error;
mod filter;
mod pipeline;
mod sinks;
mod storage;
mod stream;
mod utils;

use anyhow::{Context, Result};
use clap::Parser;
use std::fs::File;
use std::process::ExitCode;
use std::sync::Mutex;
use tracing::Dispatch;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;

use app::Cli;
use utils::Diagnostics;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let dispatch = match build_dispatch(&cli) {
        Ok(dispatch) => dispatch,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            return ExitCode::FAILURE;
        }
    };
    let diagnostics = Diagnostics::new(dispatch, true);

    diagnostics.in_scope(|| {
        let start = std::time::Instant::now();
        match execute(&cli, &diagnostics) {
            Ok(()) => {
                tracing::info!("Finished in {:.2}s", start.elapsed().as_secs_f64());
                ExitCode::SUCCESS
            }
            Err(err) => {
                tracing::error!("{:#}", err);
                ExitCode::FAILURE
            }
        }
    })
}

fn execute(cli: &Cli, diagnostics: &Diagnostics) -> Result<()> {
    if let Some(threads) = cli.threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .context("CLI: Failed to initialize thread pool")?;
    }
    app::run(cli, diagnostics)
}

/// Console layer (warn, or info with --verbose, `RUST_LOG` overrides) plus a
/// debug-level log file. Returned as a dispatcher instead of being installed
/// globally.
fn build_dispatch(cli: &Cli) -> Result<Dispatch> {
    let level = if cli.verbose {
        tracing::Level::INFO
    } else {
        tracing::Level::WARN
    };

    let log_file = File::create(&cli.log_file)
        .with_context(|| format!("CLI: Failed to create log file {:?}", cli.log_file))?;

    let console = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        );
    let file = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(Mutex::new(log_file))
        .with_filter(LevelFilter::DEBUG);

    Ok(Dispatch::new(
        tracing_subscriber::registry().with(console).with(file),
    ))
}
