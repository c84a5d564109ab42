// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// labelspool: managed print spool for network thermal label printers.
//
// Entry point. Loads configuration, initialises logging, starts the backend
// services and runs until interrupted.

mod services;

use std::path::PathBuf;
use std::process::ExitCode;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use labelspool_core::config::{LogFormat, LoggingConfig};
use labelspool_core::error::Result;
use labelspool_core::SpoolConfig;

use services::spool_services::SpoolServices;

#[tokio::main]
async fn main() -> ExitCode {
    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            // Logging is configured from the config, so this goes to stderr.
            eprintln!("labelspool: {e}");
            return ExitCode::from(2);
        }
    };
    init_logging(&config.logging);

    info!(version = env!("CARGO_PKG_VERSION"), "labelspool starting");
    match run(&config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "labelspool stopped with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: &SpoolConfig) -> Result<()> {
    let mut services = SpoolServices::init(config)?;
    if let Err(e) = services.start() {
        services.shutdown().await;
        return Err(e);
    }

    let signal = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
    services.shutdown().await;
    signal?;
    Ok(())
}

/// `SPOOL_CONFIG`, else the first command-line argument.
fn config_path() -> Option<PathBuf> {
    std::env::var_os("SPOOL_CONFIG")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| std::env::args_os().nth(1).map(PathBuf::from))
}

fn load_config() -> Result<SpoolConfig> {
    let mut config = match config_path() {
        Some(path) => SpoolConfig::load(path)?,
        None => SpoolConfig::default(),
    };
    config.apply_env()?;
    config.validate()?;
    Ok(config)
}

/// `RUST_LOG` takes precedence over the configured level.
fn init_logging(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    match logging.format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }
}
