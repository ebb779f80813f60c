// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # AX Application/Deployment Manager
//!
//! The `axamm` binary hosts the three long-running processes of the
//! deployment platform.
//!
//! ## Commands
//!
//! - `axamm manager` - Deployment API, reconciler loops and heartbeat intake
//! - `axamm notifier` - Notification dispatcher and channel workers
//! - `axamm pod-agent` - Authenticated pod proxy on port 24368
//!
//! Every flag can also be set through the environment; a `.env` file in the
//! working directory is loaded first.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

mod commands;

use commands::{ManagerArgs, NotifierArgs, PodAgentArgs};

/// AX platform deployment manager
#[derive(Parser)]
#[command(name = "axamm")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "AXAMM_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, global = true, env = "AXAMM_LOG_FORMAT", value_enum, default_value_t = LogFormat::Compact)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Compact,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the deployment manager
    #[command(name = "manager")]
    Manager(ManagerArgs),

    /// Run the notification dispatcher
    #[command(name = "notifier")]
    Notifier(NotifierArgs),

    /// Run the pod proxy agent
    #[command(name = "pod-agent")]
    PodAgent(PodAgentArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine; the environment is the primary source.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    init_logging(&cli.log_level, cli.log_format)?;

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    match cli.command {
        Commands::Manager(args) => commands::manager::run(args, cancel).await,
        Commands::Notifier(args) => commands::notifier::run(args, cancel).await,
        Commands::PodAgent(args) => commands::pod_agent::run(args, cancel).await,
    }
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str, format: LogFormat) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    match format {
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Json => builder.json().init(),
    }

    Ok(())
}

/// Cancel `cancel` on SIGINT or SIGTERM.
async fn cancel_on_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
    cancel.cancel();
}
