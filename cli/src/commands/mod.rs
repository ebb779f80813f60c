// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Subcommand implementations.
//!
//! Each subcommand owns its argument struct and a `run` entry point that
//! returns once the root cancellation token fires and every background task
//! has drained.

pub mod manager;
pub mod notifier;
pub mod pod_agent;

pub use manager::ManagerArgs;
pub use notifier::NotifierArgs;
pub use pod_agent::PodAgentArgs;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Install the Prometheus recorder, serving `/metrics` on `addr` when given.
pub(crate) fn init_metrics(addr: Option<SocketAddr>) -> Result<()> {
    let Some(addr) = addr else {
        return Ok(());
    };
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    metrics::describe_counter!("axamm_monitor_scans_total", "Deployment monitor scans");
    metrics::describe_counter!("axamm_notifications_dispatched_total", "Events routed by the dispatcher");
    metrics::describe_counter!("axamm_task_restarts_total", "Supervised tasks restarted after a panic");
    metrics::describe_counter!("axamm_task_failures_total", "One-shot tasks that panicked");
    tracing::info!("Metrics exporter listening on {}", addr);
    Ok(())
}
