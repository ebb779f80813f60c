// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Deployment Monitor
//!
//! Background loops that keep persisted deployments converging:
//!
//! - the **monitor** scans every non-terminal row once a minute and retries
//!   whatever the row is waiting on,
//! - the **resource extender** renews admission reservations before their
//!   TTL lapses,
//! - the **heartbeat emitter** reports this manager to the upstream AMM.
//!
//! All mutations go through [`StandardDeploymentService`], which takes the
//! per-deployment lock.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Periodic reconciliation of deployment rows

use crate::application::deployment_service::StandardDeploymentService;
use crate::domain::deployment::{Deployment, DeploymentStatus, StatusDetail};
use crate::domain::error::AxResult;
use crate::domain::ids::now_secs;
use crate::domain::platform::Reservation;
use crate::domain::repository::DeploymentQuery;
use crate::infrastructure::heartbeat_registry::Heartbeat;
use crate::infrastructure::rest_client::RestClient;
use dashmap::DashMap;
use reqwest::Method;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Restrict scans to one application.
    pub application_name: Option<String>,
    pub scan_interval: Duration,
    /// Age after which an `Init` row that still can not be created is terminated.
    pub create_deadline: Duration,
    /// Time a `Waiting` or `Upgrading` row may take to become available.
    pub progress_deadline: Duration,
    /// Heartbeat silence after which the side-car is pinged directly.
    pub heartbeat_grace: Duration,
    /// Consecutive failed pings that mark an active row unhealthy.
    pub ping_failure_threshold: u32,
    pub extend_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            application_name: None,
            scan_interval: Duration::from_secs(60),
            create_deadline: Duration::from_secs(30 * 60),
            progress_deadline: Duration::from_secs(30 * 60),
            heartbeat_grace: Duration::from_secs(5 * 60),
            ping_failure_threshold: 3,
            extend_interval: Duration::from_secs(20 * 60),
        }
    }
}

pub struct DeploymentMonitor {
    service: Arc<StandardDeploymentService>,
    ping_failures: DashMap<String, u32>,
    config: MonitorConfig,
}

impl DeploymentMonitor {
    pub fn new(service: Arc<StandardDeploymentService>, config: MonitorConfig) -> Self {
        Self {
            service,
            ping_failures: DashMap::new(),
            config,
        }
    }

    fn query(&self, statuses: &[DeploymentStatus]) -> DeploymentQuery {
        DeploymentQuery {
            application_name: self.config.application_name.clone(),
            ..DeploymentQuery::default()
        }
        .with_statuses(statuses)
    }

    /// One pass over every non-terminal row. Returns the number of rows visited.
    pub async fn scan(&self) -> AxResult<usize> {
        use DeploymentStatus::*;
        let query = self.query(&[Init, Waiting, Active, Error, Terminating, Upgrading]);
        let rows = self.service.repository().list_latest(&query).await?;
        debug!("Deployment monitor found {} deployments", rows.len());
        // counters of rows that left the scan set (stopped, deleted) are dropped
        self.ping_failures.retain(|id, _| rows.iter().any(|d| &d.id == id));
        for d in &rows {
            if let Err(e) = self.inspect(d).await {
                warn!(deployment = %d, "Failed to reconcile deployment: {}", e);
            }
        }
        metrics::counter!("axamm_monitor_scans_total").increment(1);
        Ok(rows.len())
    }

    async fn inspect(&self, d: &Deployment) -> AxResult<()> {
        if self.enforce_termination_policy(d).await? {
            return Ok(());
        }
        match d.status {
            DeploymentStatus::Init => self.service.retry_create(&d.id, self.config.create_deadline).await,
            DeploymentStatus::Waiting | DeploymentStatus::Upgrading => {
                self.service.check_progress(&d.id, self.config.progress_deadline).await
            }
            DeploymentStatus::Active | DeploymentStatus::Error => self.check_health(d).await,
            DeploymentStatus::Terminating => self.service.retry_terminating(&d.id).await,
            DeploymentStatus::Terminated => Ok(()),
        }
    }

    async fn enforce_termination_policy(&self, d: &Deployment) -> AxResult<bool> {
        let policy = &d.termination_policy;
        if policy.time_limit().is_none() && policy.spending_limit().is_none() {
            return Ok(false);
        }
        let cost = if policy.spending_limit().is_some() && d.status != DeploymentStatus::Init {
            match self.service.application_manager().status(d).await {
                Ok(status) => status.cost_cents.unwrap_or_default(),
                Err(e) => {
                    debug!("Cost of {} is unknown: {}", d, e);
                    0.0
                }
            }
        } else {
            0.0
        };
        let Some(code) = d.should_terminate(cost, now_secs()) else {
            return Ok(false);
        };
        info!("Deployment {} exceeded its termination policy: {}", d, code);
        let detail = StatusDetail::new(code, "Deployment exceeded its termination policy.");
        self.service.terminate(&d.id, detail).await?;
        Ok(true)
    }

    fn heartbeat_is_fresh(&self, d: &Deployment) -> bool {
        let grace = self.config.heartbeat_grace.as_secs() as i64;
        self.service
            .heartbeats()
            .freshness(&d.heartbeat_key())
            .is_some_and(|fresh| now_secs() - fresh < grace)
    }

    async fn check_health(&self, d: &Deployment) -> AxResult<()> {
        if self.heartbeat_is_fresh(d) {
            self.ping_failures.remove(&d.id);
            return Ok(());
        }
        match self.service.application_manager().ping(&d.application_name).await {
            Ok(()) => {
                self.ping_failures.remove(&d.id);
                if d.status == DeploymentStatus::Error {
                    self.service.recover(&d.id).await?;
                }
                Ok(())
            }
            Err(e) => {
                let failures = {
                    let mut count = self.ping_failures.entry(d.id.clone()).or_insert(0);
                    *count += 1;
                    *count
                };
                warn!(
                    "Application manager of {} did not answer ({} consecutive): {}",
                    d, failures, e
                );
                if failures >= self.config.ping_failure_threshold {
                    self.service.mark_unhealthy(&d.id, &e).await?;
                }
                Ok(())
            }
        }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("Deployment monitor started (every {:?})", self.config.scan_interval);
        let mut ticker = tokio::time::interval(self.config.scan_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.scan().await {
                        warn!("Deployment monitor pass failed: {}", e);
                    }
                }
            }
        }
        info!("Deployment monitor stopped");
    }

    /// Renew the reservation of every row that holds one.
    pub async fn extend_reservations(&self) -> AxResult<usize> {
        use DeploymentStatus::*;
        let rows = self
            .service
            .repository()
            .list_latest(&self.query(&[Waiting, Active, Error, Upgrading]))
            .await?;
        let admission = self.service.admission();
        let mut extended = 0;
        for d in &rows {
            match admission.reserve(&Reservation::for_deployment(d, d.footprint())).await {
                Ok(()) => extended += 1,
                Err(e) => warn!(deployment = %d, "Failed to extend reservation: {}", e),
            }
        }
        debug!("Extended {} of {} reservations", extended, rows.len());
        Ok(extended)
    }

    pub async fn run_extender(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.extend_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.extend_reservations().await {
                        warn!("Resource extender pass failed: {}", e);
                    }
                }
            }
        }
        info!("Resource extender stopped");
    }
}

// ============================================================================
// Heartbeat Emitter
// ============================================================================

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Reports `application_name` and a per-status count of its deployments to
/// the upstream AMM.
pub struct HeartbeatEmitter {
    client: RestClient,
    application_name: String,
    service: Arc<StandardDeploymentService>,
}

impl HeartbeatEmitter {
    pub fn new(client: RestClient, application_name: impl Into<String>, service: Arc<StandardDeploymentService>) -> Self {
        Self {
            client,
            application_name: application_name.into(),
            service,
        }
    }

    pub async fn heartbeat(&self) -> AxResult<Heartbeat> {
        let rows = self
            .service
            .repository()
            .list_latest(&DeploymentQuery::application(&self.application_name))
            .await?;
        let mut counts: BTreeMap<&str, u32> = BTreeMap::new();
        for d in &rows {
            *counts.entry(d.status.as_str()).or_default() += 1;
        }
        Ok(Heartbeat {
            date: now_secs(),
            key: self.application_name.clone(),
            data: json!({ "deployments": counts }),
            origin_bytes: None,
        })
    }

    pub async fn emit(&self) -> AxResult<()> {
        let heartbeat = self.heartbeat().await?;
        let body = serde_json::to_value(&heartbeat)?;
        self.client.send(Method::POST, "heartbeats", &[], Some(&body)).await?;
        debug!("Sent heartbeat of {} to the AMM", self.application_name);
        Ok(())
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.emit().await {
                        warn!("Failed to send heartbeat of {} to the AMM: {}", self.application_name, e);
                    }
                }
            }
        }
        info!("Heartbeat emitter stopped");
    }
}
