// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Deployment Service
//!
//! Drives deployments through their state machine. Every mutation of one
//! `(application_name, name)` pair runs under the keyed lock for that pair,
//! re-reads the row once the lock is held, and publishes the resulting row on
//! the ETag channel.
//!
//! Quota is reserved with the admission controller before the AM side-car is
//! asked to grow a workload, and released once the workload is gone or has
//! shrunk. An upgrade keeps the previous generation in history until the new
//! one is observed available; a failed upgrade restores the previous
//! generation as latest.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Reconciler behind the `/v1/deployments` API and the monitor

use crate::application::search_index::SearchIndexer;
use crate::domain::deployment::{
    detail_codes, Deployment, DeploymentSpec, DeploymentStatus, ScaleRequest, StatusDetail,
    TerminationPolicy,
};
use crate::domain::error::{codes, AxError, AxResult};
use crate::domain::ids::now_secs;
use crate::domain::platform::{AdmissionController, ApplicationManager, Reservation, WorkloadStatus};
use crate::domain::repository::{DeploymentQuery, DeploymentRepository};
use crate::domain::search_index::{INDEX_TYPE_APPLICATION_NAME, INDEX_TYPE_DEPLOYMENT_NAME};
use crate::infrastructure::cache::CacheClient;
use crate::infrastructure::etag::{publish_change, DeploymentChange};
use crate::infrastructure::heartbeat_registry::{Heartbeat, HeartbeatHandler, HeartbeatRegistry};
use crate::infrastructure::lock::{KeyedLockGroup, KeyedLockGuard};
use crate::infrastructure::retry::{retry, RetryConfig};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const UPGRADE_RETRY_BUDGET: Duration = Duration::from_secs(10 * 60);

use DeploymentStatus::*;

// ============================================================================
// Service Interface
// ============================================================================

/// Body of an object-only update: fields that never reach the side-car.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentUpdate {
    #[serde(default)]
    pub termination_policy: Option<TerminationPolicy>,
    #[serde(default)]
    pub labels: Option<BTreeMap<String, String>>,
}

#[async_trait]
pub trait DeploymentService: Send + Sync {
    /// Create a deployment, or return the existing one when the template is
    /// unchanged, or upgrade it when the template differs.
    async fn create_deployment(&self, spec: DeploymentSpec) -> AxResult<Deployment>;

    /// Overwrite the termination policy and labels of `id`. The template,
    /// status and generation are left alone.
    async fn update_object(&self, id: &str, update: DeploymentUpdate) -> AxResult<Deployment>;

    async fn stop_deployment(&self, id: &str) -> AxResult<Deployment>;

    async fn start_deployment(&self, id: &str) -> AxResult<Deployment>;

    async fn scale_deployment(&self, id: &str, request: ScaleRequest) -> AxResult<Deployment>;

    /// Terminate `id` and drop its latest pointer. The row stays in history.
    async fn delete_deployment(&self, id: &str) -> AxResult<Deployment>;

    /// Latest row with `id`, falling back to history.
    async fn get_deployment(&self, id: &str) -> AxResult<Deployment>;

    async fn list_deployments(&self, query: &DeploymentQuery) -> AxResult<Vec<Deployment>>;

    async fn process_heartbeat(&self, heartbeat: &Heartbeat) -> AxResult<()>;
}

#[derive(Debug, Clone)]
pub struct DeploymentServiceConfig {
    /// When set, every deployment must belong to this application.
    pub application_name: Option<String>,
    /// Budget for the side-car update call of an upgrade.
    pub upgrade_retry: RetryConfig,
}

impl Default for DeploymentServiceConfig {
    fn default() -> Self {
        Self {
            application_name: None,
            upgrade_retry: RetryConfig::connection_failures(UPGRADE_RETRY_BUDGET),
        }
    }
}

fn record(operation: &'static str, result: &AxResult<Deployment>) {
    let outcome = if result.is_ok() { "success" } else { "failure" };
    metrics::counter!(
        "axamm_deployment_operations_total",
        "operation" => operation,
        "outcome" => outcome
    )
    .increment(1);
}

fn terminating_detail() -> StatusDetail {
    StatusDetail::new(detail_codes::TERMINATING, "Deployment will be terminated shortly.")
}

fn terminated_detail() -> StatusDetail {
    StatusDetail::new(detail_codes::TERMINATED, "Deployment is terminated.")
}

// ============================================================================
// Reconciler Core
// ============================================================================

/// State shared by the service and the heartbeat handlers it registers.
pub struct DeploymentReconciler {
    repository: Arc<dyn DeploymentRepository>,
    admission: Arc<dyn AdmissionController>,
    am: Arc<dyn ApplicationManager>,
    cache: Arc<dyn CacheClient>,
    locks: Arc<KeyedLockGroup>,
}

impl DeploymentReconciler {
    async fn lock(&self, key: &str) -> AxResult<KeyedLockGuard> {
        self.locks
            .lock_owned(key)
            .await
            .map_err(|e| AxError::from_cause(e, codes::ERR_INTERNAL, format!("Failed to lock {}", key)))
    }

    async fn publish(&self, d: &Deployment) {
        let change = DeploymentChange {
            id: d.id.clone(),
            name: d.name.clone(),
            status: d.status.to_string(),
            status_detail: serde_json::to_value(&d.status_detail).unwrap_or_default(),
        };
        if let Err(e) = publish_change(self.cache.as_ref(), &change).await {
            warn!(deployment = %d, "Failed to publish deployment change: {}", e);
        }
    }

    /// Save `d` as the latest generation of its name and announce it.
    async fn persist(&self, d: &Deployment) -> AxResult<()> {
        self.repository.save_latest(d).await?;
        self.publish(d).await;
        Ok(())
    }

    async fn reserve(&self, d: &Deployment) -> AxResult<()> {
        let reservation = Reservation::for_deployment(d, d.footprint());
        debug!(
            "Reserving {} cores / {} MiB for {}",
            reservation.cpu_cores, reservation.mem_mib, d
        );
        self.admission.reserve(&reservation).await
    }

    async fn release(&self, d: &Deployment) {
        if let Err(e) = self.admission.release(&d.id).await {
            // The reservation lapses with its TTL.
            warn!(deployment = %d, "Failed to release reservation: {}", e);
        }
    }

    /// Ask the side-car for progress and mark `d` active once every desired
    /// replica is available.
    async fn refresh(&self, d: &mut Deployment) -> AxResult<bool> {
        let status = self.am.status(d).await?;
        self.apply_status(d, status).await
    }

    async fn apply_status(&self, d: &mut Deployment, status: WorkloadStatus) -> AxResult<bool> {
        if !status.is_available() {
            debug!(
                "Deployment {} has {}/{} replicas available",
                d, status.available, status.desired
            );
            return Ok(false);
        }
        if matches!(d.status, Waiting | Upgrading | Error) {
            self.mark_active(d).await?;
        }
        Ok(d.status == Active)
    }

    async fn mark_active(&self, d: &mut Deployment) -> AxResult<()> {
        d.transition(Active, Some(StatusDetail::new(detail_codes::ACTIVE, "Deployment is active.")))?;
        let previous = d.previous_deployment_id.take();
        self.persist(d).await?;
        info!("Deployment {} is active", d);
        if let Some(previous) = previous {
            self.retire(&previous).await;
        }
        Ok(())
    }

    /// Terminate the generation an upgrade replaced.
    async fn retire(&self, previous_id: &str) {
        let mut old = match self.repository.find_history_by_id(previous_id).await {
            Ok(Some(old)) if !old.status.is_terminal() => old,
            Ok(_) => return,
            Err(e) => {
                warn!("Failed to load previous generation {}: {}", previous_id, e);
                return;
            }
        };
        if let Err(e) = self.retire_row(&mut old).await {
            warn!("Failed to retire previous generation {}: {}", old, e);
        }
    }

    async fn retire_row(&self, old: &mut Deployment) -> AxResult<()> {
        old.transition(Terminating, Some(terminating_detail()))?;
        self.repository.save_history(old).await?;
        self.admission.release(&old.id).await?;
        old.transition(Terminated, Some(terminated_detail()))?;
        self.repository.save_history(old).await?;
        info!("Retired previous generation {}", old);
        Ok(())
    }

    /// Apply a status reported through a heartbeat.
    async fn observe(&self, application_name: &str, name: &str, status: WorkloadStatus) -> AxResult<()> {
        let _guard = self.lock(&format!("{}/{}", application_name, name)).await?;
        let Some(mut d) = self.repository.find_latest_by_name(application_name, name).await? else {
            return Ok(());
        };
        self.apply_status(&mut d, status).await?;
        Ok(())
    }
}

/// Handler registered for every deployment's heartbeat key. The heartbeat
/// `data` carries the side-car's `{available, desired}` view of the workload.
pub struct DeploymentHeartbeatHandler {
    reconciler: Arc<DeploymentReconciler>,
}

#[async_trait]
impl HeartbeatHandler for DeploymentHeartbeatHandler {
    async fn handle(&self, heartbeat: &Heartbeat) -> AxResult<()> {
        let Some((application_name, name)) = heartbeat.key.split_once('/') else {
            return Err(AxError::invalid_param(format!(
                "Invalid heartbeat key {}",
                heartbeat.key
            )));
        };
        match serde_json::from_value::<WorkloadStatus>(heartbeat.data.clone()) {
            Ok(status) if status.desired > 0 => {
                self.reconciler.observe(application_name, name, status).await
            }
            _ => Ok(()),
        }
    }
}

// ============================================================================
// Standard Implementation
// ============================================================================

pub struct StandardDeploymentService {
    reconciler: Arc<DeploymentReconciler>,
    heartbeats: Arc<HeartbeatRegistry>,
    search: Option<SearchIndexer>,
    config: DeploymentServiceConfig,
}

impl StandardDeploymentService {
    pub fn new(
        repository: Arc<dyn DeploymentRepository>,
        admission: Arc<dyn AdmissionController>,
        am: Arc<dyn ApplicationManager>,
        cache: Arc<dyn CacheClient>,
        heartbeats: Arc<HeartbeatRegistry>,
        locks: Arc<KeyedLockGroup>,
        config: DeploymentServiceConfig,
    ) -> Self {
        Self {
            reconciler: Arc::new(DeploymentReconciler {
                repository,
                admission,
                am,
                cache,
                locks,
            }),
            heartbeats,
            search: None,
            config,
        }
    }

    pub fn with_search_index(mut self, indexer: SearchIndexer) -> Self {
        self.search = Some(indexer);
        self
    }

    pub fn repository(&self) -> Arc<dyn DeploymentRepository> {
        self.reconciler.repository.clone()
    }

    pub fn admission(&self) -> Arc<dyn AdmissionController> {
        self.reconciler.admission.clone()
    }

    pub fn application_manager(&self) -> Arc<dyn ApplicationManager> {
        self.reconciler.am.clone()
    }

    pub fn heartbeats(&self) -> Arc<HeartbeatRegistry> {
        self.heartbeats.clone()
    }

    /// Register heartbeat handlers for every live row, after a restart.
    pub async fn restore_heartbeats(&self) -> AxResult<usize> {
        let query = DeploymentQuery {
            application_name: self.config.application_name.clone(),
            ..DeploymentQuery::default()
        };
        let rows = self.reconciler.repository.list_latest(&query).await?;
        let mut restored = 0;
        for d in rows.iter().filter(|d| !matches!(d.status, Init | Terminating | Terminated)) {
            self.register_heartbeat(d);
            restored += 1;
        }
        info!("Restored {} heartbeat handlers", restored);
        Ok(restored)
    }

    fn guard_namespace(&self, application_name: &str) -> AxResult<()> {
        match &self.config.application_name {
            Some(expected) if expected != application_name => Err(AxError::invalid_param(format!(
                "Deployment belongs to application {}, but this manager serves {}.",
                application_name, expected
            ))),
            _ => Ok(()),
        }
    }

    fn register_heartbeat(&self, d: &Deployment) {
        let handler = Arc::new(DeploymentHeartbeatHandler {
            reconciler: self.reconciler.clone(),
        });
        self.heartbeats.register(&d.heartbeat_key(), handler);
    }

    fn index(&self, d: &Deployment) {
        if let Some(search) = &self.search {
            search.index(INDEX_TYPE_DEPLOYMENT_NAME, "name", &d.name);
            search.index(INDEX_TYPE_APPLICATION_NAME, "application_name", &d.application_name);
        }
    }

    async fn find_latest(&self, id: &str) -> AxResult<Deployment> {
        self.reconciler
            .repository
            .find_latest_by_id(id)
            .await?
            .ok_or_else(|| AxError::not_found(format!("Deployment {} is not found.", id)))
    }

    /// Lock the row's name and re-read it under the lock.
    async fn locked(&self, id: &str) -> AxResult<(Deployment, KeyedLockGuard)> {
        let d = self.find_latest(id).await?;
        let guard = self.reconciler.lock(&d.key()).await?;
        let d = self.find_latest(id).await?;
        Ok((d, guard))
    }

    // ------------------------------------------------------------------------
    // Operations; callers hold the lock for the deployment's key.
    // ------------------------------------------------------------------------

    async fn run_create(&self, d: &mut Deployment) -> AxResult<()> {
        self.register_heartbeat(d);

        if let Err(e) = self.reconciler.reserve(d).await {
            warn!(deployment = %d, "Failed to reserve resources: {}", e);
            if e.is_client_error() {
                d.transition(Terminated, Some(StatusDetail::from_error(codes::ERR_RESERVING_RESOURCE, &e)))?;
                self.reconciler.persist(d).await?;
                self.heartbeats.unregister(&d.heartbeat_key());
            }
            return Err(e);
        }

        if let Err(e) = self.reconciler.am.create(d).await {
            warn!(deployment = %d, "Failed to create workload: {}", e);
            self.reconciler.release(d).await;
            if e.is_client_error() {
                d.transition(Terminated, Some(StatusDetail::from_error(codes::ERR_CREATING_DEPLOYMENT, &e)))?;
                self.reconciler.persist(d).await?;
                self.heartbeats.unregister(&d.heartbeat_key());
            }
            return Err(e);
        }

        d.transition(Waiting, Some(StatusDetail::new(detail_codes::WAITING, "Deployment is being created.")))?;
        self.reconciler.persist(d).await?;
        info!("Created deployment {}", d);

        if let Err(e) = self.reconciler.refresh(d).await {
            debug!("Status check of {} failed: {}", d, e);
        }
        Ok(())
    }

    async fn run_upgrade(&self, old: Deployment, spec: DeploymentSpec) -> AxResult<Deployment> {
        if !matches!(old.status, Init | Active) {
            return Err(AxError::invalid_param(format!(
                "Can not upgrade the deployment {} with state: {}.",
                old.key(),
                old.status
            )));
        }
        let repository = &self.reconciler.repository;
        let mut next = old.upgrade_to(spec);
        info!("Upgrading {} to {}", old, next.id);

        self.reconciler.reserve(&next).await?;
        repository.save_history(&old).await?;
        self.reconciler.persist(&next).await?;
        self.register_heartbeat(&next);
        self.index(&next);

        let am = &self.reconciler.am;
        let updated = retry(Some(&self.config.upgrade_retry), || am.update(&next)).await;
        match updated {
            Ok(()) => {
                if let Err(e) = self.reconciler.refresh(&mut next).await {
                    debug!("Status check of {} failed: {}", next, e);
                }
                Ok(next)
            }
            Err(e) => {
                warn!("Upgrade of {} failed, restoring {}: {}", next, old, e);
                self.reconciler.release(&next).await;
                let mut restored = old;
                restored.status_detail = StatusDetail::from_error(codes::ERR_UPGRADING_DEPLOYMENT, &e);
                restored.mtime = now_secs();
                self.reconciler.persist(&restored).await?;
                repository.delete_history(&restored).await?;
                Err(e)
            }
        }
    }

    async fn run_stop(&self, d: &mut Deployment) -> AxResult<()> {
        if d.status != Terminating {
            d.transition(Terminating, Some(StatusDetail::new(detail_codes::STOPPING, "Deployment will be stopped shortly.")))?;
            self.reconciler.persist(d).await?;
        }
        if let Err(e) = self.reconciler.am.stop(d).await {
            d.status_detail = StatusDetail::from_error(codes::ERR_STOPPING_DEPLOYMENT, &e);
            self.reconciler.persist(d).await?;
            return Err(e);
        }
        self.reconciler.release(d).await;
        self.heartbeats.unregister(&d.heartbeat_key());
        d.transition(Terminated, Some(StatusDetail::new(detail_codes::STOPPED, "Deployment is stopped.")))?;
        self.reconciler.persist(d).await?;
        info!("Stopped deployment {}", d);
        Ok(())
    }

    /// Tear the workload down and leave `d` terminated as latest.
    async fn run_delete(&self, d: &mut Deployment, detail: Option<StatusDetail>) -> AxResult<()> {
        let prior = d.status;
        if prior.is_terminal() {
            return Ok(());
        }
        if prior != Terminating {
            d.transition(Terminating, Some(detail.clone().unwrap_or_else(terminating_detail)))?;
            self.reconciler.persist(d).await?;
        }
        self.heartbeats.unregister(&d.heartbeat_key());

        if let Err(e) = self.reconciler.am.delete(d).await {
            warn!(deployment = %d, "Failed to delete workload: {}", e);
            d.status_detail = StatusDetail::from_error(codes::ERR_DELETING_DEPLOYMENT, &e);
            self.reconciler.persist(d).await?;
            return Err(e);
        }
        if prior != Init {
            self.reconciler.release(d).await;
        }
        d.transition(Terminated, Some(detail.unwrap_or_else(terminated_detail)))?;
        self.reconciler.persist(d).await?;
        info!("Terminated deployment {}", d);
        Ok(())
    }

    async fn create(&self, spec: DeploymentSpec) -> AxResult<Deployment> {
        spec.validate()?;
        self.guard_namespace(&spec.application_name)?;
        let repository = &self.reconciler.repository;
        let _guard = self
            .reconciler
            .lock(&format!("{}/{}", spec.application_name, spec.name))
            .await?;

        let existing = match repository.find_latest_by_name(&spec.application_name, &spec.name).await? {
            Some(old) if old.status.is_terminal() => {
                debug!("Replacing terminated deployment {}", old);
                repository.save_history(&old).await?;
                repository.remove_latest(&old).await?;
                None
            }
            other => other,
        };

        match existing {
            Some(mut old) if old.status == Init && old.previous_deployment_id.is_none() => {
                old.template = spec.template;
                old.termination_policy = spec.termination_policy.unwrap_or_default();
                old.labels = spec.labels;
                self.reconciler.persist(&old).await?;
                self.run_create(&mut old).await?;
                Ok(old)
            }
            Some(old) if old.same_template(&spec.template) => {
                info!("Deployment {} is already created", old);
                Ok(old)
            }
            Some(old) => self.run_upgrade(old, spec).await,
            None => {
                let mut d = Deployment::new(spec);
                self.reconciler.persist(&d).await?;
                self.index(&d);
                if let Err(e) = self.reconciler.am.ping(&d.application_name).await {
                    info!("Application manager of {} is not up yet, the monitor will create {}: {}", d.application_name, d, e);
                    return Ok(d);
                }
                self.run_create(&mut d).await?;
                Ok(d)
            }
        }
    }

    async fn update_fields(&self, id: &str, update: DeploymentUpdate) -> AxResult<Deployment> {
        let (mut d, _guard) = self.locked(id).await?;
        if let Some(policy) = update.termination_policy {
            d.termination_policy = policy;
        }
        if let Some(labels) = update.labels {
            d.labels = labels;
        }
        d.mtime = now_secs();
        self.reconciler.persist(&d).await?;
        Ok(d)
    }

    async fn scale(&self, id: &str, request: ScaleRequest) -> AxResult<Deployment> {
        request.validate()?;
        let (mut d, _guard) = self.locked(id).await?;
        if d.status != Active {
            return Err(AxError::invalid_param(format!(
                "Can not scale the deployment with state: {}.",
                d.status
            )));
        }

        let before = d.footprint();
        let mut scaled = d.clone();
        scaled.apply_scale(request)?;
        let after = scaled.footprint();
        let grows = after.cpu_cores > before.cpu_cores || after.mem_mib > before.mem_mib;

        if grows {
            self.reconciler.reserve(&scaled).await?;
        }
        if let Err(e) = self.reconciler.am.scale(&scaled, request.replicas()).await {
            warn!(deployment = %d, "Failed to scale workload: {}", e);
            if grows {
                if let Err(e) = self.reconciler.reserve(&d).await {
                    warn!(deployment = %d, "Failed to restore reservation: {}", e);
                }
            }
            d.transition(Error, Some(StatusDetail::from_error(codes::ERR_SCALING_DEPLOYMENT, &e)))?;
            self.reconciler.persist(&d).await?;
            return Err(e);
        }
        if !grows && after != before {
            if let Err(e) = self.reconciler.reserve(&scaled).await {
                warn!(deployment = %scaled, "Failed to shrink reservation: {}", e);
            }
        }

        let mut d = scaled;
        d.transition(Waiting, Some(StatusDetail::new(detail_codes::WAITING, "Deployment is being scaled.")))?;
        self.reconciler.persist(&d).await?;
        if let Err(e) = self.reconciler.refresh(&mut d).await {
            debug!("Status check of {} failed: {}", d, e);
        }
        Ok(d)
    }

    async fn start(&self, id: &str) -> AxResult<Deployment> {
        let (mut d, _guard) = self.locked(id).await?;
        if d.status != Terminated {
            return Err(AxError::invalid_param(format!(
                "Can not start the deployment with state: {}.",
                d.status
            )));
        }
        self.reconciler.reserve(&d).await?;
        self.register_heartbeat(&d);
        if let Err(e) = self.reconciler.am.start(&d).await {
            warn!(deployment = %d, "Failed to start workload: {}", e);
            self.reconciler.release(&d).await;
            self.heartbeats.unregister(&d.heartbeat_key());
            d.status_detail = StatusDetail::from_error(codes::ERR_STARTING_DEPLOYMENT, &e);
            self.reconciler.persist(&d).await?;
            return Err(e);
        }
        d.transition(Waiting, Some(StatusDetail::new(detail_codes::WAITING, "Deployment is being started.")))?;
        self.reconciler.persist(&d).await?;
        if let Err(e) = self.reconciler.refresh(&mut d).await {
            debug!("Status check of {} failed: {}", d, e);
        }
        Ok(d)
    }

    async fn stop(&self, id: &str) -> AxResult<Deployment> {
        let (mut d, _guard) = self.locked(id).await?;
        match d.status {
            Terminated => Ok(d),
            Active => {
                self.run_stop(&mut d).await?;
                Ok(d)
            }
            status => Err(AxError::invalid_param(format!(
                "Can not stop the deployment with state: {}.",
                status
            ))),
        }
    }

    async fn delete(&self, id: &str) -> AxResult<Deployment> {
        let (mut d, _guard) = self.locked(id).await?;
        self.run_delete(&mut d, None).await?;
        let repository = &self.reconciler.repository;
        repository.save_history(&d).await?;
        repository.remove_latest(&d).await?;
        Ok(d)
    }

    // ------------------------------------------------------------------------
    // Monitor entry points; each takes the lock itself.
    // ------------------------------------------------------------------------

    /// Retry the create of an `Init` row, terminating it once `deadline` has
    /// passed since it was created.
    pub async fn retry_create(&self, id: &str, deadline: Duration) -> AxResult<()> {
        let (mut d, _guard) = self.locked(id).await?;
        if d.status != Init {
            return Ok(());
        }
        if now_secs() - d.create_time > deadline.as_secs() as i64 {
            warn!("Deployment {} was not created within {:?}, terminating", d, deadline);
            let detail = StatusDetail::new(
                codes::ERR_CREATING_DEPLOYMENT,
                format!("Deployment was not created within {}.", humanize(deadline)),
            );
            return self.run_delete(&mut d, Some(detail)).await;
        }
        self.reconciler.am.ping(&d.application_name).await?;
        self.run_create(&mut d).await
    }

    /// Poll a `Waiting` or `Upgrading` row, moving it to `Error` once it has
    /// not become available within `deadline`.
    pub async fn check_progress(&self, id: &str, deadline: Duration) -> AxResult<()> {
        let (mut d, _guard) = self.locked(id).await?;
        if !matches!(d.status, Waiting | Upgrading) {
            return Ok(());
        }
        match self.reconciler.refresh(&mut d).await {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(e) => debug!("Status check of {} failed: {}", d, e),
        }
        if now_secs() - d.mtime > deadline.as_secs() as i64 {
            warn!("Deployment {} did not become available within {:?}", d, deadline);
            let detail = StatusDetail::new(
                codes::ERR_DEPLOYMENT_TIMEOUT,
                format!("Deployment did not become available within {}.", humanize(deadline)),
            );
            d.transition(Error, Some(detail))?;
            self.reconciler.persist(&d).await?;
        }
        Ok(())
    }

    /// Mark an `Active` row unhealthy.
    pub async fn mark_unhealthy(&self, id: &str, cause: &AxError) -> AxResult<()> {
        let (mut d, _guard) = self.locked(id).await?;
        if d.status != Active {
            return Ok(());
        }
        d.transition(Error, Some(StatusDetail::from_error(codes::ERR_DEPLOYMENT_UNHEALTHY, cause)))?;
        self.reconciler.persist(&d).await
    }

    /// Bring an `Error` row back to `Active` when the side-car reports it available.
    pub async fn recover(&self, id: &str) -> AxResult<()> {
        let (mut d, _guard) = self.locked(id).await?;
        if d.status != Error {
            return Ok(());
        }
        self.reconciler.refresh(&mut d).await?;
        Ok(())
    }

    /// Terminate a row with `detail`, keeping it as latest.
    pub async fn terminate(&self, id: &str, detail: StatusDetail) -> AxResult<()> {
        let (mut d, _guard) = self.locked(id).await?;
        self.run_delete(&mut d, Some(detail)).await
    }

    /// Finish the stop or delete of a `Terminating` row.
    pub async fn retry_terminating(&self, id: &str) -> AxResult<()> {
        let (mut d, _guard) = self.locked(id).await?;
        if d.status != Terminating {
            return Ok(());
        }
        let stopping = [detail_codes::STOPPING, codes::ERR_STOPPING_DEPLOYMENT]
            .contains(&d.status_detail.code.as_str());
        if stopping {
            self.run_stop(&mut d).await
        } else {
            let detail = (!d.status_detail.is_empty() && d.status_detail.code != codes::ERR_DELETING_DEPLOYMENT)
                .then(|| d.status_detail.clone());
            self.run_delete(&mut d, detail).await
        }
    }
}

fn humanize(duration: Duration) -> String {
    format!("{} minutes", duration.as_secs() / 60)
}

#[async_trait]
impl DeploymentService for StandardDeploymentService {
    async fn create_deployment(&self, spec: DeploymentSpec) -> AxResult<Deployment> {
        let result = self.create(spec).await;
        record("create", &result);
        result
    }

    async fn update_object(&self, id: &str, update: DeploymentUpdate) -> AxResult<Deployment> {
        let result = self.update_fields(id, update).await;
        record("update", &result);
        result
    }

    async fn stop_deployment(&self, id: &str) -> AxResult<Deployment> {
        let result = self.stop(id).await;
        record("stop", &result);
        result
    }

    async fn start_deployment(&self, id: &str) -> AxResult<Deployment> {
        let result = self.start(id).await;
        record("start", &result);
        result
    }

    async fn scale_deployment(&self, id: &str, request: ScaleRequest) -> AxResult<Deployment> {
        let result = self.scale(id, request).await;
        record("scale", &result);
        result
    }

    async fn delete_deployment(&self, id: &str) -> AxResult<Deployment> {
        let result = self.delete(id).await;
        record("delete", &result);
        result
    }

    async fn get_deployment(&self, id: &str) -> AxResult<Deployment> {
        let repository = &self.reconciler.repository;
        if let Some(d) = repository.find_latest_by_id(id).await? {
            return Ok(d);
        }
        repository
            .find_history_by_id(id)
            .await?
            .ok_or_else(|| AxError::not_found(format!("Deployment {} is not found.", id)))
    }

    async fn list_deployments(&self, query: &DeploymentQuery) -> AxResult<Vec<Deployment>> {
        Ok(self.reconciler.repository.list_latest(query).await?)
    }

    async fn process_heartbeat(&self, heartbeat: &Heartbeat) -> AxResult<()> {
        self.heartbeats.process(heartbeat).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::am_client::AmClient;
    use crate::infrastructure::axdb::memory::InMemoryDatabase;
    use crate::infrastructure::axdb::schema::manager_tables;
    use crate::infrastructure::cache::InMemoryCache;
    use crate::infrastructure::etag::ETAG_CHANNEL;
    use crate::infrastructure::repositories::AxdbDeploymentRepository;
    use parking_lot::Mutex;
    use serde_json::{json, Value};

    #[derive(Default)]
    struct Ledger {
        held: Mutex<BTreeMap<String, Reservation>>,
        reject: Mutex<bool>,
    }

    #[async_trait]
    impl AdmissionController for Ledger {
        async fn reserve(&self, reservation: &Reservation) -> AxResult<()> {
            if *self.reject.lock() {
                return Err(AxError::bad_request("not enough cpu"));
            }
            self.held.lock().insert(reservation.resource_id.clone(), reservation.clone());
            Ok(())
        }

        async fn release(&self, resource_id: &str) -> AxResult<()> {
            self.held.lock().remove(resource_id);
            Ok(())
        }
    }

    struct Fixture {
        service: StandardDeploymentService,
        ledger: Arc<Ledger>,
        cache: Arc<InMemoryCache>,
    }

    fn fixture(namespace: Option<&str>) -> Fixture {
        let db = Arc::new(InMemoryDatabase::with_tables(manager_tables()));
        let ledger = Arc::new(Ledger::default());
        let cache = Arc::new(InMemoryCache::new());
        let service = StandardDeploymentService::new(
            Arc::new(AxdbDeploymentRepository::new(db)),
            ledger.clone(),
            Arc::new(AmClient::test_mode()),
            cache.clone(),
            Arc::new(HeartbeatRegistry::new()),
            Arc::new(KeyedLockGroup::new(Duration::from_secs(60))),
            DeploymentServiceConfig {
                application_name: namespace.map(String::from),
                ..Default::default()
            },
        );
        Fixture { service, ledger, cache }
    }

    fn spec(template: Value) -> DeploymentSpec {
        DeploymentSpec {
            application_name: "app-1".into(),
            name: "web".into(),
            template,
            termination_policy: None,
            labels: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_create_reserves_and_activates() {
        let f = fixture(Some("app-1"));
        let d = f
            .service
            .create_deployment(spec(json!({"cpu_cores": 0.5, "mem_mib": 256, "scale": {"min": 2}})))
            .await
            .unwrap();
        assert_eq!(d.status, Active);
        let held = f.ledger.held.lock().get(&d.id).cloned().unwrap();
        assert_eq!((held.cpu_cores, held.mem_mib), (1.0, 512.0));

        let again = f.service.create_deployment(spec(d.template.clone())).await.unwrap();
        assert_eq!(again.id, d.id);

        let published = f.cache.brpop(Duration::from_millis(10), &[ETAG_CHANNEL]).await.unwrap();
        assert!(published.is_some());
    }

    #[tokio::test]
    async fn test_namespace_guard() {
        let f = fixture(Some("other-app"));
        let err = f.service.create_deployment(spec(json!({}))).await.unwrap_err();
        assert!(err.is_code(codes::ERR_API_INVALID_PARAM));
    }

    #[tokio::test]
    async fn test_rejected_reservation_terminates_row() {
        let f = fixture(None);
        *f.ledger.reject.lock() = true;
        let err = f.service.create_deployment(spec(json!({"cpu_cores": 64}))).await.unwrap_err();
        assert!(err.is_client_error());

        let rows = f.service.list_deployments(&DeploymentQuery::application("app-1")).await.unwrap();
        assert_eq!(rows[0].status, Terminated);
        assert_eq!(rows[0].status_detail.code, codes::ERR_RESERVING_RESOURCE);
    }

    #[tokio::test]
    async fn test_scale_requires_active_and_resizes_reservation() {
        let f = fixture(None);
        let d = f.service.create_deployment(spec(json!({"cpu_cores": 1}))).await.unwrap();
        let scaled = f
            .service
            .scale_deployment(&d.id, ScaleRequest { min: 3, max: None, desired: None })
            .await
            .unwrap();
        assert_eq!(scaled.scale().min, 3);
        assert_eq!(scaled.status, Active);
        assert_eq!(f.ledger.held.lock()[&d.id].cpu_cores, 3.0);

        f.service.stop_deployment(&d.id).await.unwrap();
        let err = f
            .service
            .scale_deployment(&d.id, ScaleRequest { min: 1, max: None, desired: None })
            .await
            .unwrap_err();
        assert!(err.is_code(codes::ERR_API_INVALID_PARAM));
    }

    #[tokio::test]
    async fn test_stop_start_cycle() {
        let f = fixture(None);
        let d = f.service.create_deployment(spec(json!({"cpu_cores": 1}))).await.unwrap();

        let stopped = f.service.stop_deployment(&d.id).await.unwrap();
        assert_eq!(stopped.status, Terminated);
        assert_eq!(stopped.status_detail.code, detail_codes::STOPPED);
        assert!(f.ledger.held.lock().is_empty());

        let started = f.service.start_deployment(&d.id).await.unwrap();
        assert_eq!(started.status, Active);
        assert!(f.ledger.held.lock().contains_key(&d.id));
    }

    #[tokio::test]
    async fn test_delete_moves_row_to_history() {
        let f = fixture(None);
        let d = f.service.create_deployment(spec(json!({"cpu_cores": 1}))).await.unwrap();
        let deleted = f.service.delete_deployment(&d.id).await.unwrap();
        assert_eq!(deleted.status, Terminated);
        assert!(f.ledger.held.lock().is_empty());

        let fetched = f.service.get_deployment(&d.id).await.unwrap();
        assert_eq!(fetched.status, Terminated);
        assert!(f
            .service
            .list_deployments(&DeploymentQuery::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_update_object_keeps_template() {
        let f = fixture(None);
        let d = f.service.create_deployment(spec(json!({"cpu_cores": 1}))).await.unwrap();
        let mut labels = BTreeMap::new();
        labels.insert("tier".to_string(), "web".to_string());
        let updated = f
            .service
            .update_object(
                &d.id,
                DeploymentUpdate {
                    termination_policy: Some(TerminationPolicy {
                        time_seconds: "3600".into(),
                        spending_cents: String::new(),
                    }),
                    labels: Some(labels.clone()),
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.id, d.id);
        assert_eq!(updated.labels, labels);
        assert_eq!(updated.termination_policy.time_limit(), Some(3600.0));
        assert_eq!(updated.template, d.template);
    }

    #[tokio::test]
    async fn test_restore_heartbeats_skips_terminated_rows() {
        let f = fixture(None);
        let live = f.service.create_deployment(spec(json!({"cpu_cores": 1}))).await.unwrap();
        *f.ledger.reject.lock() = true;
        let mut rejected = spec(json!({"cpu_cores": 64}));
        rejected.name = "batch".into();
        f.service.create_deployment(rejected).await.unwrap_err();

        let heartbeats = f.service.heartbeats();
        heartbeats.unregister(&live.heartbeat_key());
        assert!(!heartbeats.is_registered(&live.heartbeat_key()));

        assert_eq!(f.service.restore_heartbeats().await.unwrap(), 1);
        assert!(heartbeats.is_registered(&live.heartbeat_key()));
    }
}
