// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Platform Ports
//!
//! Collaborators the deployment reconciler drives: the admission controller
//! that holds cluster quota, and the per-application AM side-car that owns the
//! workload on the container scheduler.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Ports implemented by `crate::infrastructure::{admission_client, am_client}`

use crate::domain::deployment::{Deployment, Footprint};
use crate::domain::error::AxResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub const CATEGORY_DEPLOYMENT: &str = "deployment";
pub const RESERVATION_TTL: Duration = Duration::from_secs(2 * 60 * 60);

/// Body of `PUT adc/resource`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub category: String,
    pub resource_id: String,
    /// Seconds.
    pub ttl: u64,
    pub cpu_cores: f64,
    pub mem_mib: f64,
    #[serde(default)]
    pub detail: BTreeMap<String, String>,
}

impl Reservation {
    /// Quota held for a deployment row, keyed by its row id.
    pub fn for_deployment(deployment: &Deployment, footprint: Footprint) -> Self {
        let mut detail = BTreeMap::new();
        detail.insert("name".to_string(), deployment.name.clone());
        detail.insert("app".to_string(), deployment.application_name.clone());
        Self {
            category: CATEGORY_DEPLOYMENT.to_string(),
            resource_id: deployment.id.clone(),
            ttl: RESERVATION_TTL.as_secs(),
            cpu_cores: footprint.cpu_cores,
            mem_mib: footprint.mem_mib,
            detail,
        }
    }
}

#[async_trait]
pub trait AdmissionController: Send + Sync {
    /// Create or renew a reservation. Idempotent per `resource_id`.
    async fn reserve(&self, reservation: &Reservation) -> AxResult<()>;

    /// Drop a reservation. Releasing an unknown id succeeds.
    async fn release(&self, resource_id: &str) -> AxResult<()>;
}

/// Replica counts reported by the side-car.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkloadStatus {
    #[serde(default)]
    pub available: u32,
    #[serde(default)]
    pub desired: u32,
    #[serde(default)]
    pub cost_cents: Option<f64>,
}

impl WorkloadStatus {
    pub fn is_available(&self) -> bool {
        self.available >= self.desired
    }
}

/// The AM side-car of one application.
#[async_trait]
pub trait ApplicationManager: Send + Sync {
    async fn ping(&self, application_name: &str) -> AxResult<()>;

    async fn create(&self, deployment: &Deployment) -> AxResult<()>;

    async fn update(&self, deployment: &Deployment) -> AxResult<()>;

    async fn scale(&self, deployment: &Deployment, replicas: u32) -> AxResult<()>;

    async fn stop(&self, deployment: &Deployment) -> AxResult<()>;

    async fn start(&self, deployment: &Deployment) -> AxResult<()>;

    /// Remove the workload. A workload that is already gone is not an error.
    async fn delete(&self, deployment: &Deployment) -> AxResult<()>;

    async fn status(&self, deployment: &Deployment) -> AxResult<WorkloadStatus>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::deployment::DeploymentSpec;
    use serde_json::json;

    #[test]
    fn test_reservation_for_deployment() {
        let d = Deployment::new(DeploymentSpec {
            application_name: "app-1".into(),
            name: "d1".into(),
            template: json!({}),
            termination_policy: None,
            labels: BTreeMap::new(),
        });
        let r = Reservation::for_deployment(&d, d.footprint());
        assert_eq!(r.resource_id, d.id);
        assert_eq!(r.ttl, 7200);
        assert_eq!(r.cpu_cores, 0.0);
        assert_eq!(r.detail.get("app").map(String::as_str), Some("app-1"));
    }
}
