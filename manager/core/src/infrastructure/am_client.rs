// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # AM Side-car Client
//!
//! Talks to the application manager running beside every application. The
//! base URL is derived from the application name through a template whose
//! `{app}` placeholder is substituted, `http://axam.{app}:8968/v1` by default.
//! Workloads are addressed by deployment name, which is stable across
//! upgrades.
//!
//! In test mode every call succeeds without touching the network and the
//! reported status is always fully available.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure Layer
//! - **Purpose:** Implements [`ApplicationManager`]

use crate::domain::deployment::Deployment;
use crate::domain::error::{codes, AxResult};
use crate::domain::platform::{ApplicationManager, WorkloadStatus};
use crate::infrastructure::rest_client::RestClient;
use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::Method;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

pub const DEFAULT_AM_URL_TEMPLATE: &str = "http://axam.{app}:8968/v1";
pub const AM_CALL_BUDGET: Duration = Duration::from_secs(5 * 60);

pub struct AmClient {
    url_template: String,
    timeout: Duration,
    test_mode: bool,
    clients: DashMap<String, RestClient>,
}

impl AmClient {
    pub fn new(url_template: impl Into<String>) -> Self {
        Self {
            url_template: url_template.into(),
            timeout: AM_CALL_BUDGET,
            test_mode: false,
            clients: DashMap::new(),
        }
    }

    /// Client whose every call succeeds.
    pub fn test_mode() -> Self {
        Self {
            test_mode: true,
            ..Self::new(DEFAULT_AM_URL_TEMPLATE)
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn base_url(&self, application_name: &str) -> String {
        self.url_template.replace("{app}", application_name)
    }

    fn client(&self, application_name: &str) -> AxResult<RestClient> {
        if let Some(client) = self.clients.get(application_name) {
            return Ok(client.clone());
        }
        let client = RestClient::new(self.base_url(application_name), self.timeout)?;
        self.clients.insert(application_name.to_string(), client.clone());
        Ok(client)
    }

    async fn call(
        &self,
        application_name: &str,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> AxResult<Value> {
        let client = self.client(application_name)?;
        client.send(method, path, &[], body).await
    }

    fn deployment_path(deployment: &Deployment, action: Option<&str>) -> String {
        match action {
            Some(action) => format!("deployments/{}/{}", deployment.name, action),
            None => format!("deployments/{}", deployment.name),
        }
    }
}

#[async_trait]
impl ApplicationManager for AmClient {
    async fn ping(&self, application_name: &str) -> AxResult<()> {
        if self.test_mode {
            return Ok(());
        }
        self.call(application_name, Method::GET, "ping", None).await?;
        Ok(())
    }

    async fn create(&self, deployment: &Deployment) -> AxResult<()> {
        if self.test_mode {
            return Ok(());
        }
        let body = serde_json::to_value(deployment)?;
        self.call(&deployment.application_name, Method::POST, "deployments", Some(&body))
            .await?;
        info!("Created deployment {} in the application manager", deployment);
        Ok(())
    }

    async fn update(&self, deployment: &Deployment) -> AxResult<()> {
        if self.test_mode {
            return Ok(());
        }
        let body = serde_json::to_value(deployment)?;
        let path = Self::deployment_path(deployment, None);
        self.call(&deployment.application_name, Method::PUT, &path, Some(&body))
            .await?;
        Ok(())
    }

    async fn scale(&self, deployment: &Deployment, replicas: u32) -> AxResult<()> {
        if self.test_mode {
            return Ok(());
        }
        let body = json!({ "min": replicas });
        let path = Self::deployment_path(deployment, Some("scale"));
        self.call(&deployment.application_name, Method::POST, &path, Some(&body))
            .await?;
        Ok(())
    }

    async fn stop(&self, deployment: &Deployment) -> AxResult<()> {
        if self.test_mode {
            return Ok(());
        }
        let path = Self::deployment_path(deployment, Some("stop"));
        self.call(&deployment.application_name, Method::POST, &path, None).await?;
        Ok(())
    }

    async fn start(&self, deployment: &Deployment) -> AxResult<()> {
        if self.test_mode {
            return Ok(());
        }
        let path = Self::deployment_path(deployment, Some("start"));
        self.call(&deployment.application_name, Method::POST, &path, None).await?;
        Ok(())
    }

    async fn delete(&self, deployment: &Deployment) -> AxResult<()> {
        if self.test_mode {
            return Ok(());
        }
        let path = Self::deployment_path(deployment, None);
        match self.call(&deployment.application_name, Method::DELETE, &path, None).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_code(codes::ERR_NOT_FOUND) => {
                debug!("Deployment {} is already gone from the application manager", deployment);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn status(&self, deployment: &Deployment) -> AxResult<WorkloadStatus> {
        if self.test_mode {
            let replicas = deployment.scale().instances();
            return Ok(WorkloadStatus {
                available: replicas,
                desired: replicas,
                cost_cents: None,
            });
        }
        let path = Self::deployment_path(deployment, Some("status"));
        let value = self.call(&deployment.application_name, Method::GET, &path, None).await?;
        Ok(serde_json::from_value(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::deployment::DeploymentSpec;
    use std::collections::BTreeMap;

    fn deployment() -> Deployment {
        Deployment::new(DeploymentSpec {
            application_name: "app-1".into(),
            name: "d1".into(),
            template: json!({"cpu_cores": 1.0, "mem_mib": 512}),
            termination_policy: None,
            labels: BTreeMap::new(),
        })
    }

    #[test]
    fn test_url_template() {
        let client = AmClient::new(DEFAULT_AM_URL_TEMPLATE);
        assert_eq!(client.base_url("app-1"), "http://axam.app-1:8968/v1");
    }

    #[tokio::test]
    async fn test_lifecycle_calls() {
        let mut server = mockito::Server::new_async().await;
        let create = server
            .mock("POST", "/v1/deployments")
            .with_status(201)
            .create_async()
            .await;
        let scale = server
            .mock("POST", "/v1/deployments/d1/scale")
            .match_body(mockito::Matcher::Json(json!({"min": 3})))
            .with_status(200)
            .create_async()
            .await;
        let status = server
            .mock("GET", "/v1/deployments/d1/status")
            .with_status(200)
            .with_body(r#"{"available": 1, "desired": 3}"#)
            .create_async()
            .await;
        server
            .mock("DELETE", "/v1/deployments/d1")
            .with_status(404)
            .create_async()
            .await;

        let client = AmClient::new(format!("{}/v1", server.url()));
        let d = deployment();
        client.create(&d).await.unwrap();
        client.scale(&d, 3).await.unwrap();
        let reported = client.status(&d).await.unwrap();
        assert!(!reported.is_available());
        client.delete(&d).await.unwrap();

        create.assert_async().await;
        scale.assert_async().await;
        status.assert_async().await;
    }

    #[tokio::test]
    async fn test_mode_short_circuits() {
        let client = AmClient::test_mode();
        let d = deployment();
        client.ping("app-1").await.unwrap();
        client.create(&d).await.unwrap();
        assert!(client.status(&d).await.unwrap().is_available());
    }
}
