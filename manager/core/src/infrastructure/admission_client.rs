// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Admission Client
//!
//! HTTP adapter for the admission controller (ADC) that holds cluster quota.
//!
//! - `PUT {root}/adc/resource` creates or renews a [`Reservation`];
//! - `DELETE {root}/adc/resource/{id}` releases it; 404 counts as released.
//!
//! Both calls are retried on connection failures for up to ten minutes, each
//! attempt bounded by a one minute timeout.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure Layer
//! - **Purpose:** Implements [`AdmissionController`]

use crate::domain::error::{codes, AxResult};
use crate::domain::platform::{AdmissionController, Reservation};
use crate::infrastructure::rest_client::RestClient;
use crate::infrastructure::retry::RetryConfig;
use async_trait::async_trait;
use reqwest::Method;
use std::time::Duration;
use tracing::{debug, info};

pub const ADMISSION_CALL_TIMEOUT: Duration = Duration::from_secs(60);
pub const ADMISSION_RETRY_BUDGET: Duration = Duration::from_secs(10 * 60);

pub struct AdmissionClient {
    rest: RestClient,
    retry: RetryConfig,
}

impl AdmissionClient {
    pub fn new(root: &str) -> AxResult<Self> {
        Ok(Self {
            rest: RestClient::new(root, ADMISSION_CALL_TIMEOUT)?,
            retry: RetryConfig::connection_failures(ADMISSION_RETRY_BUDGET),
        })
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

#[async_trait]
impl AdmissionController for AdmissionClient {
    async fn reserve(&self, reservation: &Reservation) -> AxResult<()> {
        let body = serde_json::to_value(reservation)?;
        self.rest
            .send_with_retry(Method::PUT, "adc/resource", &[], Some(&body), Some(&self.retry))
            .await?;
        debug!(
            "Reserved {} cpu / {} MiB for {} {}",
            reservation.cpu_cores, reservation.mem_mib, reservation.category, reservation.resource_id
        );
        Ok(())
    }

    async fn release(&self, resource_id: &str) -> AxResult<()> {
        let path = format!("adc/resource/{}", resource_id);
        match self
            .rest
            .send_with_retry(Method::DELETE, &path, &[], None, Some(&self.retry))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_code(codes::ERR_NOT_FOUND) => {
                info!("Reservation {} was already released", resource_id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Controller that admits every reservation, for clusters without an ADC.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnlimitedAdmission;

#[async_trait]
impl AdmissionController for UnlimitedAdmission {
    async fn reserve(&self, reservation: &Reservation) -> AxResult<()> {
        debug!("Admission disabled, not reserving for {}", reservation.resource_id);
        Ok(())
    }

    async fn release(&self, _resource_id: &str) -> AxResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn reservation(cpu: f64, mem: f64) -> Reservation {
        Reservation {
            category: "deployment".into(),
            resource_id: "r-1".into(),
            ttl: 7200,
            cpu_cores: cpu,
            mem_mib: mem,
            detail: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_zero_footprint_still_carries_ttl() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PUT", "/adc/resource")
            .match_body(Matcher::PartialJson(json!({"resource_id": "r-1", "ttl": 7200, "cpu_cores": 0.0})))
            .with_status(200)
            .expect(2)
            .create_async()
            .await;

        let client = AdmissionClient::new(&server.url()).unwrap();
        client.reserve(&reservation(0.0, 0.0)).await.unwrap();
        client.reserve(&reservation(0.0, 0.0)).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_release_tolerates_missing_reservation() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("DELETE", "/adc/resource/r-1")
            .with_status(404)
            .create_async()
            .await;

        let client = AdmissionClient::new(&server.url()).unwrap();
        client.release("r-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_rejection_is_surfaced() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("PUT", "/adc/resource")
            .with_status(400)
            .with_body(r#"{"code":"ERR_API_INVALID_PARAM","message":"not enough cpu"}"#)
            .create_async()
            .await;

        let client = AdmissionClient::new(&server.url()).unwrap();
        let err = client.reserve(&reservation(64.0, 1024.0)).await.unwrap_err();
        assert!(err.is_client_error());
        assert_eq!(err.message(), "not enough cpu");
    }
}
