// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Event Notification Producer
//!
//! Publishes [`EventNotificationMessage`]s onto the `axnc` topic, keyed by
//! trace id so one trace is always delivered in order. The bus connection is
//! established lazily on first send, under a single mutex.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure Layer
//! - **Purpose:** Outbound side of the notification pipeline

use crate::domain::error::{codes, AxError, AxResult};
use crate::domain::ids::{monotonic_micros, time_uuid};
use crate::domain::notification::{lookup, EventNotificationMessage, TOPIC_AXNC};
use crate::infrastructure::bus::{BusProducer, MessageLog};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error};

/// Port used by services that raise notifications.
#[async_trait]
pub trait EventNotifier: Send + Sync {
    async fn send_message(
        &self,
        code: &str,
        trace_id: Option<&str>,
        recipients: Vec<String>,
        detail: BTreeMap<String, String>,
    ) -> AxResult<EventNotificationMessage>;
}

pub struct EventNotificationProducer {
    facility: String,
    cluster: String,
    log: Arc<dyn MessageLog>,
    init_budget: Duration,
    producer: Mutex<Option<BusProducer>>,
}

impl EventNotificationProducer {
    pub fn new(facility: impl Into<String>, log: Arc<dyn MessageLog>, init_budget: Duration) -> Self {
        Self {
            facility: facility.into(),
            cluster: String::new(),
            log,
            init_budget,
            producer: Mutex::new(None),
        }
    }

    pub fn with_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = cluster.into();
        self
    }

    async fn producer(&self) -> AxResult<BusProducer> {
        let mut slot = self.producer.lock().await;
        if let Some(producer) = slot.as_ref() {
            return Ok(producer.clone());
        }
        let producer = BusProducer::connect(self.log.clone(), self.init_budget, None).await?;
        *slot = Some(producer.clone());
        Ok(producer)
    }
}

#[async_trait]
impl EventNotifier for EventNotificationProducer {
    async fn send_message(
        &self,
        code: &str,
        trace_id: Option<&str>,
        recipients: Vec<String>,
        detail: BTreeMap<String, String>,
    ) -> AxResult<EventNotificationMessage> {
        let entry = lookup(code).ok_or_else(|| {
            AxError::new(codes::ERR_EVENT_INVALID, format!("Unrecognizable event code ({})", code))
        })?;

        let mut message = EventNotificationMessage {
            event_id: time_uuid().to_string(),
            trace_id: trace_id.unwrap_or_default().to_string(),
            code: code.to_string(),
            message: String::new(),
            facility: self.facility.clone(),
            cluster: self.cluster.clone(),
            channel: String::new(),
            severity: String::new(),
            timestamp: monotonic_micros(),
            recipients,
            detail,
        };
        message.classify(&entry);

        let payload = serde_json::to_string(&message)?;
        let producer = self.producer().await?;
        let (partition, offset) = producer
            .send(TOPIC_AXNC, &message.trace_id, &payload)
            .await
            .map_err(|e| {
                error!("Failed to send event {} ({}): {}", message.event_id, code, e);
                AxError::new(codes::ERR_INTERNAL, format!("Failed to send event: {}", e.message()))
            })?;
        debug!(
            "Sent event {} ({}) to {}@{}/{}",
            message.event_id, code, TOPIC_AXNC, partition, offset
        );
        Ok(message)
    }
}
