// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # ETag Rotator
//!
//! Cache validators for the deployment and application list views.
//!
//! Tokens rotate on every minute boundary and whenever a mutation is
//! published on the `axamm_etag` Redis list. Each published change that
//! decodes as a [`DeploymentChange`] is also re-emitted as a
//! `deployment.status.changed` notification.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure Layer
//! - **Purpose:** Conditional-GET support for the `/v1` list endpoints

use crate::domain::error::AxResult;
use crate::domain::ids::time_uuid;
use crate::domain::notification::code;
use crate::infrastructure::cache::CacheClient;
use crate::infrastructure::notification_producer::EventNotifier;
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const ETAG_CHANNEL: &str = "axamm_etag";
pub const ETAG_CHANNEL_TTL_SECS: u64 = 60 * 60;
const LISTEN_TIMEOUT: Duration = Duration::from_secs(3 * 60);
const ROTATE_PERIOD: Duration = Duration::from_secs(60);
const LISTEN_ERROR_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collection {
    Deployment,
    Application,
}

/// Payload pushed onto [`ETAG_CHANNEL`] after every deployment mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentChange {
    pub id: String,
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub status_detail: serde_json::Value,
}

/// Publish `change` so every manager replica rotates its deployment token.
pub async fn publish_change(cache: &dyn CacheClient, change: &DeploymentChange) -> AxResult<()> {
    let payload = serde_json::to_string(change)?;
    cache.rpush(ETAG_CHANNEL, &[payload]).await?;
    cache.expire(ETAG_CHANNEL, ETAG_CHANNEL_TTL_SECS).await
}

pub struct EtagRotator {
    deployment: ArcSwap<String>,
    application: ArcSwap<String>,
    cache: Arc<dyn CacheClient>,
    notifier: Option<Arc<dyn EventNotifier>>,
}

fn fresh_token() -> Arc<String> {
    Arc::new(time_uuid().simple().to_string())
}

impl EtagRotator {
    pub fn new(cache: Arc<dyn CacheClient>, notifier: Option<Arc<dyn EventNotifier>>) -> Self {
        Self {
            deployment: ArcSwap::new(fresh_token()),
            application: ArcSwap::new(fresh_token()),
            cache,
            notifier,
        }
    }

    fn slot(&self, collection: Collection) -> &ArcSwap<String> {
        match collection {
            Collection::Deployment => &self.deployment,
            Collection::Application => &self.application,
        }
    }

    pub fn current(&self, collection: Collection) -> Arc<String> {
        self.slot(collection).load_full()
    }

    pub fn rotate(&self, collection: Collection) {
        self.slot(collection).store(fresh_token());
    }

    /// Validator served on list responses.
    pub fn combined(&self) -> String {
        format!("{}{}", self.deployment.load(), self.application.load())
    }

    /// Rotate both tokens on every minute boundary until cancelled.
    pub async fn run_ticker(self: Arc<Self>, cancel: CancellationToken) {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let to_boundary = Duration::from_millis((60_000 - now_ms.rem_euclid(60_000)) as u64);
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + to_boundary, ROTATE_PERIOD);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.rotate(Collection::Deployment);
                    self.rotate(Collection::Application);
                }
            }
        }
        info!("ETag ticker stopped");
    }

    /// Drain [`ETAG_CHANNEL`] until cancelled.
    pub async fn run_listener(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let popped = tokio::select! {
                _ = cancel.cancelled() => break,
                popped = self.cache.brpop(LISTEN_TIMEOUT, &[ETAG_CHANNEL]) => popped,
            };
            match popped {
                Ok(Some((_, payload))) => self.on_change(&payload).await,
                Ok(None) => {}
                Err(e) => {
                    warn!("Failed to read {}: {}", ETAG_CHANNEL, e);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(LISTEN_ERROR_BACKOFF) => {}
                    }
                }
            }
        }
        info!("ETag listener stopped");
    }

    pub async fn on_change(&self, payload: &str) {
        if payload.is_empty() {
            return;
        }
        self.rotate(Collection::Deployment);

        let Ok(change) = serde_json::from_str::<DeploymentChange>(payload) else {
            debug!("ETag payload is not a deployment change");
            return;
        };
        let Some(notifier) = &self.notifier else {
            return;
        };
        let mut detail = BTreeMap::new();
        detail.insert("id".to_string(), change.id.clone());
        detail.insert("name".to_string(), change.name.clone());
        detail.insert("status".to_string(), change.status.clone());
        detail.insert("status_detail".to_string(), change.status_detail.to_string());
        if let Err(e) = notifier
            .send_message(code::DEPLOYMENT_STATUS_CHANGED, Some(&change.id), Vec::new(), detail)
            .await
        {
            warn!("Failed to emit status change for deployment {}: {}", change.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::notification::TOPIC_AXNC;
    use crate::infrastructure::bus::InMemoryLog;
    use crate::infrastructure::cache::InMemoryCache;
    use crate::infrastructure::notification_producer::EventNotificationProducer;

    fn change() -> DeploymentChange {
        DeploymentChange {
            id: "d-1".into(),
            name: "web".into(),
            status: "Active".into(),
            status_detail: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn test_rotate_changes_only_one_collection() {
        let rotator = EtagRotator::new(Arc::new(InMemoryCache::new()), None);
        let app = rotator.current(Collection::Application);
        let dep = rotator.current(Collection::Deployment);
        rotator.rotate(Collection::Deployment);
        assert_ne!(rotator.current(Collection::Deployment), dep);
        assert_eq!(rotator.current(Collection::Application), app);
        assert!(rotator.combined().ends_with(app.as_str()));
    }

    #[tokio::test]
    async fn test_listener_rotates_and_notifies() {
        let cache = Arc::new(InMemoryCache::new());
        let log = Arc::new(InMemoryLog::default());
        let notifier = Arc::new(EventNotificationProducer::new("axamm", log.clone(), Duration::from_secs(1)));
        let rotator = Arc::new(EtagRotator::new(cache.clone(), Some(notifier)));
        let before = rotator.current(Collection::Deployment);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(rotator.clone().run_listener(cancel.clone()));
        publish_change(cache.as_ref(), &change()).await.unwrap();

        for _ in 0..100 {
            if !log.messages(TOPIC_AXNC).is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        task.await.unwrap();

        assert_ne!(rotator.current(Collection::Deployment), before);
        let sent = log.messages(TOPIC_AXNC);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].key, "d-1");
    }

    #[tokio::test]
    async fn test_garbage_payload_still_rotates() {
        let rotator = EtagRotator::new(Arc::new(InMemoryCache::new()), None);
        let before = rotator.current(Collection::Deployment);
        rotator.on_change("not json").await;
        assert_ne!(rotator.current(Collection::Deployment), before);
        rotator.on_change("").await;
    }
}
