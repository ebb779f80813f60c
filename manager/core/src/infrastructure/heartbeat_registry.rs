// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Heartbeat Registry
//!
//! Routes heartbeats reported by AM side-cars to the handler registered for
//! their key and tracks how recently each key was heard from.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure Layer
//! - **Purpose:** Liveness tracking for deployments

use crate::domain::error::AxResult;
use crate::domain::ids::now_secs;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Seconds since the epoch, as reported by the sender.
    pub date: i64,
    pub key: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub origin_bytes: Option<String>,
}

#[async_trait]
pub trait HeartbeatHandler: Send + Sync {
    async fn handle(&self, heartbeat: &Heartbeat) -> AxResult<()>;
}

struct Registration {
    handler: Arc<dyn HeartbeatHandler>,
    freshness: i64,
}

#[derive(Default)]
pub struct HeartbeatRegistry {
    entries: DashMap<String, Registration>,
}

impl HeartbeatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, key: &str, handler: Arc<dyn HeartbeatHandler>) {
        debug!("Registering heartbeat handler for {}", key);
        self.entries.insert(
            key.to_string(),
            Registration {
                handler,
                freshness: now_secs(),
            },
        );
    }

    pub fn unregister(&self, key: &str) {
        debug!("Unregistering heartbeat handler for {}", key);
        self.entries.remove(key);
    }

    pub fn is_registered(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Dispatch `heartbeat`; freshness only moves forward, and only when the
    /// handler succeeds.
    pub async fn process(&self, heartbeat: &Heartbeat) -> AxResult<()> {
        let Some(handler) = self.entries.get(&heartbeat.key).map(|r| r.handler.clone()) else {
            debug!("Dropping heartbeat for unregistered key {}", heartbeat.key);
            return Ok(());
        };

        handler.handle(heartbeat).await?;

        if let Some(mut entry) = self.entries.get_mut(&heartbeat.key) {
            entry.freshness = entry.freshness.max(heartbeat.date);
        }
        Ok(())
    }

    pub fn freshness(&self, key: &str) -> Option<i64> {
        self.entries.get(key).map(|r| r.freshness)
    }

    /// Keys not heard from within `grace`.
    pub fn stale_keys(&self, grace: Duration) -> Vec<String> {
        let cutoff = now_secs() - grace.as_secs() as i64;
        self.entries
            .iter()
            .filter(|r| r.freshness < cutoff)
            .map(|r| r.key().clone())
            .collect()
    }
}
