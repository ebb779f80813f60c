// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Consumer-group member loop.
//!
//! ```text
//! join group ──► fetch ──► handle (optional retry, panics caught) ──► commit
//!     ▲            │
//!     └── error ───┤ idle past the liveness tick
//!                  └── cancelled: return
//! ```

use super::{BusMessage, MessageLog};
use crate::domain::error::AxResult;
use crate::infrastructure::retry::{retry_until, RetryConfig};
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Re-initialise a member that has been idle this long.
pub const LIVENESS_TICK: Duration = Duration::from_secs(20 * 60);

const POLL_WAIT: Duration = Duration::from_secs(5);
const REJOIN_BACKOFF: Duration = Duration::from_secs(5);

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &BusMessage) -> AxResult<()>;
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub topic: String,
    pub group: String,
    pub member: String,
    pub retry: Option<RetryConfig>,
    pub liveness: Duration,
    pub poll_wait: Duration,
    pub rejoin_backoff: Duration,
}

impl ConsumerConfig {
    pub fn new(topic: impl Into<String>, group: impl Into<String>, member: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            group: group.into(),
            member: member.into(),
            retry: None,
            liveness: LIVENESS_TICK,
            poll_wait: POLL_WAIT,
            rejoin_backoff: REJOIN_BACKOFF,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }
}

pub struct Consumer {
    log: Arc<dyn MessageLog>,
    config: ConsumerConfig,
}

impl Consumer {
    pub fn new(log: Arc<dyn MessageLog>, config: ConsumerConfig) -> Self {
        Self { log, config }
    }

    /// Consume until `cancel` fires. A message being handled when the token
    /// fires is finished and committed first.
    pub async fn run(self, handler: Arc<dyn MessageHandler>, cancel: CancellationToken) {
        let c = &self.config;
        info!("Consumer {}/{} starting on {}", c.group, c.member, c.topic);

        'session: loop {
            if cancel.is_cancelled() {
                break;
            }
            if let Err(e) = self.log.join_group(&c.topic, &c.group).await {
                warn!("Consumer {} failed to join {}: {}", c.member, c.group, e);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(c.rejoin_backoff) => continue 'session,
                }
            }

            let mut last_activity = Instant::now();
            loop {
                let fetched = tokio::select! {
                    _ = cancel.cancelled() => break 'session,
                    fetched = self.log.fetch(&c.topic, &c.group, &c.member, c.poll_wait) => fetched,
                };
                match fetched {
                    Ok(Some(message)) => {
                        self.dispatch(handler.as_ref(), &message, &cancel).await;
                        if let Err(e) = self.log.commit(&c.group, &message).await {
                            warn!("Consumer {} failed to commit {}: {}", c.member, message.offset, e);
                            continue 'session;
                        }
                        last_activity = Instant::now();
                    }
                    Ok(None) => {
                        if last_activity.elapsed() >= c.liveness {
                            info!("Consumer {} idle for {:?}, re-initialising", c.member, c.liveness);
                            continue 'session;
                        }
                    }
                    Err(e) => {
                        warn!("Consumer {} lost its session: {}", c.member, e);
                        continue 'session;
                    }
                }
            }
        }
        info!("Consumer {}/{} stopped", c.group, c.member);
    }

    async fn dispatch(&self, handler: &dyn MessageHandler, message: &BusMessage, cancel: &CancellationToken) {
        let work = retry_until(self.config.retry.as_ref(), Some(cancel), || handler.handle(message));
        match AssertUnwindSafe(work).catch_unwind().await {
            Ok(Ok(())) => debug!("Handled {}@{}", message.partition, message.offset),
            Ok(Err(e)) => error!(
                "Handler failed on {}@{} of {}: {}",
                message.partition, message.offset, message.topic, e
            ),
            Err(_) => error!(
                "Handler panicked on {}@{} of {}",
                message.partition, message.offset, message.topic
            ),
        }
    }
}
