// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Acknowledged producer.

use super::MessageLog;
use crate::domain::error::{AxError, AxResult};
use crate::infrastructure::retry::{retry_until, RetryConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Default budget for reaching the broker at startup.
pub const BROKER_INIT_TIMEOUT: Duration = Duration::from_secs(15 * 60);

#[derive(Clone)]
pub struct BusProducer {
    log: Arc<dyn MessageLog>,
}

impl BusProducer {
    /// Wrap `log` without probing it.
    pub fn new(log: Arc<dyn MessageLog>) -> Self {
        Self { log }
    }

    /// Wait for the broker, retrying connection failures for up to `budget`.
    pub async fn connect(
        log: Arc<dyn MessageLog>,
        budget: Duration,
        cancel: Option<&CancellationToken>,
    ) -> AxResult<Self> {
        let config = RetryConfig::connection_failures(budget);
        retry_until(Some(&config), cancel, || async {
            log.ping().await.map_err(|e| {
                warn!("Message bus not ready: {}", e);
                AxError::from(e)
            })
        })
        .await?;
        info!("Connected to message bus");
        Ok(Self { log })
    }

    pub fn log(&self) -> Arc<dyn MessageLog> {
        self.log.clone()
    }

    /// Returns `(partition, offset)` once the broker acknowledged the write.
    pub async fn send(&self, topic: &str, key: &str, value: &str) -> AxResult<(u32, String)> {
        Ok(self.log.append(topic, key, value).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::codes;
    use crate::infrastructure::bus::InMemoryLog;

    #[tokio::test(start_paused = true)]
    async fn test_connect_waits_for_broker() {
        let log = Arc::new(InMemoryLog::default());
        log.fail_next(3);
        let producer = BusProducer::connect(log.clone(), Duration::from_secs(60), None)
            .await
            .unwrap();
        let (partition, offset) = producer.send("axnc", "trace", "{}").await.unwrap();
        assert_eq!(offset, "0");
        assert_eq!(log.messages("axnc")[0].partition, partition);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_gives_up_after_budget() {
        let log = Arc::new(InMemoryLog::default());
        log.fail_next(usize::MAX);
        let err = BusProducer::connect(log, Duration::from_secs(10), None)
            .await
            .err()
            .unwrap();
        assert!(err.is_code(codes::ERR_AX_HTTP_CONNECTION));
    }
}
