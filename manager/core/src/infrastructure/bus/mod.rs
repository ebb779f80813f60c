// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Message Bus
//!
//! Partitioned, consumer-group message log used for event notification.
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`producer`] | Acknowledged `send(topic, key, value)` |
//! | [`consumer`] | Consumer-group member loop with commit-after-handle |
//! | [`redis_streams`] | [`MessageLog`] over Redis Streams |
//! | [`memory`] | [`MessageLog`] held in process for tests |
//!
//! Messages with the same key always land on the same partition, which is
//! what gives per-trace ordering.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure Layer
//! - **Purpose:** Event transport between the manager and the notifier

pub mod consumer;
pub mod memory;
pub mod producer;
pub mod redis_streams;

use crate::domain::error::AxError;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub use consumer::{Consumer, ConsumerConfig, MessageHandler};
pub use memory::InMemoryLog;
pub use producer::BusProducer;
pub use redis_streams::RedisStreamLog;

/// Default number of partitions per topic.
pub const DEFAULT_PARTITIONS: u32 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub partition: u32,
    pub offset: String,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("unexpected broker reply: {0}")]
    Protocol(String),

    #[error("log closed")]
    Closed,
}

impl From<BusError> for AxError {
    fn from(err: BusError) -> Self {
        match &err {
            BusError::Unavailable(_) => AxError::connection(err.to_string()),
            _ => AxError::internal(err.to_string()),
        }
    }
}

impl From<AxError> for BusError {
    fn from(err: AxError) -> Self {
        if err.is_client_error() {
            BusError::Protocol(err.to_string())
        } else {
            BusError::Unavailable(err.to_string())
        }
    }
}

/// Storage behind producers and consumers.
#[async_trait]
pub trait MessageLog: Send + Sync {
    async fn ping(&self) -> Result<(), BusError>;

    /// Append and return `(partition, offset)` once acknowledged.
    async fn append(&self, topic: &str, key: &str, value: &str) -> Result<(u32, String), BusError>;

    /// Create the group on every partition of `topic` if it does not exist.
    async fn join_group(&self, topic: &str, group: &str) -> Result<(), BusError>;

    /// Next message for `member`: its own uncommitted deliveries first, then
    /// new ones, waiting at most `max_wait`.
    async fn fetch(
        &self,
        topic: &str,
        group: &str,
        member: &str,
        max_wait: Duration,
    ) -> Result<Option<BusMessage>, BusError>;

    async fn commit(&self, group: &str, message: &BusMessage) -> Result<(), BusError>;
}

/// Stable partition for `key`. FNV-1a, so every process agrees.
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in key.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash % partitions.max(1)
}
