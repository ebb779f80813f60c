// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! [`MessageLog`] over Redis Streams.
//!
//! Each topic is split into `partitions` streams named `{topic}:{n}`. Appends
//! use `XADD`, consumer groups map onto `XGROUP`/`XREADGROUP`, and a commit is
//! an `XACK`. A member re-reads its own pending entries (`0` cursor) before it
//! asks for new ones (`>` cursor), which resumes at the oldest uncommitted
//! message after a restart.

use super::{partition_for, BusError, BusMessage, MessageLog, DEFAULT_PARTITIONS};
use crate::infrastructure::cache::{redis_query, CACHE_TIMEOUT};
use async_trait::async_trait;
use bb8_redis::bb8::Pool;
use bb8_redis::redis;
use bb8_redis::RedisConnectionManager;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Approximate cap on the length of each partition stream.
pub const STREAM_MAX_LEN: u64 = 100_000;

type StreamEntry = (String, HashMap<String, String>);
type ReadReply = Option<Vec<(String, Vec<StreamEntry>)>>;

pub struct RedisStreamLog {
    pool: Pool<RedisConnectionManager>,
    partitions: u32,
}

impl RedisStreamLog {
    pub fn new(pool: Pool<RedisConnectionManager>) -> Self {
        Self::with_partitions(pool, DEFAULT_PARTITIONS)
    }

    pub fn with_partitions(pool: Pool<RedisConnectionManager>, partitions: u32) -> Self {
        Self {
            pool,
            partitions: partitions.max(1),
        }
    }

    fn stream(topic: &str, partition: u32) -> String {
        format!("{}:{}", topic, partition)
    }

    fn streams(&self, topic: &str) -> Vec<String> {
        (0..self.partitions).map(|p| Self::stream(topic, p)).collect()
    }

    async fn read(
        &self,
        topic: &str,
        group: &str,
        member: &str,
        cursor: &str,
        block: Option<Duration>,
    ) -> Result<Option<BusMessage>, BusError> {
        let streams = self.streams(topic);
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(group).arg(member).arg("COUNT").arg(1);
        if let Some(block) = block {
            cmd.arg("BLOCK").arg(block.as_millis().max(1) as u64);
        }
        cmd.arg("STREAMS").arg(&streams);
        for _ in &streams {
            cmd.arg(cursor);
        }
        let budget = block.unwrap_or_default() + CACHE_TIMEOUT;
        let reply: ReadReply = redis_query(&self.pool, cmd, budget).await?;
        Ok(first_message(topic, reply))
    }
}

fn first_message(topic: &str, reply: ReadReply) -> Option<BusMessage> {
    for (stream, entries) in reply.unwrap_or_default() {
        let Some((id, mut fields)) = entries.into_iter().next() else {
            continue;
        };
        let partition = stream
            .rsplit(':')
            .next()
            .and_then(|p| p.parse().ok())
            .unwrap_or(0);
        return Some(BusMessage {
            topic: topic.to_string(),
            partition,
            offset: id,
            key: fields.remove("key").unwrap_or_default(),
            value: fields.remove("value").unwrap_or_default(),
        });
    }
    None
}

#[async_trait]
impl MessageLog for RedisStreamLog {
    async fn ping(&self) -> Result<(), BusError> {
        redis_query::<String>(&self.pool, redis::cmd("PING"), CACHE_TIMEOUT).await?;
        Ok(())
    }

    async fn append(&self, topic: &str, key: &str, value: &str) -> Result<(u32, String), BusError> {
        let partition = partition_for(key, self.partitions);
        let mut cmd = redis::cmd("XADD");
        cmd.arg(Self::stream(topic, partition))
            .arg("MAXLEN")
            .arg("~")
            .arg(STREAM_MAX_LEN)
            .arg("*")
            .arg("key")
            .arg(key)
            .arg("value")
            .arg(value);
        let id: String = redis_query(&self.pool, cmd, CACHE_TIMEOUT).await?;
        Ok((partition, id))
    }

    async fn join_group(&self, topic: &str, group: &str) -> Result<(), BusError> {
        for stream in self.streams(topic) {
            let mut cmd = redis::cmd("XGROUP");
            cmd.arg("CREATE").arg(&stream).arg(group).arg("0").arg("MKSTREAM");
            match redis_query::<()>(&self.pool, cmd, CACHE_TIMEOUT).await {
                Ok(()) => {}
                Err(e) if e.root_cause().to_string().contains("BUSYGROUP") => {
                    debug!("group {} already exists on {}", group, stream);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn fetch(
        &self,
        topic: &str,
        group: &str,
        member: &str,
        max_wait: Duration,
    ) -> Result<Option<BusMessage>, BusError> {
        if let Some(pending) = self.read(topic, group, member, "0", None).await? {
            return Ok(Some(pending));
        }
        self.read(topic, group, member, ">", Some(max_wait)).await
    }

    async fn commit(&self, group: &str, message: &BusMessage) -> Result<(), BusError> {
        let mut cmd = redis::cmd("XACK");
        cmd.arg(Self::stream(&message.topic, message.partition))
            .arg(group)
            .arg(&message.offset);
        redis_query::<i64>(&self.pool, cmd, CACHE_TIMEOUT).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_message_decodes_reply() {
        let mut fields = HashMap::new();
        fields.insert("key".to_string(), "trace-1".to_string());
        fields.insert("value".to_string(), "{}".to_string());
        let reply: ReadReply = Some(vec![
            ("axnc:0".to_string(), vec![]),
            ("axnc:3".to_string(), vec![("1700000000000-0".to_string(), fields)]),
        ]);

        let message = first_message("axnc", reply).unwrap();
        assert_eq!(message.partition, 3);
        assert_eq!(message.offset, "1700000000000-0");
        assert_eq!(message.key, "trace-1");
        assert_eq!(message.value, "{}");
        assert!(first_message("axnc", None).is_none());
    }
}
