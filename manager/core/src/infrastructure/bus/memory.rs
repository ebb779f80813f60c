// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! In-process [`MessageLog`] with the same group semantics as the Redis log.

use super::{partition_for, BusError, BusMessage, MessageLog, DEFAULT_PARTITIONS};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Default)]
struct Group {
    next: Vec<usize>,
    // (partition, index) -> member holding the delivery
    pending: BTreeMap<(u32, usize), String>,
}

struct Topic {
    partitions: Vec<Vec<(String, String)>>,
    groups: HashMap<String, Group>,
}

impl Topic {
    fn new(partitions: u32) -> Self {
        Self {
            partitions: vec![Vec::new(); partitions as usize],
            groups: HashMap::new(),
        }
    }

    fn message(&self, name: &str, partition: u32, index: usize) -> BusMessage {
        build_message(&self.partitions, name, partition, index)
    }
}

fn build_message(logs: &[Vec<(String, String)>], name: &str, partition: u32, index: usize) -> BusMessage {
    let (key, value) = logs[partition as usize][index].clone();
    BusMessage {
        topic: name.to_string(),
        partition,
        offset: index.to_string(),
        key,
        value,
    }
}

pub struct InMemoryLog {
    partitions: u32,
    topics: Mutex<HashMap<String, Topic>>,
    appended: Notify,
    failures: AtomicUsize,
}

impl Default for InMemoryLog {
    fn default() -> Self {
        Self::new(DEFAULT_PARTITIONS)
    }
}

impl InMemoryLog {
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions: partitions.max(1),
            topics: Mutex::new(HashMap::new()),
            appended: Notify::new(),
            failures: AtomicUsize::new(0),
        }
    }

    /// Make the next `count` calls fail with [`BusError::Unavailable`].
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Every message on `topic` in partition order.
    pub fn messages(&self, topic: &str) -> Vec<BusMessage> {
        let topics = self.topics.lock();
        let Some(t) = topics.get(topic) else {
            return Vec::new();
        };
        (0..self.partitions)
            .flat_map(|p| (0..t.partitions[p as usize].len()).map(move |i| (p, i)))
            .map(|(p, i)| t.message(topic, p, i))
            .collect()
    }

    pub fn pending(&self, topic: &str, group: &str) -> usize {
        self.topics
            .lock()
            .get(topic)
            .and_then(|t| t.groups.get(group))
            .map(|g| g.pending.len())
            .unwrap_or(0)
    }

    fn injected_failure(&self) -> Result<(), BusError> {
        let hit = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if hit {
            Err(BusError::Unavailable("injected failure".into()))
        } else {
            Ok(())
        }
    }

    fn try_fetch(&self, topic: &str, group: &str, member: &str) -> Result<Option<BusMessage>, BusError> {
        let mut topics = self.topics.lock();
        let partitions = self.partitions;
        let t = topics
            .entry(topic.to_string())
            .or_insert_with(|| Topic::new(partitions));
        let Topic { partitions: logs, groups } = t;
        let g = groups
            .get_mut(group)
            .ok_or_else(|| BusError::Protocol(format!("group {} has not joined {}", group, topic)))?;

        let redelivery = g
            .pending
            .iter()
            .find(|(_, m)| m.as_str() == member)
            .map(|(&(p, i), _)| (p, i));
        if let Some((p, i)) = redelivery {
            return Ok(Some(build_message(logs, topic, p, i)));
        }
        for (p, log) in logs.iter().enumerate() {
            let next = g.next[p];
            if next < log.len() {
                g.next[p] = next + 1;
                g.pending.insert((p as u32, next), member.to_string());
                return Ok(Some(build_message(logs, topic, p as u32, next)));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl MessageLog for InMemoryLog {
    async fn ping(&self) -> Result<(), BusError> {
        self.injected_failure()
    }

    async fn append(&self, topic: &str, key: &str, value: &str) -> Result<(u32, String), BusError> {
        self.injected_failure()?;
        let partition = partition_for(key, self.partitions);
        let offset = {
            let mut topics = self.topics.lock();
            let t = topics
                .entry(topic.to_string())
                .or_insert_with(|| Topic::new(self.partitions));
            let log = &mut t.partitions[partition as usize];
            log.push((key.to_string(), value.to_string()));
            log.len() - 1
        };
        self.appended.notify_waiters();
        Ok((partition, offset.to_string()))
    }

    async fn join_group(&self, topic: &str, group: &str) -> Result<(), BusError> {
        self.injected_failure()?;
        let mut topics = self.topics.lock();
        let t = topics
            .entry(topic.to_string())
            .or_insert_with(|| Topic::new(self.partitions));
        let partitions = t.partitions.len();
        t.groups.entry(group.to_string()).or_insert_with(|| Group {
            next: vec![0; partitions],
            pending: BTreeMap::new(),
        });
        Ok(())
    }

    async fn fetch(
        &self,
        topic: &str,
        group: &str,
        member: &str,
        max_wait: Duration,
    ) -> Result<Option<BusMessage>, BusError> {
        self.injected_failure()?;
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = self.try_fetch(topic, group, member)? {
                return Ok(Some(message));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn commit(&self, group: &str, message: &BusMessage) -> Result<(), BusError> {
        let index: usize = message
            .offset
            .parse()
            .map_err(|_| BusError::Protocol(format!("bad offset {}", message.offset)))?;
        if let Some(g) = self
            .topics
            .lock()
            .get_mut(&message.topic)
            .and_then(|t| t.groups.get_mut(group))
        {
            g.pending.remove(&(message.partition, index));
        }
        Ok(())
    }
}
