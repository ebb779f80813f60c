// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Keyed Lock Group
//!
//! In-process map of string key → single-permit semaphore. Deployment
//! mutations are serialised on `application_name/name` through this group.
//!
//! Each entry keeps a freshness timestamp that is refreshed on every acquire
//! and release. A periodic GC pass (period = TTL) drops entries that are idle,
//! unheld and unreferenced for longer than the TTL.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure Layer
//! - **Purpose:** Per-key mutual exclusion for the reconciler

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock for key {0} was closed")]
    Closed(String),
}

struct LockEntry {
    slot: Semaphore,
    freshness: Mutex<Instant>,
}

impl LockEntry {
    fn new() -> Self {
        Self {
            slot: Semaphore::new(1),
            freshness: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.freshness.lock() = Instant::now();
    }

    fn release(&self) {
        // A second unlock of a free slot must not mint an extra permit.
        if self.slot.available_permits() == 0 {
            self.slot.add_permits(1);
        }
        self.touch();
    }
}

pub struct KeyedLockGroup {
    entries: Mutex<HashMap<String, Arc<LockEntry>>>,
    ttl: Duration,
}

impl KeyedLockGroup {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    fn entry(&self, key: &str) -> Arc<LockEntry> {
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(LockEntry::new()))
            .clone();
        entry.touch();
        entry
    }

    /// Block until the lock for `key` is held.
    pub async fn lock(&self, key: &str) -> Result<(), LockError> {
        let entry = self.entry(key);
        let permit = entry
            .slot
            .acquire()
            .await
            .map_err(|_| LockError::Closed(key.to_string()))?;
        permit.forget();
        entry.touch();
        Ok(())
    }

    pub fn unlock(&self, key: &str) {
        let entry = self.entries.lock().get(key).cloned();
        match entry {
            Some(entry) => entry.release(),
            None => warn!("Unlock of unknown key {}", key),
        }
    }

    /// Acquire with a deadline. A zero timeout never blocks.
    pub async fn try_lock(&self, key: &str, timeout: Duration) -> bool {
        let entry = self.entry(key);
        let acquired = if timeout.is_zero() {
            entry.slot.try_acquire().ok()
        } else {
            match tokio::time::timeout(timeout, entry.slot.acquire()).await {
                Ok(Ok(permit)) => Some(permit),
                _ => None,
            }
        };
        match acquired {
            Some(permit) => {
                permit.forget();
                entry.touch();
                true
            }
            None => false,
        }
    }

    /// Acquire and return a guard that unlocks on drop.
    pub async fn lock_owned(&self, key: &str) -> Result<KeyedLockGuard, LockError> {
        let entry = self.entry(key);
        let permit = entry
            .slot
            .acquire()
            .await
            .map_err(|_| LockError::Closed(key.to_string()))?;
        permit.forget();
        entry.touch();
        Ok(KeyedLockGuard {
            key: key.to_string(),
            entry,
        })
    }

    pub fn freshness(&self, key: &str) -> Option<Instant> {
        self.entries.lock().get(key).map(|e| *e.freshness.lock())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop idle entries. Returns how many were removed.
    pub fn gc(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| {
            let idle = now.duration_since(*entry.freshness.lock());
            let held = entry.slot.available_permits() == 0;
            let referenced = Arc::strong_count(entry) > 1;
            idle <= self.ttl || held || referenced
        });
        let removed = before - entries.len();
        if removed > 0 {
            debug!("Lock GC removed {} idle entries", removed);
        }
        removed
    }

    /// Run the GC pass every TTL until cancelled.
    pub async fn run_gc(self: Arc<Self>, cancel: CancellationToken) {
        info!("Lock GC started (ttl {:?})", self.ttl);
        let mut ticker = tokio::time::interval(self.ttl);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.gc();
                }
            }
        }
        info!("Lock GC stopped");
    }
}

/// Releases its key when dropped.
pub struct KeyedLockGuard {
    key: String,
    entry: Arc<LockEntry>,
}

impl KeyedLockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyedLockGuard {
    fn drop(&mut self) {
        self.entry.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lock_excludes_second_caller() {
        let group = KeyedLockGroup::new(Duration::from_secs(60));
        group.lock("app/d1").await.unwrap();
        assert!(!group.try_lock("app/d1", Duration::ZERO).await);
        assert!(group.try_lock("app/d2", Duration::ZERO).await);
        group.unlock("app/d1");
        assert!(group.try_lock("app/d1", Duration::ZERO).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_lock_times_out() {
        let group = KeyedLockGroup::new(Duration::from_secs(60));
        group.lock("k").await.unwrap();
        assert!(!group.try_lock("k", Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn test_blocked_lock_proceeds_after_unlock() {
        let group = Arc::new(KeyedLockGroup::new(Duration::from_secs(60)));
        group.lock("k").await.unwrap();

        let waiter = {
            let group = group.clone();
            tokio::spawn(async move {
                group.lock("k").await.unwrap();
                group.unlock("k");
            })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        group.unlock("k");
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_double_unlock_does_not_mint_permits() {
        let group = KeyedLockGroup::new(Duration::from_secs(60));
        group.lock("k").await.unwrap();
        group.unlock("k");
        group.unlock("k");
        assert!(group.try_lock("k", Duration::ZERO).await);
        assert!(!group.try_lock("k", Duration::ZERO).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlock_refreshes_freshness() {
        let group = KeyedLockGroup::new(Duration::from_secs(60));
        group.lock("k").await.unwrap();
        let acquired_at = group.freshness("k").unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        group.unlock("k");
        assert!(group.freshness("k").unwrap() > acquired_at);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gc_keeps_fresh_entries() {
        let group = KeyedLockGroup::new(Duration::from_secs(60));
        for key in ["a", "b", "c"] {
            group.lock(key).await.unwrap();
            group.unlock(key);
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(group.gc(), 0);
        assert_eq!(group.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gc_drops_idle_but_not_held() {
        let group = KeyedLockGroup::new(Duration::from_secs(60));
        group.lock("idle").await.unwrap();
        group.unlock("idle");
        group.lock("held").await.unwrap();
        tokio::time::advance(Duration::from_secs(120)).await;
        assert_eq!(group.gc(), 1);
        assert!(group.freshness("idle").is_none());
        assert!(group.freshness("held").is_some());
    }

    #[tokio::test]
    async fn test_guard_unlocks_on_drop() {
        let group = KeyedLockGroup::new(Duration::from_secs(60));
        {
            let guard = group.lock_owned("k").await.unwrap();
            assert_eq!(guard.key(), "k");
            assert!(!group.try_lock("k", Duration::ZERO).await);
        }
        assert!(group.try_lock("k", Duration::ZERO).await);
    }
}
