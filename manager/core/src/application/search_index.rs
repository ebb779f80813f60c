// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Search Index Worker
//!
//! Feeds the `search_index` suggestion table. Producers enqueue entries
//! through a cheap [`SearchIndexer`] handle; a single worker drains the queue
//! and writes each `(type, key, value)` once per dedup window. The window is
//! reset when it reaches [`DEDUP_MAX_ENTRIES`] entries or [`DEDUP_MAX_AGE`].
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Asynchronous indexing of deployment and application names

use crate::domain::ids::now_secs;
use crate::domain::repository::SearchIndexRepository;
use crate::domain::search_index::SearchIndexEntry;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEDUP_MAX_ENTRIES: usize = 4000;
pub const DEDUP_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Producer side of the index queue.
#[derive(Clone)]
pub struct SearchIndexer {
    tx: mpsc::UnboundedSender<SearchIndexEntry>,
}

impl SearchIndexer {
    pub fn channel(repository: Arc<dyn SearchIndexRepository>) -> (Self, SearchIndexWorker) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self { tx },
            SearchIndexWorker {
                repository,
                rx,
                window: DedupWindow::new(DEDUP_MAX_ENTRIES, DEDUP_MAX_AGE, Instant::now()),
            },
        )
    }

    pub fn index(&self, index_type: &str, key: &str, value: &str) {
        if value.is_empty() {
            return;
        }
        let entry = SearchIndexEntry::new(index_type, key, value, now_secs());
        if self.tx.send(entry).is_err() {
            debug!("Search index worker is gone, dropping {}/{}", index_type, value);
        }
    }
}

struct DedupWindow {
    seen: HashSet<(String, String, String)>,
    started: Instant,
    max_entries: usize,
    max_age: Duration,
}

impl DedupWindow {
    fn new(max_entries: usize, max_age: Duration, now: Instant) -> Self {
        Self {
            seen: HashSet::new(),
            started: now,
            max_entries,
            max_age,
        }
    }

    /// True the first time `identity` is seen in the current window.
    fn admit(&mut self, identity: (String, String, String), now: Instant) -> bool {
        if self.seen.len() >= self.max_entries || now.duration_since(self.started) >= self.max_age {
            self.seen.clear();
            self.started = now;
        }
        self.seen.insert(identity)
    }
}

pub struct SearchIndexWorker {
    repository: Arc<dyn SearchIndexRepository>,
    rx: mpsc::UnboundedReceiver<SearchIndexEntry>,
    window: DedupWindow,
}

impl SearchIndexWorker {
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            let entry = tokio::select! {
                _ = cancel.cancelled() => break,
                entry = self.rx.recv() => match entry {
                    Some(entry) => entry,
                    None => break,
                },
            };
            self.process(entry).await;
        }
        info!("Search index worker stopped");
    }

    async fn process(&mut self, entry: SearchIndexEntry) {
        if !self.window.admit(entry.identity(), Instant::now()) {
            return;
        }
        if let Err(e) = self.repository.save(&entry).await {
            warn!("Failed to index {}/{}: {}", entry.index_type, entry.value, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::repository::RepositoryError;
    use crate::domain::search_index::INDEX_TYPE_DEPLOYMENT_NAME;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<SearchIndexEntry>>);

    #[async_trait]
    impl SearchIndexRepository for Recorder {
        async fn save(&self, entry: &SearchIndexEntry) -> Result<(), RepositoryError> {
            self.0.lock().push(entry.clone());
            Ok(())
        }
    }

    fn id(v: &str) -> (String, String, String) {
        ("t".into(), "k".into(), v.into())
    }

    #[test]
    fn test_window_rotates_on_size() {
        let now = Instant::now();
        let mut window = DedupWindow::new(2, DEDUP_MAX_AGE, now);
        assert!(window.admit(id("a"), now));
        assert!(!window.admit(id("a"), now));
        assert!(window.admit(id("b"), now));
        // full: the next admit starts a new window
        assert!(window.admit(id("a"), now));
    }

    #[test]
    fn test_window_rotates_on_age() {
        let now = Instant::now();
        let mut window = DedupWindow::new(DEDUP_MAX_ENTRIES, Duration::from_secs(10), now);
        assert!(window.admit(id("a"), now));
        assert!(!window.admit(id("a"), now + Duration::from_secs(9)));
        assert!(window.admit(id("a"), now + Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn test_worker_writes_each_entry_once() {
        let repo = Arc::new(Recorder::default());
        let (indexer, worker) = SearchIndexer::channel(repo.clone());
        indexer.index(INDEX_TYPE_DEPLOYMENT_NAME, "name", "web");
        indexer.index(INDEX_TYPE_DEPLOYMENT_NAME, "name", "web");
        indexer.index(INDEX_TYPE_DEPLOYMENT_NAME, "name", "db");
        indexer.index(INDEX_TYPE_DEPLOYMENT_NAME, "name", "");
        drop(indexer);

        worker.run(CancellationToken::new()).await;
        let values: Vec<_> = repo.0.lock().iter().map(|e| e.value.clone()).collect();
        assert_eq!(values, ["web", "db"]);
    }
}
