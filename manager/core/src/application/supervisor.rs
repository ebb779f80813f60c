// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Task Supervisor
//!
//! Owns the long-running loops of a process. Each task is a factory that
//! builds a fresh future from a child [`CancellationToken`]; a task that
//! panics is logged and rebuilt after [`RESTART_BACKOFF`]. A task that returns
//! normally is not restarted.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Lifecycle of background loops

use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub const RESTART_BACKOFF: Duration = Duration::from_secs(5);

pub struct Supervisor {
    cancel: CancellationToken,
    tasks: JoinSet<()>,
    backoff: Duration,
}

impl Supervisor {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            tasks: JoinSet::new(),
            backoff: RESTART_BACKOFF,
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Run `factory`'s future under supervision until it returns or the
    /// supervisor is cancelled.
    pub fn spawn<F>(&mut self, name: &'static str, factory: F)
    where
        F: Fn(CancellationToken) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        let cancel = self.cancel.clone();
        let backoff = self.backoff;
        self.tasks.spawn(async move {
            let mut restarts: u64 = 0;
            loop {
                info!("Starting task {}", name);
                let run = AssertUnwindSafe(factory(cancel.child_token())).catch_unwind();
                match run.await {
                    Ok(()) => {
                        info!("Task {} finished", name);
                        break;
                    }
                    Err(_) => {
                        restarts += 1;
                        error!("Task {} panicked, restarting in {:?} (restart {})", name, backoff, restarts);
                        metrics::counter!("axamm_task_restarts_total", "task" => name).increment(1);
                    }
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        });
    }

    /// Run a task that can not be rebuilt, such as one owning a queue
    /// receiver. A panic is logged and the task stays down.
    pub fn spawn_once<F, Fut>(&mut self, name: &'static str, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let run = AssertUnwindSafe(task(self.cancel.child_token())).catch_unwind();
        self.tasks.spawn(async move {
            info!("Starting task {}", name);
            match run.await {
                Ok(()) => info!("Task {} finished", name),
                Err(_) => {
                    error!("Task {} panicked and will not be restarted", name);
                    metrics::counter!("axamm_task_failures_total", "task" => name).increment(1);
                }
            }
        });
    }

    /// Cancel every task and wait for all of them to return.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        self.join().await;
    }

    /// Wait for every task to return.
    pub async fn join(&mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                error!("Supervised task aborted: {}", e);
            }
        }
        info!("All supervised tasks stopped");
    }
}
