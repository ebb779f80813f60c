// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Repository Implementations
//!
//! AXDB-backed implementations of the repository traits in
//! [`crate::domain::repository`]. Every repository is generic over
//! `Arc<dyn DatabaseClient>`, so the same code runs against the HTTP client in
//! production and [`InMemoryDatabase`](crate::infrastructure::axdb::memory::InMemoryDatabase)
//! in tests and local mode.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Persist and retrieve domain aggregates
//! - **Pattern:** Repository (DDD), Adapter (Hexagonal Architecture)
//!
//! Reads and writes are retried on connection failures within
//! [`DB_RETRY_BUDGET`]; a persistent failure surfaces as
//! [`RepositoryError::Database`](crate::domain::repository::RepositoryError).

pub mod axdb_deployment;
pub mod axdb_notification;
pub mod axdb_ops;

pub use axdb_deployment::AxdbDeploymentRepository;
pub use axdb_notification::{AxdbCodeRepository, AxdbEventRepository, AxdbRuleRepository};
pub use axdb_ops::{AxdbLabelRepository, AxdbSearchIndexRepository, AxdbSessionRepository};

use crate::infrastructure::retry::RetryConfig;
use std::time::Duration;

pub const DB_RETRY_BUDGET: Duration = Duration::from_secs(10 * 60);

pub(crate) fn db_retry() -> RetryConfig {
    RetryConfig::connection_failures(DB_RETRY_BUDGET)
}
