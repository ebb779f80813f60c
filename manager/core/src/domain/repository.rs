// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Domain Repository Interfaces
//!
//! Persistence contracts for each aggregate, implemented over AXDB in
//! `crate::infrastructure::repositories`.
//!
//! | Trait | Aggregate | Tables |
//! |-------|-----------|--------|
//! | `DeploymentRepository` | `Deployment` | `axamm/deployments`, `axamm/deployment_history` |
//! | `RuleRepository` | `Rule` | `axnc/rule` |
//! | `EventRepository` | `EventNotificationMessage` | `axnc/events` |
//! | `NotificationCodeRepository` | `NotificationCode` | `axnc/code` |
//! | `LabelRepository` | `Label` | `axops/label` |
//! | `SessionRepository` | `Session` | `axops/session` |
//! | `SearchIndexRepository` | `SearchIndexEntry` | `axops/search_index` |

use crate::domain::deployment::{Deployment, DeploymentStatus};
use crate::domain::error::AxError;
use crate::domain::label::Label;
use crate::domain::notification::{EventNotificationMessage, NotificationCode, Rule};
use crate::domain::search_index::SearchIndexEntry;
use crate::domain::session::Session;
use async_trait::async_trait;
use thiserror::Error;

/// Selection and paging for deployment listings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeploymentQuery {
    pub application_name: Option<String>,
    pub name: Option<String>,
    pub statuses: Vec<DeploymentStatus>,
    /// Free text matched against name and application name.
    pub search: Option<String>,
    /// `field` or `-field` for descending.
    pub sort: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    /// Bounds on `create_time`, seconds.
    pub min_time: Option<i64>,
    pub max_time: Option<i64>,
}

impl DeploymentQuery {
    pub fn application(name: &str) -> Self {
        Self {
            application_name: Some(name.to_string()),
            ..Self::default()
        }
    }

    pub fn with_statuses(mut self, statuses: &[DeploymentStatus]) -> Self {
        self.statuses = statuses.to_vec();
        self
    }
}

/// Deployments live in two tables: the latest generation of each
/// `(application_name, name)` and an append-only history.
#[async_trait]
pub trait DeploymentRepository: Send + Sync {
    /// Upsert `deployment` as the latest generation of its name.
    async fn save_latest(&self, deployment: &Deployment) -> Result<(), RepositoryError>;

    async fn find_latest_by_id(&self, id: &str) -> Result<Option<Deployment>, RepositoryError>;

    async fn find_latest_by_name(
        &self,
        application_name: &str,
        name: &str,
    ) -> Result<Option<Deployment>, RepositoryError>;

    async fn list_latest(&self, query: &DeploymentQuery) -> Result<Vec<Deployment>, RepositoryError>;

    /// Remove the latest pointer of `deployment`'s name.
    async fn remove_latest(&self, deployment: &Deployment) -> Result<(), RepositoryError>;

    /// Upsert `deployment` into history.
    async fn save_history(&self, deployment: &Deployment) -> Result<(), RepositoryError>;

    async fn find_history_by_id(&self, id: &str) -> Result<Option<Deployment>, RepositoryError>;

    async fn delete_history(&self, deployment: &Deployment) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait RuleRepository: Send + Sync {
    async fn list_rules(&self) -> Result<Vec<Rule>, RepositoryError>;

    async fn get_rule(&self, rule_id: &str) -> Result<Option<Rule>, RepositoryError>;

    async fn save_rule(&self, rule: &Rule) -> Result<(), RepositoryError>;

    async fn delete_rule(&self, rule_id: &str) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait EventRepository: Send + Sync {
    async fn save_event(&self, event: &EventNotificationMessage) -> Result<(), RepositoryError>;

    /// Most recent events first.
    async fn list_events(
        &self,
        trace_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<EventNotificationMessage>, RepositoryError>;
}

#[async_trait]
pub trait NotificationCodeRepository: Send + Sync {
    async fn save_code(&self, code: &NotificationCode) -> Result<(), RepositoryError>;

    async fn list_codes(&self) -> Result<Vec<NotificationCode>, RepositoryError>;
}

#[async_trait]
pub trait LabelRepository: Send + Sync {
    async fn find(&self, label_type: &str, key: &str, value: &str) -> Result<Option<Label>, RepositoryError>;

    async fn list(&self, label_type: Option<&str>) -> Result<Vec<Label>, RepositoryError>;

    async fn save(&self, label: &Label) -> Result<(), RepositoryError>;

    async fn delete(&self, label: &Label) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn find(&self, id: &str) -> Result<Option<Session>, RepositoryError>;

    async fn save(&self, session: &Session) -> Result<(), RepositoryError>;

    async fn delete(&self, id: &str) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait SearchIndexRepository: Send + Sync {
    async fn save(&self, entry: &SearchIndexEntry) -> Result<(), RepositoryError>;
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Duplicate entity: {0}")]
    Duplicate(String),

    #[error("Database error: {0}")]
    Database(#[from] AxError),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for RepositoryError {
    fn from(e: serde_json::Error) -> Self {
        RepositoryError::Serialization(e.to_string())
    }
}

impl From<RepositoryError> for AxError {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::NotFound(what) => AxError::not_found(what),
            RepositoryError::Duplicate(what) => AxError::conflict(what),
            RepositoryError::Database(inner) => inner,
            RepositoryError::Serialization(msg) => AxError::internal(msg),
        }
    }
}
