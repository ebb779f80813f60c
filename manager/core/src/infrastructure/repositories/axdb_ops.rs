// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Labels, sessions and search-index suggestions in the `axops` keyspace.

use super::db_retry;
use crate::domain::label::Label;
use crate::domain::repository::{LabelRepository, RepositoryError, SearchIndexRepository, SessionRepository};
use crate::domain::search_index::SearchIndexEntry;
use crate::domain::session::Session;
use crate::infrastructure::axdb::schema::{APP_AXOPS, TABLE_LABEL, TABLE_SEARCH_INDEX, TABLE_SESSION};
use crate::infrastructure::axdb::{decode_rows, params, DatabaseClient, Params};
use crate::infrastructure::retry::RetryConfig;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

pub struct AxdbLabelRepository {
    db: Arc<dyn DatabaseClient>,
    retry: RetryConfig,
}

impl AxdbLabelRepository {
    pub fn new(db: Arc<dyn DatabaseClient>) -> Self {
        Self { db, retry: db_retry() }
    }
}

#[async_trait]
impl LabelRepository for AxdbLabelRepository {
    async fn find(&self, label_type: &str, key: &str, value: &str) -> Result<Option<Label>, RepositoryError> {
        let p = params([("type", label_type), ("key", key), ("value", value)]);
        let rows = self
            .db
            .get_with_time_retry(APP_AXOPS, TABLE_LABEL, &p, &self.retry)
            .await?;
        Ok(decode_rows(rows)?.into_iter().next())
    }

    async fn list(&self, label_type: Option<&str>) -> Result<Vec<Label>, RepositoryError> {
        let p = match label_type {
            Some(t) => params([("type", t)]),
            None => Params::new(),
        };
        let rows = self
            .db
            .get_with_time_retry(APP_AXOPS, TABLE_LABEL, &p, &self.retry)
            .await?;
        Ok(decode_rows(rows)?)
    }

    async fn save(&self, label: &Label) -> Result<(), RepositoryError> {
        self.db
            .put_with_time_retry(APP_AXOPS, TABLE_LABEL, &serde_json::to_value(label)?, &self.retry)
            .await?;
        Ok(())
    }

    async fn delete(&self, label: &Label) -> Result<(), RepositoryError> {
        let selector = json!([{ "type": label.label_type, "key": label.key, "value": label.value }]);
        self.db
            .delete_with_time_retry(APP_AXOPS, TABLE_LABEL, &selector, &self.retry)
            .await?;
        Ok(())
    }
}

pub struct AxdbSessionRepository {
    db: Arc<dyn DatabaseClient>,
    retry: RetryConfig,
}

impl AxdbSessionRepository {
    pub fn new(db: Arc<dyn DatabaseClient>) -> Self {
        Self { db, retry: db_retry() }
    }
}

#[async_trait]
impl SessionRepository for AxdbSessionRepository {
    async fn find(&self, id: &str) -> Result<Option<Session>, RepositoryError> {
        let rows = self
            .db
            .get_with_time_retry(APP_AXOPS, TABLE_SESSION, &params([("id", id)]), &self.retry)
            .await?;
        Ok(decode_rows(rows)?.into_iter().next())
    }

    async fn save(&self, session: &Session) -> Result<(), RepositoryError> {
        self.db
            .put_with_time_retry(APP_AXOPS, TABLE_SESSION, &serde_json::to_value(session)?, &self.retry)
            .await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), RepositoryError> {
        self.db
            .delete_with_time_retry(APP_AXOPS, TABLE_SESSION, &json!([{ "id": id }]), &self.retry)
            .await?;
        Ok(())
    }
}

pub struct AxdbSearchIndexRepository {
    db: Arc<dyn DatabaseClient>,
    retry: RetryConfig,
}

impl AxdbSearchIndexRepository {
    pub fn new(db: Arc<dyn DatabaseClient>) -> Self {
        Self { db, retry: db_retry() }
    }
}

#[async_trait]
impl SearchIndexRepository for AxdbSearchIndexRepository {
    async fn save(&self, entry: &SearchIndexEntry) -> Result<(), RepositoryError> {
        self.db
            .put_with_time_retry(APP_AXOPS, TABLE_SEARCH_INDEX, &serde_json::to_value(entry)?, &self.retry)
            .await?;
        Ok(())
    }
}
