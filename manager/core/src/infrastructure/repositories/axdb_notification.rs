// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Notification center persistence: rules, events and the code catalogue.

use super::db_retry;
use crate::domain::notification::{EventNotificationMessage, NotificationCode, Rule};
use crate::domain::repository::{
    EventRepository, NotificationCodeRepository, RepositoryError, RuleRepository,
};
use crate::infrastructure::axdb::schema::{APP_AXNC, TABLE_CODE, TABLE_EVENTS, TABLE_RULE};
use crate::infrastructure::axdb::{decode_rows, params, DatabaseClient, Params, COLUMN_TIME, PARAM_MAX_ENTRIES};
use crate::infrastructure::retry::RetryConfig;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

pub struct AxdbRuleRepository {
    db: Arc<dyn DatabaseClient>,
    retry: RetryConfig,
}

impl AxdbRuleRepository {
    pub fn new(db: Arc<dyn DatabaseClient>) -> Self {
        Self { db, retry: db_retry() }
    }
}

#[async_trait]
impl RuleRepository for AxdbRuleRepository {
    async fn list_rules(&self) -> Result<Vec<Rule>, RepositoryError> {
        let rows = self
            .db
            .get_with_time_retry(APP_AXNC, TABLE_RULE, &Params::new(), &self.retry)
            .await?;
        Ok(decode_rows(rows)?)
    }

    async fn get_rule(&self, rule_id: &str) -> Result<Option<Rule>, RepositoryError> {
        let rows = self
            .db
            .get_with_time_retry(APP_AXNC, TABLE_RULE, &params([("rule_id", rule_id)]), &self.retry)
            .await?;
        Ok(decode_rows(rows)?.into_iter().next())
    }

    async fn save_rule(&self, rule: &Rule) -> Result<(), RepositoryError> {
        let row = serde_json::to_value(rule)?;
        self.db
            .put_with_time_retry(APP_AXNC, TABLE_RULE, &row, &self.retry)
            .await?;
        Ok(())
    }

    async fn delete_rule(&self, rule_id: &str) -> Result<(), RepositoryError> {
        self.db
            .delete_with_time_retry(APP_AXNC, TABLE_RULE, &json!([{ "rule_id": rule_id }]), &self.retry)
            .await?;
        Ok(())
    }
}

pub struct AxdbEventRepository {
    db: Arc<dyn DatabaseClient>,
    retry: RetryConfig,
}

impl AxdbEventRepository {
    pub fn new(db: Arc<dyn DatabaseClient>) -> Self {
        Self { db, retry: db_retry() }
    }
}

#[async_trait]
impl EventRepository for AxdbEventRepository {
    async fn save_event(&self, event: &EventNotificationMessage) -> Result<(), RepositoryError> {
        let mut row = serde_json::to_value(event)?;
        if let Value::Object(map) = &mut row {
            map.insert(COLUMN_TIME.to_string(), json!(event.timestamp));
        }
        self.db
            .post_with_time_retry(APP_AXNC, TABLE_EVENTS, &row, &self.retry)
            .await?;
        Ok(())
    }

    async fn list_events(
        &self,
        trace_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<EventNotificationMessage>, RepositoryError> {
        let mut p = Params::new();
        if let Some(trace_id) = trace_id {
            p.insert("trace_id".into(), json!(trace_id));
        }
        if limit > 0 {
            p.insert(PARAM_MAX_ENTRIES.into(), json!(limit));
        }
        let rows = self
            .db
            .get_with_time_retry(APP_AXNC, TABLE_EVENTS, &p, &self.retry)
            .await?;
        Ok(decode_rows(rows)?)
    }
}

pub struct AxdbCodeRepository {
    db: Arc<dyn DatabaseClient>,
    retry: RetryConfig,
}

impl AxdbCodeRepository {
    pub fn new(db: Arc<dyn DatabaseClient>) -> Self {
        Self { db, retry: db_retry() }
    }
}

#[async_trait]
impl NotificationCodeRepository for AxdbCodeRepository {
    async fn save_code(&self, code: &NotificationCode) -> Result<(), RepositoryError> {
        let row = serde_json::to_value(code)?;
        self.db
            .put_with_time_retry(APP_AXNC, TABLE_CODE, &row, &self.retry)
            .await?;
        Ok(())
    }

    async fn list_codes(&self) -> Result<Vec<NotificationCode>, RepositoryError> {
        let rows = self
            .db
            .get_with_time_retry(APP_AXNC, TABLE_CODE, &Params::new(), &self.retry)
            .await?;
        Ok(decode_rows(rows)?)
    }
}
