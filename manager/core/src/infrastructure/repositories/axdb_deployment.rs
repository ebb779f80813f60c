// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Deployment persistence over the `axamm/deployments` (latest) and
//! `axamm/deployment_history` tables.
//!
//! Templates are stored as JSON text, compressed once they pass
//! [`COMPRESSION_THRESHOLD`](crate::infrastructure::axdb::codec::COMPRESSION_THRESHOLD).

use super::db_retry;
use crate::domain::deployment::{Deployment, DeploymentStatus, StatusDetail, TerminationPolicy};
use crate::domain::repository::{DeploymentQuery, DeploymentRepository, RepositoryError};
use crate::infrastructure::axdb::codec::{maybe_compress, maybe_decompress};
use crate::infrastructure::axdb::query::{LuceneFilter, LuceneSearch};
use crate::infrastructure::axdb::schema::{APP_AXAMM, TABLE_DEPLOYMENTS, TABLE_DEPLOYMENT_HISTORY};
use crate::infrastructure::axdb::{
    params, DatabaseClient, Params, COLUMN_TIME, PARAM_LUCENE_SEARCH, PARAM_MAX_ENTRIES,
    PARAM_OFFSET_ENTRIES,
};
use crate::infrastructure::retry::RetryConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

const SEARCH_FIELDS: [&str; 2] = ["name", "application_name"];

/// Storage shape of a deployment row.
#[derive(Debug, Serialize, Deserialize)]
struct DeploymentRow {
    id: String,
    deployment_id: String,
    application_name: String,
    name: String,
    status: String,
    #[serde(default)]
    status_detail: StatusDetail,
    #[serde(default)]
    template: String,
    #[serde(default)]
    previous_deployment_id: String,
    #[serde(default)]
    termination_policy: TerminationPolicy,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(default)]
    create_time: i64,
    #[serde(default)]
    launch_time: i64,
    #[serde(default)]
    end_time: i64,
    #[serde(default)]
    mtime: i64,
    #[serde(rename = "ax_time", default, skip_serializing_if = "Option::is_none")]
    time: Option<i64>,
}

impl DeploymentRow {
    fn encode(d: &Deployment, time: Option<i64>) -> Result<Self, RepositoryError> {
        let template = if d.template.is_null() {
            String::new()
        } else {
            maybe_compress(serde_json::to_string(&d.template)?)?
        };
        Ok(Self {
            id: d.id.clone(),
            deployment_id: d.deployment_id.clone(),
            application_name: d.application_name.clone(),
            name: d.name.clone(),
            status: d.status.to_string(),
            status_detail: d.status_detail.clone(),
            template,
            previous_deployment_id: d.previous_deployment_id.clone().unwrap_or_default(),
            termination_policy: d.termination_policy.clone(),
            labels: d.labels.clone(),
            create_time: d.create_time,
            launch_time: d.launch_time,
            end_time: d.end_time,
            mtime: d.mtime,
            time,
        })
    }

    fn decode(self) -> Result<Deployment, RepositoryError> {
        let template = if self.template.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&maybe_decompress(&self.template)?)?
        };
        let status = self
            .status
            .parse::<DeploymentStatus>()
            .map_err(|e| RepositoryError::Serialization(e.message().to_string()))?;
        Ok(Deployment {
            id: self.id,
            deployment_id: self.deployment_id,
            application_name: self.application_name,
            name: self.name,
            status,
            status_detail: self.status_detail,
            template,
            previous_deployment_id: Some(self.previous_deployment_id).filter(|p| !p.is_empty()),
            termination_policy: self.termination_policy,
            labels: self.labels,
            create_time: self.create_time,
            launch_time: self.launch_time,
            end_time: self.end_time,
            mtime: self.mtime,
        })
    }
}

/// History rows are keyed by `(id, ax_time)`; pinning `ax_time` to the row's
/// creation makes every rewrite of one generation land on the same row.
fn history_time(d: &Deployment) -> i64 {
    d.create_time * 1_000_000
}

pub struct AxdbDeploymentRepository {
    db: Arc<dyn DatabaseClient>,
    retry: RetryConfig,
}

impl AxdbDeploymentRepository {
    pub fn new(db: Arc<dyn DatabaseClient>) -> Self {
        Self { db, retry: db_retry() }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    async fn fetch(&self, table: &str, params: &Params) -> Result<Vec<Deployment>, RepositoryError> {
        let rows = self
            .db
            .get_with_time_retry(APP_AXAMM, table, params, &self.retry)
            .await?;
        rows.into_iter()
            .map(|row| serde_json::from_value::<DeploymentRow>(row)?.decode())
            .collect()
    }

    async fn fetch_one(&self, table: &str, params: &Params) -> Result<Option<Deployment>, RepositoryError> {
        Ok(self.fetch(table, params).await?.into_iter().next())
    }

    fn list_params(query: &DeploymentQuery) -> Params {
        let mut p = Params::new();
        if let Some(app) = &query.application_name {
            p.insert("application_name".into(), json!(app));
        }
        if let Some(name) = &query.name {
            p.insert("name".into(), json!(name));
        }
        if !query.statuses.is_empty() {
            let statuses: Vec<&str> = query.statuses.iter().map(|s| s.as_str()).collect();
            p.insert("status".into(), json!(statuses));
        }

        let mut search = LuceneSearch::new();
        if let Some(text) = query.search.as_deref().filter(|t| !t.is_empty()) {
            search = search.search(text, &SEARCH_FIELDS);
        }
        if query.min_time.is_some() || query.max_time.is_some() {
            search = search.must(LuceneFilter::range(
                "create_time",
                query.min_time.map(Value::from),
                query.max_time.map(Value::from),
            ));
        }
        match query.sort.as_deref().filter(|s| !s.is_empty()) {
            Some(sort) => {
                let (field, reverse) = match sort.strip_prefix('-') {
                    Some(field) => (field, true),
                    None => (sort, false),
                };
                search = search.sort_by(field, reverse);
            }
            None => search = search.sort_by("create_time", true),
        }
        p.insert(PARAM_LUCENE_SEARCH.into(), search.to_value());

        if let Some(limit) = query.limit {
            p.insert(PARAM_MAX_ENTRIES.into(), json!(limit));
        }
        if let Some(offset) = query.offset {
            p.insert(PARAM_OFFSET_ENTRIES.into(), json!(offset));
        }
        p
    }
}

#[async_trait]
impl DeploymentRepository for AxdbDeploymentRepository {
    async fn save_latest(&self, deployment: &Deployment) -> Result<(), RepositoryError> {
        let row = serde_json::to_value(DeploymentRow::encode(deployment, None)?)?;
        self.db
            .put_with_time_retry(APP_AXAMM, TABLE_DEPLOYMENTS, &row, &self.retry)
            .await?;
        Ok(())
    }

    async fn find_latest_by_id(&self, id: &str) -> Result<Option<Deployment>, RepositoryError> {
        self.fetch_one(TABLE_DEPLOYMENTS, &params([("id", id)])).await
    }

    async fn find_latest_by_name(
        &self,
        application_name: &str,
        name: &str,
    ) -> Result<Option<Deployment>, RepositoryError> {
        let stable = Deployment::stable_id(application_name, name);
        self.fetch_one(TABLE_DEPLOYMENTS, &params([("deployment_id", stable)]))
            .await
    }

    async fn list_latest(&self, query: &DeploymentQuery) -> Result<Vec<Deployment>, RepositoryError> {
        self.fetch(TABLE_DEPLOYMENTS, &Self::list_params(query)).await
    }

    async fn remove_latest(&self, deployment: &Deployment) -> Result<(), RepositoryError> {
        let selector = json!([{ "deployment_id": deployment.deployment_id, "id": deployment.id }]);
        self.db
            .delete_with_time_retry(APP_AXAMM, TABLE_DEPLOYMENTS, &selector, &self.retry)
            .await?;
        Ok(())
    }

    async fn save_history(&self, deployment: &Deployment) -> Result<(), RepositoryError> {
        let row = DeploymentRow::encode(deployment, Some(history_time(deployment)))?;
        self.db
            .put_with_time_retry(APP_AXAMM, TABLE_DEPLOYMENT_HISTORY, &serde_json::to_value(row)?, &self.retry)
            .await?;
        Ok(())
    }

    async fn find_history_by_id(&self, id: &str) -> Result<Option<Deployment>, RepositoryError> {
        self.fetch_one(TABLE_DEPLOYMENT_HISTORY, &params([("id", id)])).await
    }

    async fn delete_history(&self, deployment: &Deployment) -> Result<(), RepositoryError> {
        let selector = json!([{ "id": deployment.id, COLUMN_TIME: history_time(deployment) }]);
        self.db
            .delete_with_time_retry(APP_AXAMM, TABLE_DEPLOYMENT_HISTORY, &selector, &self.retry)
            .await?;
        Ok(())
    }
}
