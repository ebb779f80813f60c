// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! HTTP client for AXDB.
//!
//! Rows live at `{root}/{app}/{table}`. GET parameters are URL-encoded:
//! strings are sent as-is, string arrays as repeated values, and every other
//! value (maps, numbers, the Lucene query object) is JSON-encoded first.

use super::{DatabaseClient, Params};
use crate::domain::error::{codes, AxResult};
use crate::infrastructure::rest_client::RestClient;
use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use std::time::Duration;

/// Per-request timeout for database calls.
pub const DATABASE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

pub struct HttpDatabaseClient {
    rest: RestClient,
}

impl HttpDatabaseClient {
    pub fn new(root_url: impl Into<String>) -> AxResult<Self> {
        Self::with_timeout(root_url, DATABASE_TIMEOUT)
    }

    pub fn with_timeout(root_url: impl Into<String>, timeout: Duration) -> AxResult<Self> {
        let rest = RestClient::new(root_url, timeout)?
            .with_error_codes(codes::ERR_AXDB_INTERNAL, codes::ERR_AXDB_INVALID_PARAM);
        Ok(Self { rest })
    }

    fn path(app: &str, table: &str) -> String {
        format!("/{}/{}", app, table)
    }
}

/// Flatten `params` into URL query pairs.
pub fn encode_params(params: &Params) -> Vec<(String, String)> {
    let mut pairs = Vec::with_capacity(params.len());
    for (key, value) in params {
        match value {
            Value::String(s) => pairs.push((key.clone(), s.clone())),
            Value::Array(items) if items.iter().all(Value::is_string) => {
                for item in items {
                    if let Value::String(s) = item {
                        pairs.push((key.clone(), s.clone()));
                    }
                }
            }
            other => pairs.push((key.clone(), other.to_string())),
        }
    }
    pairs
}

fn rows(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

#[async_trait]
impl DatabaseClient for HttpDatabaseClient {
    async fn get(&self, app: &str, table: &str, params: &Params) -> AxResult<Vec<Value>> {
        let query = encode_params(params);
        let value = self
            .rest
            .send(Method::GET, &Self::path(app, table), &query, None)
            .await?;
        Ok(rows(value))
    }

    async fn post(&self, app: &str, table: &str, payload: &Value) -> AxResult<Value> {
        self.rest
            .send(Method::POST, &Self::path(app, table), &[], Some(payload))
            .await
    }

    async fn put(&self, app: &str, table: &str, payload: &Value) -> AxResult<Value> {
        self.rest
            .send(Method::PUT, &Self::path(app, table), &[], Some(payload))
            .await
    }

    async fn delete(&self, app: &str, table: &str, payload: &Value) -> AxResult<Value> {
        self.rest
            .send(Method::DELETE, &Self::path(app, table), &[], Some(payload))
            .await
    }
}
