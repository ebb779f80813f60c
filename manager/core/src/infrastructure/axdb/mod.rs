// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # AXDB Database Client
//!
//! Typed access to the wide-column key/value/time-series store.
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`bootstrap`] | Readiness check and schema seeding |
//! | [`client`] | `HttpDatabaseClient` over the AXDB REST protocol |
//! | [`memory`] | `InMemoryDatabase` used by tests and local mode |
//! | [`query`] | Lucene-style query builder |
//! | [`schema`] | Table declarations seeded at boot |
//! | [`codec`] | Compression for oversized values |
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure Layer
//! - **Purpose:** Persistence port implementation for every repository

pub mod bootstrap;
pub mod client;
pub mod codec;
pub mod memory;
pub mod query;
pub mod schema;

use crate::domain::error::AxResult;
use crate::infrastructure::retry::{retry, RetryConfig};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

pub use client::HttpDatabaseClient;
pub use memory::InMemoryDatabase;
pub use query::{LuceneFilter, LuceneSearch};

pub type Params = serde_json::Map<String, Value>;

pub const PARAM_LUCENE_SEARCH: &str = "ax_lucene_search";
pub const PARAM_MAX_ENTRIES: &str = "ax_max_entries";
pub const PARAM_OFFSET_ENTRIES: &str = "ax_offset_entries";
pub const PARAM_MIN_TIME: &str = "ax_min_time";
pub const PARAM_MAX_TIME: &str = "ax_max_time";
pub const PARAM_SELECT_COLUMNS: &str = "ax_select_columns";
/// Row timestamp column of time-series tables, in microseconds.
pub const COLUMN_TIME: &str = "ax_time";

/// The `{Get, Put, Post, Delete}` capability every repository is built on.
#[async_trait]
pub trait DatabaseClient: Send + Sync {
    async fn get(&self, app: &str, table: &str, params: &Params) -> AxResult<Vec<Value>>;

    async fn post(&self, app: &str, table: &str, payload: &Value) -> AxResult<Value>;

    async fn put(&self, app: &str, table: &str, payload: &Value) -> AxResult<Value>;

    async fn delete(&self, app: &str, table: &str, payload: &Value) -> AxResult<Value>;

    async fn get_with_time_retry(
        &self,
        app: &str,
        table: &str,
        params: &Params,
        config: &RetryConfig,
    ) -> AxResult<Vec<Value>> {
        retry(Some(config), || self.get(app, table, params)).await
    }

    /// POST has no idempotency token, so it is only retried on explicit request.
    async fn post_with_time_retry(
        &self,
        app: &str,
        table: &str,
        payload: &Value,
        config: &RetryConfig,
    ) -> AxResult<Value> {
        retry(Some(config), || self.post(app, table, payload)).await
    }

    async fn put_with_time_retry(
        &self,
        app: &str,
        table: &str,
        payload: &Value,
        config: &RetryConfig,
    ) -> AxResult<Value> {
        retry(Some(config), || self.put(app, table, payload)).await
    }

    async fn delete_with_time_retry(
        &self,
        app: &str,
        table: &str,
        payload: &Value,
        config: &RetryConfig,
    ) -> AxResult<Value> {
        retry(Some(config), || self.delete(app, table, payload)).await
    }
}

/// Decode every row of a result set into `T`.
pub fn decode_rows<T: DeserializeOwned>(rows: Vec<Value>) -> AxResult<Vec<T>> {
    rows.into_iter()
        .map(|row| serde_json::from_value(row).map_err(Into::into))
        .collect()
}

/// Build a params map from `(key, value)` pairs.
pub fn params<I, K, V>(pairs: I) -> Params
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect()
}
