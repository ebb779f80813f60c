// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! In-memory AXDB for tests and local mode.
//!
//! Honours the subset of the protocol the repositories rely on: equality
//! filters, Lucene queries, time ranges, limit/offset, upsert by key columns,
//! and delete by key.

use super::query::LuceneSearch;
use super::schema::{IndexRole, TableKind, TableSchema};
use super::{
    DatabaseClient, Params, COLUMN_TIME, PARAM_LUCENE_SEARCH, PARAM_MAX_ENTRIES, PARAM_MAX_TIME,
    PARAM_MIN_TIME, PARAM_OFFSET_ENTRIES,
};
use crate::domain::error::{codes, AxError, AxResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

type Row = Map<String, Value>;

struct MemTable {
    kind: TableKind,
    keys: Vec<String>,
    rows: Vec<Row>,
}

impl MemTable {
    fn key_of(&self, row: &Row) -> Vec<Value> {
        self.keys
            .iter()
            .map(|k| row.get(k).cloned().unwrap_or(Value::Null))
            .collect()
    }

    fn upsert(&mut self, row: Row) {
        let key = self.key_of(&row);
        match self.rows.iter_mut().find(|r| self.keys.iter().zip(&key).all(|(k, v)| r.get(k).unwrap_or(&Value::Null) == v)) {
            Some(existing) => {
                for (k, v) in row {
                    existing.insert(k, v);
                }
            }
            None => self.rows.push(row),
        }
    }
}

#[derive(Clone, Default)]
pub struct InMemoryDatabase {
    tables: Arc<RwLock<HashMap<(String, String), MemTable>>>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tables(schemas: impl IntoIterator<Item = TableSchema>) -> Self {
        let db = Self::new();
        for schema in schemas {
            db.register(&schema);
        }
        db
    }

    pub fn register(&self, schema: &TableSchema) {
        let mut keys: Vec<String> = schema
            .columns
            .iter()
            .filter(|(_, c)| matches!(c.index, IndexRole::Partition | IndexRole::Clustering))
            .map(|(n, _)| n.clone())
            .collect();
        if schema.kind == TableKind::TimeSeries {
            keys.push(COLUMN_TIME.to_string());
        }
        self.tables
            .write()
            .entry((schema.app_name.clone(), schema.name.clone()))
            .or_insert(MemTable {
                kind: schema.kind,
                keys,
                rows: Vec::new(),
            });
    }

    pub fn row_count(&self, app: &str, table: &str) -> usize {
        self.tables
            .read()
            .get(&(app.to_string(), table.to_string()))
            .map(|t| t.rows.len())
            .unwrap_or(0)
    }

    fn not_found(app: &str, table: &str) -> AxError {
        AxError::new(codes::ERR_AXDB_TABLE_NOT_FOUND, format!("table {}/{} does not exist", app, table))
    }

    fn as_row(payload: &Value) -> AxResult<Row> {
        payload
            .as_object()
            .cloned()
            .ok_or_else(|| AxError::new(codes::ERR_AXDB_INVALID_PARAM, "payload must be an object"))
    }

    fn write(&self, app: &str, table: &str, payload: &Value) -> AxResult<Value> {
        if app == super::schema::APP_AXDB && table == super::schema::OP_UPDATE_TABLE {
            let schema: TableSchema = serde_json::from_value(payload.clone())
                .map_err(|e| AxError::from_cause(e, codes::ERR_AXDB_INVALID_PARAM, "invalid table schema"))?;
            self.register(&schema);
            return Ok(Value::Null);
        }

        let mut row = Self::as_row(payload)?;
        let mut tables = self.tables.write();
        let mem = tables
            .get_mut(&(app.to_string(), table.to_string()))
            .ok_or_else(|| Self::not_found(app, table))?;
        if mem.kind == TableKind::TimeSeries && !row.contains_key(COLUMN_TIME) {
            row.insert(COLUMN_TIME.to_string(), Value::from(chrono::Utc::now().timestamp_micros()));
        }
        mem.upsert(row.clone());
        Ok(Value::Object(row))
    }
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn sort_value(row: &Row, field: &str) -> Value {
    row.get(field).cloned().unwrap_or(Value::Null)
}

fn cmp_values(a: &Value, b: &Value) -> std::cmp::Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(std::cmp::Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Null, Value::Null) => std::cmp::Ordering::Equal,
        (Value::Null, _) => std::cmp::Ordering::Less,
        (_, Value::Null) => std::cmp::Ordering::Greater,
        _ => std::cmp::Ordering::Equal,
    }
}

#[async_trait]
impl DatabaseClient for InMemoryDatabase {
    async fn get(&self, app: &str, table: &str, params: &Params) -> AxResult<Vec<Value>> {
        let tables = self.tables.read();
        let mem = tables
            .get(&(app.to_string(), table.to_string()))
            .ok_or_else(|| Self::not_found(app, table))?;

        let search: Option<LuceneSearch> = match params.get(PARAM_LUCENE_SEARCH) {
            Some(Value::String(s)) => serde_json::from_str(s).ok(),
            Some(v) => serde_json::from_value(v.clone()).ok(),
            None => None,
        };
        let min_time = params.get(PARAM_MIN_TIME).and_then(as_i64);
        let max_time = params.get(PARAM_MAX_TIME).and_then(as_i64);

        let mut rows: Vec<&Row> = mem
            .rows
            .iter()
            .filter(|row| {
                params.iter().filter(|(k, _)| !k.starts_with("ax_")).all(|(k, expected)| {
                    match (row.get(k), expected) {
                        (Some(actual), Value::Array(options)) => options.contains(actual),
                        (Some(actual), expected) => actual == expected,
                        (None, _) => false,
                    }
                })
            })
            .filter(|row| search.as_ref().map(|s| s.matches(row)).unwrap_or(true))
            .filter(|row| {
                let t = row.get(COLUMN_TIME).and_then(as_i64);
                match t {
                    Some(t) => min_time.map(|m| t >= m).unwrap_or(true) && max_time.map(|m| t <= m).unwrap_or(true),
                    None => true,
                }
            })
            .collect();

        match search.as_ref().filter(|s| !s.sort.is_empty()) {
            Some(s) => rows.sort_by(|a, b| {
                for sorter in &s.sort {
                    let ord = cmp_values(&sort_value(a, &sorter.field), &sort_value(b, &sorter.field));
                    let ord = if sorter.reverse { ord.reverse() } else { ord };
                    if ord != std::cmp::Ordering::Equal {
                        return ord;
                    }
                }
                std::cmp::Ordering::Equal
            }),
            None if mem.kind == TableKind::TimeSeries => rows.sort_by(|a, b| {
                cmp_values(&sort_value(b, COLUMN_TIME), &sort_value(a, COLUMN_TIME))
            }),
            None => {}
        }

        let offset = params.get(PARAM_OFFSET_ENTRIES).and_then(as_i64).unwrap_or(0).max(0) as usize;
        let limit = params.get(PARAM_MAX_ENTRIES).and_then(as_i64).filter(|l| *l > 0);

        let iter = rows.into_iter().skip(offset).cloned().map(Value::Object);
        Ok(match limit {
            Some(l) => iter.take(l as usize).collect(),
            None => iter.collect(),
        })
    }

    async fn post(&self, app: &str, table: &str, payload: &Value) -> AxResult<Value> {
        self.write(app, table, payload)
    }

    async fn put(&self, app: &str, table: &str, payload: &Value) -> AxResult<Value> {
        self.write(app, table, payload)
    }

    async fn delete(&self, app: &str, table: &str, payload: &Value) -> AxResult<Value> {
        let selectors: Vec<Row> = match payload {
            Value::Array(items) => items.iter().map(Self::as_row).collect::<AxResult<_>>()?,
            other => vec![Self::as_row(other)?],
        };
        let mut tables = self.tables.write();
        let mem = tables
            .get_mut(&(app.to_string(), table.to_string()))
            .ok_or_else(|| Self::not_found(app, table))?;
        mem.rows.retain(|row| {
            !selectors
                .iter()
                .any(|sel| sel.iter().all(|(k, v)| row.get(k) == Some(v)))
        });
        Ok(Value::Null)
    }
}
