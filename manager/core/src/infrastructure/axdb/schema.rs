// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Wide-column table declarations seeded into AXDB at boot.
//!
//! Each table declares its column types and index roles. Time-series tables
//! may carry a `default_time_to_live` config in seconds.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const APP_AXDB: &str = "axdb";
pub const APP_AXAMM: &str = "axamm";
pub const APP_AXOPS: &str = "axops";
pub const APP_AXNC: &str = "axnc";
pub const APP_AXDEVOPS: &str = "axdevops";

/// Operation table used to create or update a table definition.
pub const OP_UPDATE_TABLE: &str = "update_table";

pub const TABLE_DEPLOYMENTS: &str = "deployments";
pub const TABLE_DEPLOYMENT_HISTORY: &str = "deployment_history";
pub const TABLE_APPLICATIONS: &str = "applications";
pub const TABLE_LABEL: &str = "label";
pub const TABLE_SESSION: &str = "session";
pub const TABLE_SEARCH_INDEX: &str = "search_index";
pub const TABLE_EVENTS: &str = "events";
pub const TABLE_RULE: &str = "rule";
pub const TABLE_CODE: &str = "code";

const ONE_HOUR: u64 = 60 * 60;
const ONE_DAY: u64 = 24 * ONE_HOUR;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    String,
    Integer,
    Double,
    Boolean,
    Map,
    Set,
    Array,
    Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexRole {
    Partition,
    Clustering,
    Strong,
    Weak,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    KeyValue,
    TimedKeyValue,
    TimeSeries,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    pub index: IndexRole,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub app_name: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TableKind,
    pub columns: BTreeMap<String, Column>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub configs: BTreeMap<String, serde_json::Value>,
}

impl TableSchema {
    pub fn new(app_name: &str, name: &str, kind: TableKind) -> Self {
        Self {
            app_name: app_name.to_string(),
            name: name.to_string(),
            kind,
            columns: BTreeMap::new(),
            configs: BTreeMap::new(),
        }
    }

    pub fn column(mut self, name: &str, column_type: ColumnType, index: IndexRole) -> Self {
        self.columns.insert(name.to_string(), Column { column_type, index });
        self
    }

    pub fn ttl_seconds(mut self, seconds: u64) -> Self {
        self.configs
            .insert("default_time_to_live".to_string(), serde_json::Value::from(seconds));
        self
    }

    pub fn default_ttl(&self) -> Option<u64> {
        self.configs.get("default_time_to_live").and_then(|v| v.as_u64())
    }

    pub fn partition_keys(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|(_, c)| c.index == IndexRole::Partition)
            .map(|(n, _)| n.as_str())
            .collect()
    }
}

use ColumnType as T;
use IndexRole as I;

/// The latest table is keyed by the stable `deployment_id`, so it can hold at
/// most one row per `(application_name, name)`. History rows are keyed by row id.
fn deployment_columns(schema: TableSchema, latest: bool) -> TableSchema {
    let (id_role, stable_role) = if latest {
        (I::Strong, I::Partition)
    } else {
        (I::Partition, I::Strong)
    };
    schema
        .column("id", T::String, id_role)
        .column("deployment_id", T::String, stable_role)
        .column("application_name", T::String, I::Strong)
        .column("name", T::String, I::Strong)
        .column("status", T::String, I::Strong)
        .column("status_detail", T::Map, I::None)
        .column("template", T::String, I::None)
        .column("previous_deployment_id", T::String, I::None)
        .column("termination_policy", T::Map, I::None)
        .column("labels", T::Map, I::None)
        .column("create_time", T::Integer, I::None)
        .column("launch_time", T::Integer, I::None)
        .column("end_time", T::Integer, I::None)
        .column("mtime", T::Integer, I::None)
}

/// Tables owned by the deployment manager.
pub fn manager_tables() -> Vec<TableSchema> {
    vec![
        deployment_columns(TableSchema::new(APP_AXAMM, TABLE_DEPLOYMENTS, TableKind::KeyValue), true),
        deployment_columns(TableSchema::new(APP_AXAMM, TABLE_DEPLOYMENT_HISTORY, TableKind::TimeSeries), false)
            .ttl_seconds(90 * ONE_DAY),
        TableSchema::new(APP_AXAMM, TABLE_APPLICATIONS, TableKind::KeyValue)
            .column("id", T::String, I::Partition)
            .column("name", T::String, I::Strong)
            .column("status", T::String, I::Strong)
            .column("status_detail", T::Map, I::None)
            .column("description", T::String, I::None)
            .column("ctime", T::Integer, I::None)
            .column("mtime", T::Integer, I::None),
        TableSchema::new(APP_AXOPS, TABLE_LABEL, TableKind::KeyValue)
            .column("id", T::String, I::Strong)
            .column("type", T::String, I::Partition)
            .column("key", T::String, I::Clustering)
            .column("value", T::String, I::Clustering)
            .column("reserved", T::Boolean, I::None)
            .column("ctime", T::Integer, I::None),
        TableSchema::new(APP_AXOPS, TABLE_SESSION, TableKind::KeyValue)
            .column("id", T::String, I::Partition)
            .column("user_id", T::String, I::Strong)
            .column("username", T::String, I::Strong)
            .column("scheme", T::String, I::None)
            .column("state", T::String, I::None)
            .column("ctime", T::Integer, I::None)
            .column("expiry", T::Integer, I::None)
            .ttl_seconds(3 * ONE_DAY),
        TableSchema::new(APP_AXOPS, TABLE_SEARCH_INDEX, TableKind::TimedKeyValue)
            .column("type", T::String, I::Partition)
            .column("key", T::String, I::Clustering)
            .column("value", T::String, I::Clustering)
            .column("ctime", T::Integer, I::None)
            .column("mtime", T::Integer, I::None)
            .ttl_seconds(60 * ONE_DAY),
    ]
}

/// Tables owned by the notification center.
pub fn notification_tables() -> Vec<TableSchema> {
    vec![
        TableSchema::new(APP_AXNC, TABLE_EVENTS, TableKind::TimeSeries)
            .column("event_id", T::Uuid, I::Partition)
            .column("trace_id", T::Uuid, I::Strong)
            .column("code", T::String, I::Strong)
            .column("message", T::String, I::None)
            .column("facility", T::String, I::Strong)
            .column("cluster", T::String, I::Strong)
            .column("channel", T::String, I::Strong)
            .column("severity", T::String, I::Strong)
            .column("recipients", T::Array, I::None)
            .column("detail", T::Map, I::None)
            .column("acknowledged_by", T::String, I::Weak)
            .ttl_seconds(365 * ONE_DAY),
        TableSchema::new(APP_AXNC, TABLE_RULE, TableKind::KeyValue)
            .column("rule_id", T::String, I::Partition)
            .column("name", T::String, I::Strong)
            .column("channels", T::Array, I::None)
            .column("codes", T::Array, I::None)
            .column("severities", T::Array, I::None)
            .column("recipients", T::Array, I::None)
            .column("enabled", T::Boolean, I::None)
            .column("create_time", T::Integer, I::None)
            .column("last_modified_time", T::Integer, I::None),
        TableSchema::new(APP_AXNC, TABLE_CODE, TableKind::KeyValue)
            .column("channel", T::String, I::Partition)
            .column("code", T::String, I::Clustering)
            .column("message", T::String, I::None)
            .column("severity", T::String, I::None)
            .column("no_limit", T::Boolean, I::None),
    ]
}

/// Tables seeded by the ops, devops and platform services. The manager only
/// declares them so a fresh cluster can be bootstrapped from one place.
pub fn platform_tables() -> Vec<TableSchema> {
    let simple = |app: &str, name: &str, kind: TableKind, key: &str| {
        TableSchema::new(app, name, kind)
            .column(key, T::String, I::Partition)
            .column("ctime", T::Integer, I::None)
            .column("mtime", T::Integer, I::None)
    };
    vec![
        simple(APP_AXOPS, "commits", TableKind::TimeSeries, "revision")
            .column("repo", T::String, I::Strong)
            .column("branch", T::String, I::Strong)
            .column("author", T::String, I::Weak)
            .column("description", T::String, I::None),
        simple(APP_AXOPS, "policy", TableKind::KeyValue, "id")
            .column("name", T::String, I::Strong)
            .column("template", T::String, I::None)
            .column("enabled", T::Boolean, I::Strong),
        simple(APP_AXOPS, "custom_view", TableKind::KeyValue, "id")
            .column("user_id", T::String, I::Strong)
            .column("info", T::String, I::None),
        simple(APP_AXOPS, "cluster_settings", TableKind::KeyValue, "key")
            .column("value", T::String, I::None),
        simple(APP_AXDEVOPS, "workflow", TableKind::KeyValue, "id")
            .column("status", T::String, I::Strong)
            .column("service_template", T::String, I::None),
        simple(APP_AXDEVOPS, "workflow_kv", TableKind::KeyValue, "key")
            .column("value", T::String, I::None),
        simple(APP_AXDEVOPS, "workflow_leaf_service", TableKind::KeyValue, "leaf_id")
            .column("root_id", T::String, I::Strong)
            .column("detail", T::Map, I::None),
        simple(APP_AXDEVOPS, "workflow_timed_events", TableKind::TimeSeries, "root_id")
            .column("leaf_id", T::String, I::Strong)
            .column("status_detail", T::Map, I::None),
        simple(APP_AXDEVOPS, "workflow_node_event", TableKind::TimeSeries, "root_id")
            .column("leaf_id", T::String, I::Strong)
            .column("result", T::String, I::None),
        simple(APP_AXOPS, "branch", TableKind::KeyValue, "repo")
            .column("name", T::String, I::Clustering)
            .column("revision", T::String, I::None),
        simple(APP_AXOPS, "approval", TableKind::KeyValue, "root_id")
            .column("leaf_id", T::String, I::Clustering)
            .column("required_list", T::Array, I::None)
            .column("optional_list", T::Array, I::None),
        simple(APP_AXOPS, "approval_result", TableKind::KeyValue, "root_id")
            .column("user", T::String, I::Clustering)
            .column("result", T::Boolean, I::None),
        simple(APP_AXOPS, "junit_result", TableKind::TimeSeries, "result_id")
            .column("leaf_id", T::String, I::Strong)
            .column("test_suite", T::String, I::None)
            .column("duration", T::Double, I::None),
        simple(APP_AXOPS, "resource", TableKind::KeyValue, "resource_id")
            .column("category", T::String, I::Strong)
            .column("resource", T::Map, I::None)
            .column("ttl", T::Integer, I::None)
            .column("detail", T::Map, I::None),
        simple(APP_AXOPS, "artifacts", TableKind::TimeSeries, "artifact_id")
            .column("service_instance_id", T::String, I::Strong)
            .column("name", T::String, I::Strong)
            .column("tags", T::Set, I::None)
            .column("stored_byte_size", T::Integer, I::None),
        simple(APP_AXOPS, "artifact_retention", TableKind::KeyValue, "name")
            .column("retention_seconds", T::Integer, I::None),
        simple(APP_AXOPS, "artifact_meta", TableKind::KeyValue, "attribute")
            .column("value", T::String, I::None),
        simple(APP_AXOPS, "host", TableKind::TimeSeries, "id")
            .column("name", T::String, I::Strong)
            .column("status", T::Integer, I::None)
            .column("usage", T::Map, I::None)
            .ttl_seconds(ONE_HOUR),
        simple(APP_AXOPS, "container", TableKind::TimeSeries, "id")
            .column("host_id", T::String, I::Strong)
            .column("cost_id", T::Map, I::None)
            .column("usage", T::Map, I::None)
            .ttl_seconds(30 * 60),
    ]
}

/// Every table known to the platform.
pub fn catalog() -> Vec<TableSchema> {
    let mut all = manager_tables();
    all.extend(notification_tables());
    all.extend(platform_tables());
    all
}
