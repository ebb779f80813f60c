// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use serde::{Deserialize, Serialize};

pub const INDEX_TYPE_DEPLOYMENT_NAME: &str = "deployment_name";
pub const INDEX_TYPE_APPLICATION_NAME: &str = "application_name";

/// One auto-complete suggestion for the search box.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchIndexEntry {
    #[serde(rename = "type")]
    pub index_type: String,
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub ctime: i64,
    #[serde(default)]
    pub mtime: i64,
}

impl SearchIndexEntry {
    pub fn new(index_type: &str, key: &str, value: &str, now: i64) -> Self {
        Self {
            index_type: index_type.to_string(),
            key: key.to_string(),
            value: value.to_string(),
            ctime: now,
            mtime: now,
        }
    }

    /// Identity used for de-duplication.
    pub fn identity(&self) -> (String, String, String) {
        (self.index_type.clone(), self.key.clone(), self.value.clone())
    }
}
