// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use crate::domain::error::{AxError, AxResult};
use crate::domain::ids::{now_secs, time_uuid};
use serde::{Deserialize, Serialize};

/// Label types accepted by the ops API.
pub const LABEL_TYPES: [&str; 4] = ["user", "service", "policy", "deployment"];

/// A `(type, key, value)` tag; unique per triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub label_type: String,
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub reserved: bool,
    #[serde(default)]
    pub ctime: i64,
}

impl Label {
    pub fn new(label_type: impl Into<String>, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            id: time_uuid().to_string(),
            label_type: label_type.into(),
            key: key.into(),
            value: value.into(),
            reserved: false,
            ctime: now_secs(),
        }
    }

    pub fn validate(&self) -> AxResult<()> {
        if !LABEL_TYPES.contains(&self.label_type.as_str()) {
            return Err(AxError::invalid_param(format!("Invalid label type: {}", self.label_type)));
        }
        if self.key.trim().is_empty() {
            return Err(AxError::invalid_param("Label key can not be empty"));
        }
        if self.key.len() > 64 || self.value.len() > 128 {
            return Err(AxError::invalid_param("Label key or value is too long"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        assert!(Label::new("deployment", "tier", "web").validate().is_ok());
        assert!(Label::new("planet", "tier", "web").validate().is_err());
        assert!(Label::new("user", " ", "web").validate().is_err());
        assert!(Label::new("user", "k".repeat(65), "").validate().is_err());
    }
}
