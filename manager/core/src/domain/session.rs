// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Login sessions.
//!
//! A session lives [`SESSION_RETENTION`] from creation. A session validated in
//! its final [`SESSION_EXTENSION_WINDOW`] is pushed out to a full retention
//! period again.

use crate::domain::ids::time_uuid;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const SESSION_RETENTION: Duration = Duration::from_secs(72 * 60 * 60);
pub const SESSION_EXTENSION_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub username: String,
    #[serde(default)]
    pub scheme: String,
    #[serde(default)]
    pub state: String,
    pub ctime: i64,
    /// Seconds since the epoch.
    pub expiry: i64,
}

impl Session {
    pub fn new(user_id: impl Into<String>, username: impl Into<String>, scheme: impl Into<String>, now: i64) -> Self {
        Self {
            id: time_uuid().to_string(),
            user_id: user_id.into(),
            username: username.into(),
            scheme: scheme.into(),
            state: String::new(),
            ctime: now,
            expiry: now + SESSION_RETENTION.as_secs() as i64,
        }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expiry
    }

    pub fn needs_extension(&self, now: i64) -> bool {
        !self.is_expired(now) && self.expiry - now <= SESSION_EXTENSION_WINDOW.as_secs() as i64
    }

    pub fn extend(&mut self, now: i64) {
        self.expiry = now + SESSION_RETENTION.as_secs() as i64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifetime() {
        let s = Session::new("u1", "alice", "native", 1_000);
        let retention = SESSION_RETENTION.as_secs() as i64;
        assert!(!s.is_expired(1_000 + retention - 1));
        assert!(s.is_expired(1_000 + retention));
        assert!(!s.needs_extension(1_000 + 60));
        assert!(s.needs_extension(1_000 + retention - 60));
    }
}
