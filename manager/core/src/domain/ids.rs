// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Identifier and clock helpers shared by every aggregate.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::OnceLock;
use uuid::Uuid;

static NODE_ID: OnceLock<[u8; 6]> = OnceLock::new();
static LAST_MICROS: AtomicI64 = AtomicI64::new(0);

fn node_id() -> &'static [u8; 6] {
    NODE_ID.get_or_init(|| {
        let random = Uuid::new_v4();
        let mut node = [0u8; 6];
        node.copy_from_slice(&random.as_bytes()[..6]);
        // multicast bit marks a random node id
        node[0] |= 0x01;
        node
    })
}

/// Time-based (v1) UUID.
pub fn time_uuid() -> Uuid {
    Uuid::now_v1(node_id())
}

/// Name-based (v5) UUID in the URL namespace.
pub fn name_uuid(name: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes())
}

/// Wall-clock microseconds, strictly increasing within the process.
pub fn monotonic_micros() -> i64 {
    let now = chrono::Utc::now().timestamp_micros();
    let previous = LAST_MICROS
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(now.max(last + 1)))
        .unwrap_or(now);
    now.max(previous + 1)
}

pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
