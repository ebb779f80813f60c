// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod admission_client;
pub mod am_client;
pub mod axdb;
pub mod bus;
pub mod cache;
pub mod etag;
pub mod heartbeat_registry;
pub mod lock;
pub mod notification_producer;
pub mod pod_proxy;
pub mod repositories;
pub mod rest_client;
pub mod retry;
pub mod secrets;

pub use heartbeat_registry::{Heartbeat, HeartbeatRegistry};
pub use lock::KeyedLockGroup;
