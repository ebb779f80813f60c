// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain model: deployments, notifications, labels, sessions and the ports
//! the application layer drives.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer

pub mod deployment;
pub mod error;
pub mod ids;
pub mod label;
pub mod notification;
pub mod platform;
pub mod repository;
pub mod search_index;
pub mod session;
