// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Application services and the background loops that drive them.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer

pub mod deployment_monitor;
pub mod deployment_service;
pub mod label_service;
pub mod notification_center;
pub mod search_index;
pub mod session_service;
pub mod supervisor;
