// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # AX Application/Deployment Manager Core
//!
//! Domain model, platform clients, reconciler and HTTP surfaces shared by the
//! `axamm manager`, `axamm notifier` and `axamm pod-agent` processes.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Library behind the `axamm` binary

pub mod domain;
pub mod application;
pub mod infrastructure;
pub mod presentation;

pub use domain::*;
