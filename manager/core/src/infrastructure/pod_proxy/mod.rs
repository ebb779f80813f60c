// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Pod API Port
//!
//! The narrow slice of the container orchestrator's pod API that the pod
//! agent exposes. Upstream responses, including failure `Status` objects, are
//! passed through as [`PodResponse`]; only transport failures are errors.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Pod subresource access for the pod agent

pub mod kube;

pub use kube::KubeApiClient;

use crate::domain::error::AxResult;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

pub type Query = Vec<(String, String)>;

/// One decoded watch event, `{"type": ..., "object": {...}}`.
pub type WatchStream = BoxStream<'static, AxResult<Value>>;

#[derive(Debug, Clone, PartialEq)]
pub struct PodResponse {
    pub status: u16,
    pub body: Value,
}

impl PodResponse {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }
}

/// Patch flavours selected by the request's `Content-Type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchStrategy {
    Json,
    Merge,
    StrategicMerge,
}

impl PatchStrategy {
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let media = content_type.split(';').next().unwrap_or_default().trim();
        match media {
            "application/json-patch+json" => Some(Self::Json),
            "application/merge-patch+json" => Some(Self::Merge),
            "application/strategic-merge-patch+json" => Some(Self::StrategicMerge),
            _ => None,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Json => "application/json-patch+json",
            Self::Merge => "application/merge-patch+json",
            Self::StrategicMerge => "application/strategic-merge-patch+json",
        }
    }
}

#[async_trait]
pub trait PodApi: Send + Sync {
    async fn list(&self, namespace: &str, query: &Query) -> AxResult<PodResponse>;

    /// Open a watch. Dropping the stream closes the upstream watch.
    async fn watch(&self, namespace: &str, query: &Query) -> AxResult<WatchStream>;

    async fn delete_collection(&self, namespace: &str, query: &Query) -> AxResult<PodResponse>;

    async fn create(&self, namespace: &str, pod: &Value) -> AxResult<PodResponse>;

    async fn get(&self, namespace: &str, name: &str) -> AxResult<PodResponse>;

    async fn update(&self, namespace: &str, name: &str, pod: &Value) -> AxResult<PodResponse>;

    async fn patch(&self, namespace: &str, name: &str, strategy: PatchStrategy, patch: &Value)
        -> AxResult<PodResponse>;

    async fn delete(&self, namespace: &str, name: &str, options: Option<&Value>) -> AxResult<PodResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_strategy_from_content_type() {
        assert_eq!(
            PatchStrategy::from_content_type("application/merge-patch+json; charset=utf-8"),
            Some(PatchStrategy::Merge)
        );
        assert_eq!(
            PatchStrategy::from_content_type("application/strategic-merge-patch+json"),
            Some(PatchStrategy::StrategicMerge)
        );
        assert_eq!(PatchStrategy::from_content_type("application/json"), None);
    }
}
