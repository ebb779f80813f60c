// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Typed Error Model
//!
//! Every client, repository and service in the manager reports failures as an
//! [`AxError`]: a stable machine `code`, a human `message`, an optional
//! `detail`, the causal chain, and (for wrapped errors) the backtrace captured
//! at the wrap site.
//!
//! The JSON wire form is `{code, message, detail?}`. The HTTP status of an
//! error is derived from its code, see [`AxError::http_status`].
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Shared error vocabulary for every bounded context

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::backtrace::Backtrace;
use std::fmt;
use std::sync::Arc;

/// Stable error codes carried on the wire.
pub mod codes {
    pub const ERR_UNAUTHORIZED: &str = "ERR_UNAUTHORIZED";
    pub const ERR_BAD_REQUEST: &str = "ERR_BAD_REQUEST";
    pub const ERR_FORBIDDEN: &str = "ERR_FORBIDDEN";
    pub const ERR_NOT_FOUND: &str = "ERR_NOT_FOUND";
    pub const ERR_NOT_IMPLEMENTED: &str = "ERR_NOT_IMPLEMENTED";
    pub const ERR_TIMEOUT: &str = "ERR_TIMEOUT";
    pub const ERR_INTERNAL: &str = "ERR_INTERNAL";
    pub const ERR_CONFLICT: &str = "ERR_CONFLICT";

    pub const ERR_API_INVALID_PARAM: &str = "ERR_API_INVALID_PARAM";
    pub const ERR_API_DUP_LABEL: &str = "ERR_API_DUP_LABEL";
    pub const ERR_API_EXPIRED_SESSION: &str = "ERR_API_EXPIRED_SESSION";

    pub const ERR_AX_HTTP_CONNECTION: &str = "ERR_AX_HTTP_CONNECTION";

    pub const ERR_AXDB_INTERNAL: &str = "ERR_AXDB_INTERNAL";
    pub const ERR_AXDB_INVALID_PARAM: &str = "ERR_AXDB_INVALID_PARAM";
    pub const ERR_AXDB_TABLE_NOT_FOUND: &str = "ERR_AXDB_TABLE_NOT_FOUND";
    pub const ERR_AXDB_CONDITIONAL_UPDATE_FAILURE: &str = "ERR_AXDB_CONDITIONAL_UPDATE_FAILURE";

    pub const ERR_CACHE_NOT_FOUND: &str = "ERR_CACHE_NOT_FOUND";
    pub const ERR_EVENT_INVALID: &str = "ERR_EVENT_INVALID";

    pub const ERR_RESERVING_RESOURCE: &str = "ERR_RESERVING_RESOURCE";
    pub const ERR_CREATING_DEPLOYMENT: &str = "ERR_CREATING_DEPLOYMENT";
    pub const ERR_UPGRADING_DEPLOYMENT: &str = "ERR_UPGRADING_DEPLOYMENT";
    pub const ERR_DELETING_DEPLOYMENT: &str = "ERR_DELETING_DEPLOYMENT";
    pub const ERR_STOPPING_DEPLOYMENT: &str = "ERR_STOPPING_DEPLOYMENT";
    pub const ERR_STARTING_DEPLOYMENT: &str = "ERR_STARTING_DEPLOYMENT";
    pub const ERR_SCALING_DEPLOYMENT: &str = "ERR_SCALING_DEPLOYMENT";
    pub const ERR_DEPLOYMENT_UNHEALTHY: &str = "ERR_DEPLOYMENT_UNHEALTHY";
    pub const ERR_DEPLOYMENT_TIMEOUT: &str = "ERR_DEPLOYMENT_TIMEOUT";
}

pub type AxResult<T> = Result<T, AxError>;

type Cause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Structured error with a stable machine code.
#[derive(Clone)]
pub struct AxError {
    code: String,
    message: String,
    detail: Option<String>,
    cause: Option<Cause>,
    backtrace: Option<Arc<Backtrace>>,
}

impl AxError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            detail: None,
            cause: None,
            backtrace: None,
        }
    }

    /// Wrap `cause` under a new code. Returns `None` when there is nothing to wrap.
    pub fn wrap<E>(cause: Option<E>, code: impl Into<String>, message: impl Into<String>) -> Option<Self>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        cause.map(|c| Self::from_cause(c, code, message))
    }

    /// Wrap a concrete cause, capturing the backtrace at this call site.
    pub fn from_cause<E>(cause: E, code: impl Into<String>, message: impl Into<String>) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            code: code.into(),
            message: message.into(),
            detail: None,
            cause: Some(Arc::new(cause)),
            backtrace: Some(Arc::new(Backtrace::force_capture())),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn invalid_param(message: impl Into<String>) -> Self {
        Self::new(codes::ERR_API_INVALID_PARAM, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(codes::ERR_BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(codes::ERR_NOT_FOUND, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(codes::ERR_UNAUTHORIZED, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(codes::ERR_CONFLICT, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(codes::ERR_INTERNAL, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(codes::ERR_TIMEOUT, message)
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(codes::ERR_AX_HTTP_CONNECTION, message)
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    pub fn backtrace(&self) -> Option<&Backtrace> {
        self.backtrace.as_deref()
    }

    pub fn is_code(&self, code: &str) -> bool {
        self.code == code
    }

    /// Innermost error of the causal chain. An error without a cause is its own root.
    pub fn root_cause(&self) -> &(dyn std::error::Error + 'static) {
        let mut current: &(dyn std::error::Error + 'static) = self;
        while let Some(next) = current.source() {
            current = next;
        }
        current
    }

    /// HTTP status derived from the code.
    pub fn http_status(&self) -> u16 {
        match self.code.as_str() {
            codes::ERR_BAD_REQUEST
            | codes::ERR_API_INVALID_PARAM
            | codes::ERR_AXDB_INVALID_PARAM
            | codes::ERR_EVENT_INVALID => 400,
            codes::ERR_UNAUTHORIZED | codes::ERR_API_EXPIRED_SESSION => 401,
            codes::ERR_FORBIDDEN => 403,
            codes::ERR_NOT_FOUND | codes::ERR_CACHE_NOT_FOUND | codes::ERR_AXDB_TABLE_NOT_FOUND => 404,
            codes::ERR_CONFLICT | codes::ERR_API_DUP_LABEL | codes::ERR_AXDB_CONDITIONAL_UPDATE_FAILURE => 409,
            codes::ERR_NOT_IMPLEMENTED => 501,
            codes::ERR_TIMEOUT => 504,
            _ => 500,
        }
    }

    /// True for the 4xx class.
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.http_status())
    }
}

impl PartialEq for AxError {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code && self.message == other.message && self.detail == other.detail
    }
}

impl Eq for AxError {}

impl fmt::Debug for AxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AxError")
            .field("code", &self.code)
            .field("message", &self.message)
            .field("detail", &self.detail)
            .field("cause", &self.cause.as_ref().map(|c| c.to_string()))
            .finish()
    }
}

impl fmt::Display for AxError {
    /// `{}` prints `code: message`; `{:#}` adds the detail, the cause chain and the backtrace.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;
        if !f.alternate() {
            return Ok(());
        }
        if let Some(detail) = &self.detail {
            write!(f, " ({})", detail)?;
        }
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            write!(f, "\n  caused by: {}", cause)?;
            source = cause.source();
        }
        if let Some(bt) = &self.backtrace {
            write!(f, "\n{}", bt)?;
        }
        Ok(())
    }
}

impl std::error::Error for AxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|c| c.as_ref() as &(dyn std::error::Error + 'static))
    }
}

#[derive(Serialize, Deserialize)]
struct WireError {
    code: String,
    message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

impl Serialize for AxError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        WireError {
            code: self.code.clone(),
            message: self.message.clone(),
            detail: self.detail.clone(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for AxError {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = WireError::deserialize(deserializer)?;
        let mut err = AxError::new(wire.code, wire.message);
        err.detail = wire.detail;
        Ok(err)
    }
}

impl From<serde_json::Error> for AxError {
    fn from(e: serde_json::Error) -> Self {
        AxError::from_cause(e, codes::ERR_INTERNAL, "JSON encoding failed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_none_is_none() {
        let wrapped = AxError::wrap::<std::io::Error>(None, codes::ERR_INTERNAL, "nothing");
        assert!(wrapped.is_none());
    }

    #[test]
    fn test_wrap_keeps_cause_and_backtrace() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err = AxError::wrap(Some(io), codes::ERR_INTERNAL, "write failed").unwrap();
        assert!(err.is_code(codes::ERR_INTERNAL));
        assert_eq!(err.root_cause().to_string(), "disk gone");
        assert!(err.backtrace().is_some());
    }

    #[test]
    fn test_root_cause_walks_nested_wraps() {
        let inner = AxError::new(codes::ERR_AX_HTTP_CONNECTION, "refused");
        let middle = AxError::from_cause(inner, codes::ERR_AXDB_INTERNAL, "query failed");
        let outer = AxError::from_cause(middle, codes::ERR_INTERNAL, "list failed");
        assert_eq!(outer.root_cause().to_string(), "ERR_AX_HTTP_CONNECTION: refused");
    }

    #[test]
    fn test_unwrapped_error_is_its_own_root() {
        let err = AxError::not_found("missing");
        assert_eq!(err.root_cause().to_string(), err.to_string());
    }

    #[test]
    fn test_json_codec_round_trip() {
        let err = AxError::new(codes::ERR_API_DUP_LABEL, "label exists").with_detail("key=env");
        let encoded = serde_json::to_string(&err).unwrap();
        let decoded: AxError = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, err);

        let bare = AxError::internal("boom");
        let encoded = serde_json::to_value(&bare).unwrap();
        assert!(encoded.get("detail").is_none());
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(AxError::invalid_param("x").http_status(), 400);
        assert_eq!(AxError::not_found("x").http_status(), 404);
        assert_eq!(AxError::unauthorized("x").http_status(), 401);
        assert_eq!(AxError::new(codes::ERR_FORBIDDEN, "x").http_status(), 403);
        assert_eq!(AxError::new(codes::ERR_API_DUP_LABEL, "x").http_status(), 409);
        assert_eq!(AxError::timeout("x").http_status(), 504);
        assert_eq!(AxError::connection("x").http_status(), 500);
        assert!(AxError::invalid_param("x").is_client_error());
        assert!(!AxError::internal("x").is_client_error());
    }

    #[test]
    fn test_alternate_format_prints_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "socket closed");
        let err = AxError::from_cause(io, codes::ERR_AX_HTTP_CONNECTION, "send failed");
        assert_eq!(format!("{}", err), "ERR_AX_HTTP_CONNECTION: send failed");
        assert!(format!("{:#}", err).contains("caused by: socket closed"));
    }
}
