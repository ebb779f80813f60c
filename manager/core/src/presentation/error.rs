// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! HTTP rendering of [`AxError`].

use crate::domain::error::AxError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::{error, warn};

/// Handler error: `{code, message, detail?}` with the status derived from
/// the code.
#[derive(Debug)]
pub struct ApiError(pub AxError);

impl From<AxError> for ApiError {
    fn from(err: AxError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!("Request failed: {:#}", self.0);
        } else {
            warn!("Request rejected: {}", self.0);
        }
        (status, Json(self.0)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::codes;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn test_error_body_and_status() {
        let response = ApiError(AxError::new(codes::ERR_API_DUP_LABEL, "dup")).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value, serde_json::json!({"code": "ERR_API_DUP_LABEL", "message": "dup"}));
    }
}
