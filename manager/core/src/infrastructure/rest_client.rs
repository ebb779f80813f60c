// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # JSON REST Client
//!
//! Shared transport for the AXDB, admission and AM side-car clients.
//!
//! - 2xx responses are decoded as JSON (an empty body decodes as `null`);
//! - other statuses are decoded as a `{code, message, detail}` error body,
//!   falling back to a synthesised error chosen by status class;
//! - transport failures become `ERR_AX_HTTP_CONNECTION` (always retriable),
//!   client-side timeouts become `ERR_TIMEOUT`.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure Layer
//! - **Purpose:** Anti-corruption boundary between reqwest and [`AxError`]

use crate::domain::error::{codes, AxError, AxResult};
use crate::infrastructure::retry::{retry, RetryConfig};
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

#[derive(Clone)]
pub struct RestClient {
    http: Client,
    base_url: String,
    server_error_code: &'static str,
    client_error_code: &'static str,
    not_found_code: &'static str,
}

impl RestClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> AxResult<Self> {
        let base_url = base_url.into();
        Url::parse(&base_url).map_err(|e| {
            AxError::from_cause(e, codes::ERR_API_INVALID_PARAM, format!("Invalid base URL {}", base_url))
        })?;
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AxError::from_cause(e, codes::ERR_INTERNAL, "failed to create HTTP client"))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            server_error_code: codes::ERR_INTERNAL,
            client_error_code: codes::ERR_BAD_REQUEST,
            not_found_code: codes::ERR_NOT_FOUND,
        })
    }

    /// Codes used when a failed response carries no decodable error body.
    pub fn with_error_codes(mut self, server: &'static str, client: &'static str) -> Self {
        self.server_error_code = server;
        self.client_error_code = client;
        self.not_found_code = client;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url(&self, path: &str) -> String {
        if path.is_empty() {
            self.base_url.clone()
        } else if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    pub async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Option<&Value>,
    ) -> AxResult<Value> {
        let url = self.url(path);
        debug!("{} {}", method, url);

        let mut request = self.http.request(method.clone(), &url);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| transport_error(e, &method, &url))?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| transport_error(e, &method, &url))?;

        if status.is_success() {
            if bytes.is_empty() {
                return Ok(Value::Null);
            }
            return serde_json::from_slice(&bytes).or_else(|_| {
                // Some collaborators answer with a bare string such as "pong".
                Ok(Value::String(String::from_utf8_lossy(&bytes).into_owned()))
            });
        }

        Err(self.decode_error(status, &bytes, &method, &url))
    }

    pub async fn send_with_retry(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Option<&Value>,
        config: Option<&RetryConfig>,
    ) -> AxResult<Value> {
        retry(config, || self.send(method.clone(), path, query, body)).await
    }

    fn decode_error(&self, status: StatusCode, bytes: &[u8], method: &Method, url: &str) -> AxError {
        if let Ok(err) = serde_json::from_slice::<AxError>(bytes) {
            return err;
        }
        let code = if status.is_server_error() {
            self.server_error_code
        } else if status == StatusCode::NOT_FOUND {
            self.not_found_code
        } else {
            self.client_error_code
        };
        AxError::new(code, format!("{} {} returned {}", method, url, status))
            .with_detail(String::from_utf8_lossy(bytes).into_owned())
    }
}

fn transport_error(e: reqwest::Error, method: &Method, url: &str) -> AxError {
    if e.is_timeout() {
        AxError::from_cause(e, codes::ERR_TIMEOUT, format!("{} {} timed out", method, url))
    } else {
        AxError::from_cause(
            e,
            codes::ERR_AX_HTTP_CONNECTION,
            format!("{} {} failed to connect", method, url),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_success_decodes_json() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/ping")
            .with_status(200)
            .with_body("\"pong\"")
            .create_async()
            .await;

        let client = RestClient::new(format!("{}/v1", server.url()), Duration::from_secs(5)).unwrap();
        let value = client.send(Method::GET, "ping", &[], None).await.unwrap();
        assert_eq!(value, json!("pong"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_error_body_is_surfaced() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("PUT", "/adc/resource")
            .with_status(400)
            .with_body(r#"{"code":"ERR_API_INVALID_PARAM","message":"not enough cpu"}"#)
            .create_async()
            .await;

        let client = RestClient::new(server.url(), Duration::from_secs(5)).unwrap();
        let err = client
            .send(Method::PUT, "/adc/resource", &[], Some(&json!({})))
            .await
            .unwrap_err();
        assert!(err.is_code(codes::ERR_API_INVALID_PARAM));
        assert_eq!(err.message(), "not enough cpu");
    }

    #[tokio::test]
    async fn test_unparseable_error_uses_status_class() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/a")
            .with_status(503)
            .with_body("upstream down")
            .create_async()
            .await;
        server
            .mock("GET", "/b")
            .with_status(422)
            .with_body("<html/>")
            .create_async()
            .await;

        let client = RestClient::new(server.url(), Duration::from_secs(5))
            .unwrap()
            .with_error_codes(codes::ERR_AXDB_INTERNAL, codes::ERR_AXDB_INVALID_PARAM);
        let err = client.send(Method::GET, "/a", &[], None).await.unwrap_err();
        assert!(err.is_code(codes::ERR_AXDB_INTERNAL));
        assert_eq!(err.detail(), Some("upstream down"));
        let err = client.send(Method::GET, "/b", &[], None).await.unwrap_err();
        assert!(err.is_code(codes::ERR_AXDB_INVALID_PARAM));
    }

    #[test]
    fn test_invalid_base_url_is_rejected() {
        let err = RestClient::new("axdb:8083 v1", Duration::from_secs(1)).err().unwrap();
        assert!(err.is_code(codes::ERR_API_INVALID_PARAM));
    }

    #[tokio::test]
    async fn test_connection_refused_maps_to_connection_code() {
        let client = RestClient::new("http://127.0.0.1:1", Duration::from_secs(2)).unwrap();
        let err = client.send(Method::GET, "/", &[], None).await.unwrap_err();
        assert!(err.is_code(codes::ERR_AX_HTTP_CONNECTION));
    }
}
