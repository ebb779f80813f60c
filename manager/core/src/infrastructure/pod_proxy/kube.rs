// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Kubernetes apiserver client for the pod subresource.

use super::{PatchStrategy, PodApi, PodResponse, Query, WatchStream};
use crate::domain::error::{codes, AxError, AxResult};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Certificate, Client, Method, RequestBuilder};
use serde_json::Value;
use std::path::Path;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, info};

pub const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub struct KubeApiClient {
    http: Client,
    /// No overall timeout; watches stay open until either side closes.
    streaming: Client,
    base_url: String,
    token: String,
}

impl KubeApiClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>, ca_pem: Option<&[u8]>) -> AxResult<Self> {
        let build = |timeout: Option<Duration>| -> AxResult<Client> {
            let mut builder = Client::builder();
            if let Some(t) = timeout {
                builder = builder.timeout(t);
            }
            if let Some(pem) = ca_pem {
                let ca = Certificate::from_pem(pem)
                    .map_err(|e| AxError::from_cause(e, codes::ERR_INTERNAL, "Invalid apiserver CA certificate"))?;
                builder = builder.add_root_certificate(ca);
            }
            builder
                .build()
                .map_err(|e| AxError::from_cause(e, codes::ERR_INTERNAL, "failed to create HTTP client"))
        };
        Ok(Self {
            http: build(Some(REQUEST_TIMEOUT))?,
            streaming: build(None)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    /// Client for the apiserver of the cluster this process runs in.
    pub fn in_cluster() -> AxResult<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|_| AxError::internal("KUBERNETES_SERVICE_HOST is not set"))?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());
        let dir = Path::new(SERVICE_ACCOUNT_DIR);
        let read = |file: &str| {
            std::fs::read(dir.join(file)).map_err(|e| {
                AxError::from_cause(e, codes::ERR_INTERNAL, format!("Failed to read service account {}", file))
            })
        };
        let token = String::from_utf8_lossy(&read("token")?).trim().to_string();
        let ca = read("ca.crt")?;
        info!("Using in-cluster apiserver at {}:{}", host, port);
        Self::new(format!("https://{}:{}", host, port), token, Some(&ca))
    }

    fn pods_path(namespace: &str, name: Option<&str>) -> String {
        match name {
            Some(n) => format!("/api/v1/namespaces/{}/pods/{}", namespace, n),
            None => format!("/api/v1/namespaces/{}/pods", namespace),
        }
    }

    fn request(&self, client: &Client, method: Method, path: &str) -> RequestBuilder {
        client
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
    }

    async fn execute(&self, builder: RequestBuilder) -> AxResult<PodResponse> {
        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status().as_u16();
        let text = response.text().await.map_err(transport_error)?;
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text)?
        };
        debug!("apiserver replied {}", status);
        Ok(PodResponse { status, body })
    }

    /// Value under `key` of secret `name`, base64-decoded.
    pub async fn read_secret(&self, namespace: &str, name: &str, key: &str) -> AxResult<String> {
        let path = format!("/api/v1/namespaces/{}/secrets/{}", namespace, name);
        let response = self.execute(self.request(&self.http, Method::GET, &path)).await?;
        if response.status != 200 {
            return Err(AxError::not_found(format!(
                "Failed to read secret {}/{} ({})",
                namespace, name, response.status
            )));
        }
        let encoded = response
            .body
            .pointer(&format!("/data/{}", key))
            .and_then(Value::as_str)
            .ok_or_else(|| AxError::not_found(format!("Secret {}/{} has no key {}", namespace, name, key)))?;
        let raw = STANDARD
            .decode(encoded)
            .map_err(|e| AxError::from_cause(e, codes::ERR_INTERNAL, "Secret value is not base64"))?;
        Ok(String::from_utf8_lossy(&raw).trim().to_string())
    }
}

fn transport_error(e: reqwest::Error) -> AxError {
    if e.is_timeout() {
        AxError::from_cause(e, codes::ERR_TIMEOUT, "apiserver request timed out")
    } else {
        AxError::from_cause(e, codes::ERR_AX_HTTP_CONNECTION, "apiserver is unreachable")
    }
}

/// Logs when the upstream watch is released.
struct WatchGuard {
    namespace: String,
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        info!("Closed pod watch on {}", self.namespace);
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

/// Split a newline-delimited JSON body into decoded events.
fn watch_events(body: ByteStream, guard: WatchGuard) -> WatchStream {
    futures::stream::unfold(
        (body, BytesMut::new(), false, guard),
        |(mut body, mut buf, mut done, guard)| async move {
            loop {
                if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line = buf.split_to(pos + 1);
                    let line = line.trim_ascii();
                    if line.is_empty() {
                        continue;
                    }
                    let event = serde_json::from_slice::<Value>(line).map_err(AxError::from);
                    return Some((event, (body, buf, done, guard)));
                }
                if done {
                    if buf.trim_ascii().is_empty() {
                        return None;
                    }
                    let rest = buf.split();
                    let event = serde_json::from_slice::<Value>(rest.trim_ascii()).map_err(AxError::from);
                    return Some((event, (body, buf, done, guard)));
                }
                match body.next().await {
                    Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                    Some(Err(e)) => {
                        buf.clear();
                        return Some((Err(transport_error(e)), (body, buf, true, guard)));
                    }
                    None => done = true,
                }
            }
        },
    )
    .boxed()
}

#[async_trait]
impl PodApi for KubeApiClient {
    async fn list(&self, namespace: &str, query: &Query) -> AxResult<PodResponse> {
        let path = Self::pods_path(namespace, None);
        self.execute(self.request(&self.http, Method::GET, &path).query(query)).await
    }

    async fn watch(&self, namespace: &str, query: &Query) -> AxResult<WatchStream> {
        let path = Self::pods_path(namespace, None);
        let mut query: Query = query.iter().filter(|(k, _)| k != "watch").cloned().collect();
        query.push(("watch".to_string(), "true".to_string()));
        let response = self
            .request(&self.streaming, Method::GET, &path)
            .query(&query)
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AxError::new(
                codes::ERR_BAD_REQUEST,
                format!("apiserver refused the watch ({})", status.as_u16()),
            )
            .with_detail(text));
        }
        info!("Opened pod watch on {}", namespace);
        let guard = WatchGuard {
            namespace: namespace.to_string(),
        };
        Ok(watch_events(Box::pin(response.bytes_stream()), guard))
    }

    async fn delete_collection(&self, namespace: &str, query: &Query) -> AxResult<PodResponse> {
        let path = Self::pods_path(namespace, None);
        self.execute(self.request(&self.http, Method::DELETE, &path).query(query)).await
    }

    async fn create(&self, namespace: &str, pod: &Value) -> AxResult<PodResponse> {
        let path = Self::pods_path(namespace, None);
        self.execute(self.request(&self.http, Method::POST, &path).json(pod)).await
    }

    async fn get(&self, namespace: &str, name: &str) -> AxResult<PodResponse> {
        let path = Self::pods_path(namespace, Some(name));
        self.execute(self.request(&self.http, Method::GET, &path)).await
    }

    async fn update(&self, namespace: &str, name: &str, pod: &Value) -> AxResult<PodResponse> {
        let path = Self::pods_path(namespace, Some(name));
        self.execute(self.request(&self.http, Method::PUT, &path).json(pod)).await
    }

    async fn patch(
        &self,
        namespace: &str,
        name: &str,
        strategy: PatchStrategy,
        patch: &Value,
    ) -> AxResult<PodResponse> {
        let path = Self::pods_path(namespace, Some(name));
        let body = serde_json::to_vec(patch)?;
        let builder = self
            .request(&self.http, Method::PATCH, &path)
            .header(CONTENT_TYPE, strategy.content_type())
            .body(body);
        self.execute(builder).await
    }

    async fn delete(&self, namespace: &str, name: &str, options: Option<&Value>) -> AxResult<PodResponse> {
        let path = Self::pods_path(namespace, Some(name));
        let mut builder = self.request(&self.http, Method::DELETE, &path);
        if let Some(options) = options {
            builder = builder.json(options);
        }
        self.execute(builder).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    #[tokio::test]
    async fn test_failure_status_is_passed_through() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("GET", "/api/v1/namespaces/default/pods/missing")
            .match_header("authorization", "Bearer t0ken")
            .with_status(404)
            .with_body(r#"{"kind":"Status","code":404,"reason":"NotFound"}"#)
            .create_async()
            .await;

        let client = KubeApiClient::new(server.url(), "t0ken", None).unwrap();
        let response = client.get("default", "missing").await.unwrap();
        assert_eq!(response.status, 404);
        assert_eq!(response.body["reason"], "NotFound");
        m.assert_async().await;
    }

    #[tokio::test]
    async fn test_patch_uses_strategy_content_type() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("PATCH", "/api/v1/namespaces/default/pods/web")
            .match_header("content-type", "application/merge-patch+json")
            .match_body(Matcher::Json(json!({"metadata": {"labels": {"a": "b"}}})))
            .with_body(r#"{"kind":"Pod"}"#)
            .create_async()
            .await;

        let client = KubeApiClient::new(server.url(), "t", None).unwrap();
        let response = client
            .patch("default", "web", PatchStrategy::Merge, &json!({"metadata": {"labels": {"a": "b"}}}))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        m.assert_async().await;
    }

    #[tokio::test]
    async fn test_watch_splits_lines() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v1/namespaces/default/pods")
            .match_query(Matcher::UrlEncoded("watch".into(), "true".into()))
            .with_body("{\"type\":\"ADDED\",\"object\":{}}\n\n{\"type\":\"DELETED\",\"object\":{}}")
            .create_async()
            .await;

        let client = KubeApiClient::new(server.url(), "t", None).unwrap();
        let query = vec![("watch".to_string(), "true".to_string())];
        let events: Vec<Value> = client
            .watch("default", &query)
            .await
            .unwrap()
            .map(|e| e.unwrap())
            .collect()
            .await;
        let types: Vec<_> = events.iter().map(|e| e["type"].as_str().unwrap()).collect();
        assert_eq!(types, ["ADDED", "DELETED"]);
    }

    #[tokio::test]
    async fn test_read_secret_decodes_value() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v1/namespaces/axsys/secrets/pod-agent")
            .with_body(json!({"data": {"token": STANDARD.encode("s3cret\n")}}).to_string())
            .create_async()
            .await;

        let client = KubeApiClient::new(server.url(), "t", None).unwrap();
        assert_eq!(client.read_secret("axsys", "pod-agent", "token").await.unwrap(), "s3cret");
        assert!(client.read_secret("axsys", "pod-agent", "other").await.is_err());
    }
}
