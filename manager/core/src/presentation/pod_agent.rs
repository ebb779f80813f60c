// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Pod Agent HTTP Surface
//!
//! Authenticated proxy over the pod subresource of one cluster:
//!
//! | Route | Method | Upstream |
//! |-------|--------|----------|
//! | `/api/v1/namespaces/{ns}/pods` | GET | list, or watch with `watch=true` |
//! | `/api/v1/namespaces/{ns}/pods` | DELETE | delete collection |
//! | `/api/v1/namespaces/{ns}/pods` | POST | create |
//! | `/api/v1/namespaces/{ns}/pods/{name}` | GET, PUT, PATCH, DELETE | single pod |
//! | `/health` | GET | none, unauthenticated |
//!
//! Callers present `Authorization: Bearer <base64(token)>`. Watch responses
//! are one JSON event per `\r\n`-terminated line; an upstream failure ends the
//! stream with a `Status` event.
//!
//! # Architecture
//!
//! - **Layer:** Presentation Layer
//! - **Purpose:** REST adapter over [`PodApi`]

use crate::domain::error::{codes, AxError, AxResult};
use crate::infrastructure::pod_proxy::{PatchStrategy, PodApi, PodResponse, Query as PodQuery, WatchStream};
use crate::presentation::error::{ApiError, ApiResult};
use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, Request, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::StreamExt;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::debug;

pub const POD_AGENT_PORT: u16 = 24368;

pub struct PodAgentState {
    api: Arc<dyn PodApi>,
    /// Full expected `Authorization` header value.
    authorization: String,
}

impl PodAgentState {
    pub fn new(api: Arc<dyn PodApi>, token: &str) -> Self {
        Self {
            api,
            authorization: format!("Bearer {}", STANDARD.encode(token)),
        }
    }
}

pub fn router(state: Arc<PodAgentState>) -> Router {
    let pods = Router::new()
        .route(
            "/api/v1/namespaces/{namespace}/pods",
            get(list_pods).delete(delete_pods).post(create_pod),
        )
        .route(
            "/api/v1/namespaces/{namespace}/pods/{name}",
            get(get_pod).put(update_pod).patch(patch_pod).delete(delete_pod),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), authorize));

    Router::new()
        .route("/health", get(health))
        .merge(pods)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn authorize(State(state): State<Arc<PodAgentState>>, request: Request, next: Next) -> Response {
    let presented = request.headers().get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    if presented != Some(state.authorization.as_str()) {
        return ApiError(AxError::unauthorized("Invalid or missing access token")).into_response();
    }
    next.run(request).await
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

fn relay(response: PodResponse) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    (status, Json(response.body)).into_response()
}

fn parse_json(body: &Bytes) -> AxResult<Value> {
    serde_json::from_slice(body)
        .map_err(|e| AxError::from_cause(e, codes::ERR_API_INVALID_PARAM, "Request body is not valid JSON"))
}

fn is_watch(query: &PodQuery) -> bool {
    query.iter().any(|(k, v)| k == "watch" && (v == "true" || v == "1"))
}

/// Stamp `kind`/`apiVersion` on the event object.
fn annotate(event: &mut Value) {
    let kind = if event.get("type").and_then(Value::as_str) == Some("ERROR") {
        "Status"
    } else {
        "Pod"
    };
    if let Some(object) = event.get_mut("object").and_then(Value::as_object_mut) {
        object.insert("kind".to_string(), Value::from(kind));
        object.insert("apiVersion".to_string(), Value::from("v1"));
    }
}

fn line(event: &Value) -> Bytes {
    let mut out = serde_json::to_vec(event).unwrap_or_default();
    out.extend_from_slice(b"\r\n");
    Bytes::from(out)
}

fn failure_event(err: &AxError) -> Value {
    json!({
        "type": "ERROR",
        "object": {
            "kind": "Status",
            "apiVersion": "v1",
            "status": "Failure",
            "message": err.message(),
            "code": err.http_status(),
        }
    })
}

fn watch_body(events: WatchStream) -> Body {
    let lines = events.scan(false, |failed, event| {
        let out = if *failed {
            None
        } else {
            match event {
                Ok(mut event) => {
                    annotate(&mut event);
                    Some(line(&event))
                }
                Err(e) => {
                    debug!("Pod watch failed: {}", e);
                    *failed = true;
                    Some(line(&failure_event(&e)))
                }
            }
        };
        futures::future::ready(out)
    });
    Body::from_stream(lines.map(Ok::<_, Infallible>))
}

async fn list_pods(
    State(state): State<Arc<PodAgentState>>,
    Path(namespace): Path<String>,
    Query(query): Query<PodQuery>,
) -> ApiResult<Response> {
    if !is_watch(&query) {
        return Ok(relay(state.api.list(&namespace, &query).await?));
    }
    let events = state.api.watch(&namespace, &query).await?;
    Ok(([(CONTENT_TYPE, "application/json")], watch_body(events)).into_response())
}

async fn delete_pods(
    State(state): State<Arc<PodAgentState>>,
    Path(namespace): Path<String>,
    Query(query): Query<PodQuery>,
) -> ApiResult<Response> {
    Ok(relay(state.api.delete_collection(&namespace, &query).await?))
}

async fn create_pod(
    State(state): State<Arc<PodAgentState>>,
    Path(namespace): Path<String>,
    body: Bytes,
) -> ApiResult<Response> {
    let pod = parse_json(&body)?;
    Ok(relay(state.api.create(&namespace, &pod).await?))
}

async fn get_pod(
    State(state): State<Arc<PodAgentState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> ApiResult<Response> {
    Ok(relay(state.api.get(&namespace, &name).await?))
}

async fn update_pod(
    State(state): State<Arc<PodAgentState>>,
    Path((namespace, name)): Path<(String, String)>,
    body: Bytes,
) -> ApiResult<Response> {
    let pod = parse_json(&body)?;
    Ok(relay(state.api.update(&namespace, &name, &pod).await?))
}

async fn patch_pod(
    State(state): State<Arc<PodAgentState>>,
    Path((namespace, name)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let content_type = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()).unwrap_or_default();
    let strategy = PatchStrategy::from_content_type(content_type)
        .ok_or_else(|| AxError::bad_request(format!("Unsupported patch content type: {}", content_type)))?;
    let patch = parse_json(&body)?;
    Ok(relay(state.api.patch(&namespace, &name, strategy, &patch).await?))
}

async fn delete_pod(
    State(state): State<Arc<PodAgentState>>,
    Path((namespace, name)): Path<(String, String)>,
    body: Bytes,
) -> ApiResult<Response> {
    let options = if body.is_empty() { None } else { Some(parse_json(&body)?) };
    Ok(relay(state.api.delete(&namespace, &name, options.as_ref()).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::http::Method;
    use http_body_util::BodyExt;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakePods {
        closed: Arc<AtomicUsize>,
        fail_watch: bool,
        patched: Mutex<Option<PatchStrategy>>,
    }

    #[async_trait]
    impl PodApi for FakePods {
        async fn list(&self, namespace: &str, _query: &PodQuery) -> AxResult<PodResponse> {
            Ok(PodResponse::ok(json!({"kind": "PodList", "namespace": namespace, "items": []})))
        }

        async fn watch(&self, _namespace: &str, _query: &PodQuery) -> AxResult<WatchStream> {
            let guard = DropCounter(self.closed.clone());
            let mut events = vec![Ok(json!({"type": "ADDED", "object": {"metadata": {"name": "web"}}}))];
            if self.fail_watch {
                events.push(Err(AxError::connection("apiserver went away")));
                events.push(Ok(json!({"type": "DELETED", "object": {}})));
            }
            let stream = futures::stream::iter(events).map(move |e| {
                let _ = &guard;
                e
            });
            if self.fail_watch {
                Ok(stream.boxed())
            } else {
                Ok(stream.chain(futures::stream::pending()).boxed())
            }
        }

        async fn delete_collection(&self, _namespace: &str, _query: &PodQuery) -> AxResult<PodResponse> {
            Ok(PodResponse::ok(json!({"kind": "PodList", "items": []})))
        }

        async fn create(&self, _namespace: &str, pod: &Value) -> AxResult<PodResponse> {
            Ok(PodResponse {
                status: 201,
                body: pod.clone(),
            })
        }

        async fn get(&self, _namespace: &str, name: &str) -> AxResult<PodResponse> {
            Ok(PodResponse {
                status: 404,
                body: json!({"kind": "Status", "reason": "NotFound", "details": {"name": name}}),
            })
        }

        async fn update(&self, _namespace: &str, _name: &str, pod: &Value) -> AxResult<PodResponse> {
            Ok(PodResponse::ok(pod.clone()))
        }

        async fn patch(
            &self,
            _namespace: &str,
            _name: &str,
            strategy: PatchStrategy,
            _patch: &Value,
        ) -> AxResult<PodResponse> {
            *self.patched.lock() = Some(strategy);
            Ok(PodResponse::ok(json!({"kind": "Pod"})))
        }

        async fn delete(&self, _namespace: &str, _name: &str, _options: Option<&Value>) -> AxResult<PodResponse> {
            Ok(PodResponse::ok(json!({"kind": "Status", "status": "Success"})))
        }
    }

    const TOKEN: &str = "s3cret";

    fn app(pods: Arc<FakePods>) -> Router {
        router(Arc::new(PodAgentState::new(pods, TOKEN)))
    }

    fn request(method: Method, uri: &str, authorized: bool) -> axum::http::request::Builder {
        let builder = axum::http::Request::builder().method(method).uri(uri);
        if authorized {
            builder.header(AUTHORIZATION, format!("Bearer {}", STANDARD.encode(TOKEN)))
        } else {
            builder
        }
    }

    async fn json_body(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_token_is_required() {
        let app = app(Arc::new(FakePods::default()));
        let uri = "/api/v1/namespaces/default/pods";

        let response = app
            .clone()
            .oneshot(request(Method::GET, uri, false).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["code"], codes::ERR_UNAUTHORIZED);

        let wrong = request(Method::GET, uri, false)
            .header(AUTHORIZATION, format!("Bearer {}", TOKEN))
            .body(Body::empty())
            .unwrap();
        assert_eq!(app.clone().oneshot(wrong).await.unwrap().status(), StatusCode::UNAUTHORIZED);

        let response = app
            .clone()
            .oneshot(request(Method::GET, uri, true).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["kind"], "PodList");

        let health = request(Method::GET, "/health", false).body(Body::empty()).unwrap();
        assert_eq!(app.oneshot(health).await.unwrap().status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_upstream_status_is_relayed() {
        let app = app(Arc::new(FakePods::default()));
        let response = app
            .clone()
            .oneshot(
                request(Method::GET, "/api/v1/namespaces/default/pods/missing", true)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["reason"], "NotFound");

        let response = app
            .oneshot(
                request(Method::POST, "/api/v1/namespaces/default/pods", true)
                    .body(Body::from(r#"{"metadata":{"name":"web"}}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn test_patch_strategy_follows_content_type() {
        let pods = Arc::new(FakePods::default());
        let app = app(pods.clone());
        let uri = "/api/v1/namespaces/default/pods/web";

        let response = app
            .clone()
            .oneshot(
                request(Method::PATCH, uri, true)
                    .header(CONTENT_TYPE, "application/strategic-merge-patch+json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(*pods.patched.lock(), Some(PatchStrategy::StrategicMerge));

        let response = app
            .oneshot(
                request(Method::PATCH, uri, true)
                    .header(CONTENT_TYPE, "text/plain")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_watch_streams_lines_and_closes_upstream_once() {
        let pods = Arc::new(FakePods::default());
        let app = app(pods.clone());
        let response = app
            .oneshot(
                request(Method::GET, "/api/v1/namespaces/default/pods?watch=true", true)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");

        let mut body = response.into_body();
        let frame = body.frame().await.unwrap().unwrap().into_data().unwrap();
        assert!(frame.ends_with(b"\r\n"));
        let event: Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(event["object"]["kind"], "Pod");
        assert_eq!(event["object"]["apiVersion"], "v1");
        assert_eq!(pods.closed.load(Ordering::SeqCst), 0);

        // client goes away
        drop(body);
        assert_eq!(pods.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_watch_failure_ends_with_status() {
        let pods = Arc::new(FakePods {
            fail_watch: true,
            ..Default::default()
        });
        let response = app(pods)
            .oneshot(
                request(Method::GET, "/api/v1/namespaces/default/pods?watch=true", true)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        let lines: Vec<Value> = text
            .split("\r\n")
            .filter(|l| !l.is_empty())
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["type"], "ERROR");
        assert_eq!(lines[1]["object"]["kind"], "Status");
    }
}
