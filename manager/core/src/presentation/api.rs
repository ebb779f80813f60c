// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Manager HTTP API
//!
//! `/v1` surface of the deployment manager. Read endpoints honour
//! `If-None-Match` against the combined deployment/application validator and
//! answer `304 Not Modified` while nothing has changed. Every response body,
//! including errors, is JSON.
//!
//! # Architecture
//!
//! - **Layer:** Presentation Layer
//! - **Purpose:** REST adapter over [`DeploymentService`]

use crate::application::deployment_service::{DeploymentService, DeploymentUpdate};
use crate::domain::deployment::{Deployment, DeploymentSpec, DeploymentStatus, ScaleRequest};
use crate::domain::error::{codes, AxError, AxResult};
use crate::domain::repository::DeploymentQuery;
use crate::infrastructure::etag::EtagRotator;
use crate::infrastructure::heartbeat_registry::Heartbeat;
use crate::infrastructure::secrets::SecretKeyStore;
use crate::presentation::error::ApiResult;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::header::{ETAG, IF_NONE_MATCH};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub struct ApiState {
    pub deployments: Arc<dyn DeploymentService>,
    pub etag: Arc<EtagRotator>,
    pub secrets: Arc<SecretKeyStore>,
}

pub fn router(state: Arc<ApiState>) -> Router {
    let v1 = Router::new()
        .route("/ping", get(ping))
        .route("/deployments", get(list_deployments).post(create_deployment))
        .route(
            "/deployments/{id}",
            get(get_deployment).put(update_deployment).delete(delete_deployment),
        )
        .route("/deployments/{id}/start", post(start_deployment))
        .route("/deployments/{id}/stop", post(stop_deployment))
        .route("/deployments/{id}/scale", post(scale_deployment))
        .route("/heartbeats", post(post_heartbeat))
        .route("/secret/encrypt", post(encrypt_secret))
        .route("/secret/decrypt", post(decrypt_secret))
        .route("/secret/key", get(get_secret_key).put(rotate_secret_key));

    Router::new()
        .nest("/v1", v1)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct DeploymentsData {
    data: Vec<Deployment>,
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> AxResult<T> {
    serde_json::from_slice(body)
        .map_err(|e| AxError::from_cause(e, codes::ERR_API_INVALID_PARAM, "Request body is not valid"))
}

fn parse_param<T: FromStr>(params: &BTreeMap<String, String>, key: &str) -> AxResult<Option<T>> {
    match params.get(key).filter(|v| !v.is_empty()) {
        Some(v) => v
            .parse()
            .map(Some)
            .map_err(|_| AxError::invalid_param(format!("Invalid value for {}: {}", key, v))),
        None => Ok(None),
    }
}

fn list_query(params: &BTreeMap<String, String>) -> AxResult<DeploymentQuery> {
    let text = |key: &str| params.get(key).filter(|v| !v.is_empty()).cloned();
    let statuses = match params.get("status") {
        Some(list) => list
            .split(',')
            .filter(|s| !s.is_empty())
            .map(DeploymentStatus::from_str)
            .collect::<AxResult<Vec<_>>>()?,
        None => Vec::new(),
    };
    Ok(DeploymentQuery {
        application_name: text("application_name"),
        name: text("name"),
        statuses,
        search: text("search"),
        sort: text("sort"),
        limit: parse_param(params, "limit")?,
        offset: parse_param(params, "offset")?,
        min_time: parse_param(params, "min_time")?,
        max_time: parse_param(params, "max_time")?,
    })
}

/// True when the client's cached copy is still current.
fn not_modified(headers: &HeaderMap, etag: &str) -> bool {
    headers
        .get(IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().trim_matches('"') == etag)
}

fn with_etag<T: Serialize>(etag: String, body: T) -> Response {
    ([(ETAG, etag)], Json(body)).into_response()
}

async fn ping() -> Json<&'static str> {
    Json("pong")
}

async fn list_deployments(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Query(params): Query<BTreeMap<String, String>>,
) -> ApiResult<Response> {
    let etag = state.etag.combined();
    if not_modified(&headers, &etag) {
        return Ok(StatusCode::NOT_MODIFIED.into_response());
    }
    let query = list_query(&params)?;
    let data = state.deployments.list_deployments(&query).await?;
    Ok(with_etag(etag, DeploymentsData { data }))
}

async fn get_deployment(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let etag = state.etag.combined();
    if not_modified(&headers, &etag) {
        return Ok(StatusCode::NOT_MODIFIED.into_response());
    }
    let deployment = state.deployments.get_deployment(&id).await?;
    Ok(with_etag(etag, deployment))
}

/// Repeating a spec before the row has moved on returns the same row, still 201.
async fn create_deployment(State(state): State<Arc<ApiState>>, body: Bytes) -> ApiResult<(StatusCode, Json<Deployment>)> {
    let spec: DeploymentSpec = parse_body(&body)?;
    Ok((StatusCode::CREATED, Json(state.deployments.create_deployment(spec).await?)))
}

/// Metadata only. Template changes go through `POST /deployments`.
async fn update_deployment(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<Deployment>> {
    let update: DeploymentUpdate = parse_body(&body)?;
    Ok(Json(state.deployments.update_object(&id, update).await?))
}

async fn delete_deployment(State(state): State<Arc<ApiState>>, Path(id): Path<String>) -> ApiResult<Response> {
    match state.deployments.delete_deployment(&id).await {
        Ok(d) => Ok(Json(d).into_response()),
        // deleting an unknown deployment is a no-op
        Err(e) if e.is_code(codes::ERR_NOT_FOUND) => Ok(Json(json!({})).into_response()),
        Err(e) => Err(e.into()),
    }
}

async fn start_deployment(State(state): State<Arc<ApiState>>, Path(id): Path<String>) -> ApiResult<Json<Deployment>> {
    Ok(Json(state.deployments.start_deployment(&id).await?))
}

async fn stop_deployment(State(state): State<Arc<ApiState>>, Path(id): Path<String>) -> ApiResult<Json<Deployment>> {
    Ok(Json(state.deployments.stop_deployment(&id).await?))
}

async fn scale_deployment(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<Deployment>> {
    let request: ScaleRequest = parse_body(&body)?;
    request.validate()?;
    Ok(Json(state.deployments.scale_deployment(&id, request).await?))
}

async fn post_heartbeat(State(state): State<Arc<ApiState>>, body: Bytes) -> ApiResult<Json<serde_json::Value>> {
    let mut heartbeat: Heartbeat = parse_body(&body)?;
    heartbeat.origin_bytes = Some(String::from_utf8_lossy(&body).into_owned());
    state.deployments.process_heartbeat(&heartbeat).await?;
    Ok(Json(json!({})))
}

#[derive(Deserialize)]
struct PlainSecret {
    plaintext: String,
}

#[derive(Deserialize)]
struct SealedSecret {
    ciphertext: String,
}

async fn encrypt_secret(State(state): State<Arc<ApiState>>, body: Bytes) -> ApiResult<Json<serde_json::Value>> {
    let secret: PlainSecret = parse_body(&body)?;
    let ciphertext = state.secrets.encrypt(&secret.plaintext)?;
    Ok(Json(json!({"ciphertext": ciphertext, "version": state.secrets.version()})))
}

async fn decrypt_secret(State(state): State<Arc<ApiState>>, body: Bytes) -> ApiResult<Json<serde_json::Value>> {
    let secret: SealedSecret = parse_body(&body)?;
    let plaintext = state.secrets.decrypt(&secret.ciphertext)?;
    Ok(Json(json!({"plaintext": plaintext})))
}

async fn get_secret_key(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    Json(json!({"version": state.secrets.version()}))
}

/// Key generation is CPU bound, so it runs off the reactor.
async fn rotate_secret_key(State(state): State<Arc<ApiState>>) -> ApiResult<Json<serde_json::Value>> {
    let secrets = state.secrets.clone();
    let version = tokio::task::spawn_blocking(move || secrets.rotate())
        .await
        .map_err(|e| AxError::internal(format!("Key rotation task failed: {}", e)))??;
    Ok(Json(json!({"version": version})))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::deployment_service::{DeploymentServiceConfig, StandardDeploymentService};
    use crate::infrastructure::admission_client::UnlimitedAdmission;
    use crate::infrastructure::am_client::AmClient;
    use crate::infrastructure::axdb::memory::InMemoryDatabase;
    use crate::infrastructure::axdb::schema::manager_tables;
    use crate::infrastructure::cache::InMemoryCache;
    use crate::infrastructure::heartbeat_registry::{HeartbeatHandler, HeartbeatRegistry};
    use crate::infrastructure::lock::KeyedLockGroup;
    use crate::infrastructure::repositories::AxdbDeploymentRepository;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::time::Duration;
    use tower::ServiceExt;

    fn app() -> (Router, Arc<EtagRotator>) {
        let (router, etag, _) = app_with_heartbeats();
        (router, etag)
    }

    fn app_with_heartbeats() -> (Router, Arc<EtagRotator>, Arc<HeartbeatRegistry>) {
        let heartbeats = Arc::new(HeartbeatRegistry::new());
        let db = Arc::new(InMemoryDatabase::with_tables(manager_tables()));
        let cache = Arc::new(InMemoryCache::new());
        let service = StandardDeploymentService::new(
            Arc::new(AxdbDeploymentRepository::new(db)),
            Arc::new(UnlimitedAdmission),
            Arc::new(AmClient::test_mode()),
            cache.clone(),
            heartbeats.clone(),
            Arc::new(KeyedLockGroup::new(Duration::from_secs(60))),
            DeploymentServiceConfig::default(),
        );
        let etag = Arc::new(EtagRotator::new(cache, None));
        let state = Arc::new(ApiState {
            deployments: Arc::new(service),
            etag: etag.clone(),
            secrets: Arc::new(SecretKeyStore::load_with_bits(None, 1024).unwrap()),
        });
        (router(state), etag, heartbeats)
    }

    #[derive(Default)]
    struct Captured(parking_lot::Mutex<Vec<Heartbeat>>);

    #[async_trait::async_trait]
    impl HeartbeatHandler for Captured {
        async fn handle(&self, heartbeat: &Heartbeat) -> AxResult<()> {
            self.0.lock().push(heartbeat.clone());
            Ok(())
        }
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, HeaderMap, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, headers, value)
    }

    fn spec() -> Value {
        json!({
            "application_name": "app-1",
            "name": "web",
            "template": {"scale": {"min": 1}, "containers": []}
        })
    }

    #[tokio::test]
    async fn test_ping() {
        let (app, _) = app();
        let (status, _, body) = call(&app, Method::GET, "/v1/ping", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!("pong"));
    }

    #[tokio::test]
    async fn test_create_list_and_conditional_get() {
        let (app, etag) = app();
        let (status, _, created) = call(&app, Method::POST, "/v1/deployments", Some(spec())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["status"], "Active");

        let (status, _, again) = call(&app, Method::POST, "/v1/deployments", Some(spec())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(again["id"], created["id"]);

        let (status, headers, list) = call(&app, Method::GET, "/v1/deployments?application_name=app-1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list["data"].as_array().unwrap().len(), 1);
        let token = headers[ETAG].to_str().unwrap().to_string();
        assert_eq!(token, etag.combined());

        let request = Request::builder()
            .uri("/v1/deployments")
            .header(IF_NONE_MATCH, token)
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    }

    #[tokio::test]
    async fn test_errors_are_json() {
        let (app, _) = app();
        let (status, _, body) = call(&app, Method::GET, "/v1/deployments/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], codes::ERR_NOT_FOUND);

        let (status, _, body) = call(&app, Method::POST, "/v1/deployments", Some(json!({"name": 1}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], codes::ERR_API_INVALID_PARAM);

        let (status, _, body) = call(&app, Method::GET, "/v1/deployments?limit=many", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], codes::ERR_API_INVALID_PARAM);
    }

    #[tokio::test]
    async fn test_stop_start_scale_and_delete() {
        let (app, _) = app();
        let (_, _, created) = call(&app, Method::POST, "/v1/deployments", Some(spec())).await;
        let id = created["id"].as_str().unwrap().to_string();

        let (status, _, scaled) = call(
            &app,
            Method::POST,
            &format!("/v1/deployments/{}/scale", id),
            Some(json!({"min": 3})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(scaled["template"]["scale"]["min"], 3);

        let (status, _, scaled) = call(
            &app,
            Method::POST,
            &format!("/v1/deployments/{}/scale", id),
            Some(json!({"min": 2, "max": 5, "desired": 4})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(scaled["template"]["scale"], json!({"min": 2, "max": 5, "desired": 4}));

        let (status, _, body) = call(
            &app,
            Method::POST,
            &format!("/v1/deployments/{}/scale", id),
            Some(json!({"min": 2, "max": 3, "desired": 4})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], codes::ERR_API_INVALID_PARAM);

        let (_, _, stopped) = call(&app, Method::POST, &format!("/v1/deployments/{}/stop", id), None).await;
        assert_eq!(stopped["status"], "Terminated");
        let (_, _, started) = call(&app, Method::POST, &format!("/v1/deployments/{}/start", id), None).await;
        assert_eq!(started["status"], "Active");

        let (status, _, _) = call(&app, Method::DELETE, &format!("/v1/deployments/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _, body) = call(&app, Method::DELETE, &format!("/v1/deployments/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({}));
    }

    #[tokio::test]
    async fn test_put_updates_metadata_only() {
        let (app, _) = app();
        let mut body = spec();
        body["template"]["version"] = json!("A");
        let (_, _, created) = call(&app, Method::POST, "/v1/deployments", Some(body)).await;
        let id = created["id"].as_str().unwrap().to_string();

        let update = json!({
            "application_name": "app-1",
            "name": "web",
            "template": {"scale": {"min": 1}, "containers": [], "version": "B"},
            "termination_policy": {"time_seconds": "3600"},
            "labels": {"team": "infra"}
        });
        let (status, _, updated) = call(&app, Method::PUT, &format!("/v1/deployments/{}", id), Some(update)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["id"], created["id"]);
        assert_eq!(updated["template"]["version"], "A");
        assert_eq!(updated["status"], created["status"]);
        assert_eq!(updated["termination_policy"]["time_seconds"], "3600");
        assert_eq!(updated["labels"]["team"], "infra");

        let (_, _, list) = call(&app, Method::GET, "/v1/deployments?application_name=app-1", None).await;
        assert_eq!(list["data"].as_array().unwrap().len(), 1);
        assert_eq!(list["data"][0]["id"], created["id"]);
    }

    #[tokio::test]
    async fn test_heartbeat_is_accepted() {
        let (app, _) = app();
        let heartbeat = json!({"date": 0, "key": "unregistered", "data": {}});
        let (status, _, _) = call(&app, Method::POST, "/v1/heartbeats", Some(heartbeat)).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_raw_payload() {
        let (app, _, heartbeats) = app_with_heartbeats();
        let captured = Arc::new(Captured::default());
        heartbeats.register("app-1", captured.clone());

        let heartbeat = json!({"date": 1, "key": "app-1", "data": {"Active": 2}});
        let (status, _, _) = call(&app, Method::POST, "/v1/heartbeats", Some(heartbeat.clone())).await;
        assert_eq!(status, StatusCode::OK);

        let seen = captured.0.lock().clone();
        assert_eq!(seen.len(), 1);
        let raw = seen[0].origin_bytes.as_deref().unwrap();
        assert_eq!(serde_json::from_str::<Value>(raw).unwrap(), heartbeat);
    }

    #[tokio::test]
    async fn test_secret_encrypt_decrypt_and_rotate() {
        let (app, _) = app();
        let (status, _, sealed) =
            call(&app, Method::POST, "/v1/secret/encrypt", Some(json!({"plaintext": "hunter2"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(sealed["version"], 1);
        let ciphertext = sealed["ciphertext"].as_str().unwrap().to_string();
        assert_ne!(ciphertext, "hunter2");

        let (status, _, opened) = call(
            &app,
            Method::POST,
            "/v1/secret/decrypt",
            Some(json!({"ciphertext": ciphertext})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(opened["plaintext"], "hunter2");

        let (status, _, body) =
            call(&app, Method::POST, "/v1/secret/decrypt", Some(json!({"ciphertext": "not-sealed"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], codes::ERR_API_INVALID_PARAM);

        let (status, _, rotated) = call(&app, Method::PUT, "/v1/secret/key", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(rotated["version"], 2);
        let (_, _, current) = call(&app, Method::GET, "/v1/secret/key", None).await;
        assert_eq!(current["version"], 2);
    }
}
