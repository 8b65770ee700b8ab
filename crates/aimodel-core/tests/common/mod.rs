//! Shared fixtures: an in-process HTTP server and a counting registry.

#![allow(dead_code)]

use aimodel_core::registry::{ModelRegistry, ResolvedDownload};
use aimodel_core::{AimodelError, HashMatch, RemoteModel, Result, VersionRecord};
use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{Path as UrlPath, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const PREVIEW_BYTES: &[u8] = b"\x89PNG fake preview";

/// Deterministic payload of `len` bytes.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub struct ServerState {
    pub content: Vec<u8>,
    /// `Range` header of every file request, in arrival order.
    pub ranges: Mutex<Vec<Option<String>>>,
    /// Remaining `/flaky` requests that die halfway through the body.
    pub flaky_failures: AtomicUsize,
    /// Delay between body chunks on `/slow`; `/flaky` uses a fifth of it.
    pub chunk_delay: Duration,
    pub api_requests: AtomicUsize,
    pub models: Mutex<HashMap<u64, serde_json::Value>>,
    pub by_hash: Mutex<HashMap<String, serde_json::Value>>,
}

impl ServerState {
    pub fn file_requests(&self) -> usize {
        self.ranges.lock().unwrap().len()
    }

    pub fn last_range(&self) -> Option<String> {
        self.ranges.lock().unwrap().last().cloned().flatten()
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: Arc<ServerState>,
}

impl TestServer {
    pub async fn start(content: Vec<u8>) -> Self {
        Self::start_with_delay(content, Duration::from_millis(50)).await
    }

    pub async fn start_with_delay(content: Vec<u8>, chunk_delay: Duration) -> Self {
        let state = Arc::new(ServerState {
            content,
            ranges: Mutex::new(Vec::new()),
            flaky_failures: AtomicUsize::new(0),
            chunk_delay,
            api_requests: AtomicUsize::new(0),
            models: Mutex::new(HashMap::new()),
            by_hash: Mutex::new(HashMap::new()),
        });

        let app = Router::new()
            .route("/files/model.bin", get(ranged_file))
            .route("/norange/model.bin", get(full_file))
            .route("/slow/model.bin", get(slow_file))
            .route("/flaky/model.bin", get(flaky_file))
            .route("/images/width=512/preview.jpeg", get(preview))
            .route("/api/v1/models/:id", get(api_model))
            .route("/api/v1/model-versions/:id", get(api_version))
            .route("/api/v1/model-versions/by-hash/:hash", get(api_by_hash))
            .route("/api/v1/download/models/:id", get(api_download))
            .route("/api/v1/download/private/:id", get(api_download_login))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn api_base(&self) -> String {
        self.url("/api/v1")
    }

    /// Register a Civitai-shaped model whose single version serves `/files/model.bin`.
    pub fn add_model(&self, model_id: u64, version_id: u64, name: &str, model_type: &str) {
        let version = self.version_json(model_id, version_id, "2024-03-01T00:00:00Z");
        let model = serde_json::json!({
            "id": model_id,
            "name": name,
            "type": model_type,
            "nsfw": false,
            "description": "<p>A <a href=\"https://example.com/guide\">guide</a></p>",
            "modelVersions": [version],
        });
        self.state.models.lock().unwrap().insert(model_id, model);

        let mut by_hash = version;
        by_hash["model"] = serde_json::json!({ "name": name, "type": model_type });
        self.state
            .by_hash
            .lock()
            .unwrap()
            .insert(sha256_hex(&self.state.content), by_hash);
    }

    pub fn version_json(
        &self,
        model_id: u64,
        version_id: u64,
        published: &str,
    ) -> serde_json::Value {
        serde_json::json!({
            "id": version_id,
            "modelId": model_id,
            "name": format!("v{}", version_id),
            "publishedAt": published,
            "status": "Published",
            "baseModel": "SDXL 1.0",
            "trainedWords": ["neon style", "<lora:neon:0.7>"],
            "description": null,
            "files": [{
                "id": version_id * 10,
                "name": "Neon: Style?.safetensors",
                "sizeKB": self.state.content.len() as f64 / 1024.0,
                "primary": true,
                "hashes": { "SHA256": sha256_hex(&self.state.content).to_uppercase() },
                "downloadUrl": self.url(&format!("/api/v1/download/models/{}", version_id)),
            }],
            "images": [
                { "url": self.url("/images/width=450/preview.jpeg"), "type": "image" }
            ],
        })
    }
}

fn record_range(state: &ServerState, headers: &HeaderMap) -> Option<u64> {
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.ranges.lock().unwrap().push(range.clone());
    range
        .as_deref()
        .and_then(|r| r.strip_prefix("bytes="))
        .and_then(|r| r.trim_end_matches('-').parse().ok())
}

fn partial_response(content: &[u8], start: u64, body: Body) -> Response {
    let total = content.len() as u64;
    if start >= total {
        return (
            StatusCode::RANGE_NOT_SATISFIABLE,
            [(header::CONTENT_RANGE, format!("bytes */{}", total))],
        )
            .into_response();
    }
    (
        StatusCode::PARTIAL_CONTENT,
        [
            (
                header::CONTENT_RANGE,
                format!("bytes {}-{}/{}", start, total - 1, total),
            ),
            (header::ACCEPT_RANGES, "bytes".to_string()),
        ],
        body,
    )
        .into_response()
}

async fn ranged_file(State(state): State<Arc<ServerState>>, headers: HeaderMap) -> Response {
    match record_range(&state, &headers) {
        Some(start) if start > 0 => {
            let body = state.content.get(start as usize..).unwrap_or_default().to_vec();
            partial_response(&state.content, start, Body::from(body))
        }
        _ => (StatusCode::OK, state.content.clone()).into_response(),
    }
}

async fn full_file(State(state): State<Arc<ServerState>>, headers: HeaderMap) -> Response {
    record_range(&state, &headers);
    (StatusCode::OK, state.content.clone()).into_response()
}

fn chunked(data: Vec<u8>, delay: Duration, fail_after: Option<usize>) -> Body {
    let chunks: Vec<Bytes> = data.chunks(16 * 1024).map(Bytes::copy_from_slice).collect();
    let stream = futures::stream::unfold(0usize, move |i| {
        let chunks = chunks.clone();
        async move {
            if fail_after == Some(i) {
                return Some((
                    Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "dropped")),
                    i + 1,
                ));
            }
            let chunk = chunks.get(i)?.clone();
            tokio::time::sleep(delay).await;
            Some((Ok::<_, std::io::Error>(chunk), i + 1))
        }
    });
    Body::from_stream(stream)
}

async fn slow_file(State(state): State<Arc<ServerState>>, headers: HeaderMap) -> Response {
    let start = record_range(&state, &headers).unwrap_or(0);
    let rest = state.content.get(start as usize..).unwrap_or_default().to_vec();
    let body = chunked(rest, state.chunk_delay, None);
    if start > 0 {
        partial_response(&state.content, start, body)
    } else {
        (StatusCode::OK, body).into_response()
    }
}

async fn flaky_file(State(state): State<Arc<ServerState>>, headers: HeaderMap) -> Response {
    let start = record_range(&state, &headers).unwrap_or(0);
    let rest = state.content.get(start as usize..).unwrap_or_default().to_vec();
    let fail = state
        .flaky_failures
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    let half_chunks = rest.len().div_ceil(16 * 1024) / 2;
    let body = chunked(rest, state.chunk_delay / 5, fail.then_some(half_chunks));
    if start > 0 {
        partial_response(&state.content, start, body)
    } else {
        (StatusCode::OK, body).into_response()
    }
}

async fn preview() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "image/png")], PREVIEW_BYTES)
}

async fn api_model(State(state): State<Arc<ServerState>>, UrlPath(id): UrlPath<u64>) -> Response {
    state.api_requests.fetch_add(1, Ordering::SeqCst);
    match state.models.lock().unwrap().get(&id) {
        Some(model) => Json(model.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn api_version(State(state): State<Arc<ServerState>>, UrlPath(id): UrlPath<u64>) -> Response {
    state.api_requests.fetch_add(1, Ordering::SeqCst);
    let models = state.models.lock().unwrap();
    let version = models.values().find_map(|m| {
        m["modelVersions"]
            .as_array()
            .and_then(|versions| versions.iter().find(|v| v["id"] == id))
            .cloned()
    });
    match version {
        Some(version) => Json(version).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn api_by_hash(
    State(state): State<Arc<ServerState>>,
    UrlPath(hash): UrlPath<String>,
) -> Response {
    state.api_requests.fetch_add(1, Ordering::SeqCst);
    match state.by_hash.lock().unwrap().get(&hash.to_lowercase()) {
        Some(version) => Json(version.clone()).into_response(),
        None => (StatusCode::NOT_FOUND, Json(serde_json::json!({"error": "Model not found"})))
            .into_response(),
    }
}

async fn api_download(UrlPath(_id): UrlPath<u64>) -> Response {
    (
        StatusCode::TEMPORARY_REDIRECT,
        [(header::LOCATION, "/files/model.bin?token=signed")],
    )
        .into_response()
}

async fn api_download_login(UrlPath(_id): UrlPath<u64>) -> Response {
    (
        StatusCode::TEMPORARY_REDIRECT,
        [(
            header::LOCATION,
            "/login?returnUrl=%2Fmodels&reason=download-auth",
        )],
    )
        .into_response()
}

/// In-memory registry counting every call.
#[derive(Default)]
pub struct CountingRegistry {
    pub matches: Mutex<HashMap<String, HashMatch>>,
    pub versions: Mutex<HashMap<u64, Vec<VersionRecord>>>,
    /// Models whose lookups fail with a network error.
    pub broken_models: Mutex<Vec<u64>>,
    pub unavailable: std::sync::atomic::AtomicBool,
    pub identify_calls: AtomicUsize,
    pub list_calls: AtomicUsize,
}

impl CountingRegistry {
    pub fn add_match(&self, digest: &str, model_id: u64, version_id: u64) {
        self.matches.lock().unwrap().insert(
            digest.to_string(),
            HashMatch {
                model_id,
                version_id,
                version_name: format!("V{}", version_id),
                model_name: Some(format!("Model {}", model_id)),
                model_type: Some("LORA".to_string()),
                base_model: Some("SD 1.5".to_string()),
                trained_words: vec!["trigger".to_string()],
                description: None,
                images: Vec::new(),
                file: None,
            },
        );
    }

    pub fn set_versions(&self, model_id: u64, versions: &[(u64, i64)]) {
        let records = versions
            .iter()
            .map(|&(version_id, t)| version_record(model_id, version_id, t))
            .collect();
        self.versions.lock().unwrap().insert(model_id, records);
    }

    pub fn identify_count(&self) -> usize {
        self.identify_calls.load(Ordering::SeqCst)
    }

    pub fn list_count(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

pub fn version_record(model_id: u64, version_id: u64, t: i64) -> VersionRecord {
    VersionRecord {
        version_id,
        model_id,
        name: format!("V{}", version_id),
        published_at: Utc.timestamp_opt(t, 0).unwrap(),
        retracted: false,
        base_model: None,
        trained_words: Vec::new(),
        files: Vec::new(),
        images: Vec::new(),
    }
}

fn network_down() -> AimodelError {
    AimodelError::NetworkFailure {
        message: "connection refused".to_string(),
        source: None,
    }
}

#[async_trait]
impl ModelRegistry for CountingRegistry {
    async fn identify_by_hash(&self, digest: &str) -> Result<Option<HashMatch>> {
        self.identify_calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AimodelError::IdentifyFailure {
                digest: digest.to_string(),
                message: "registry unreachable".to_string(),
            });
        }
        Ok(self.matches.lock().unwrap().get(digest).cloned())
    }

    async fn get_model(&self, model_id: u64) -> Result<RemoteModel> {
        if self.broken_models.lock().unwrap().contains(&model_id) {
            return Err(network_down());
        }
        let versions = self
            .versions
            .lock()
            .unwrap()
            .get(&model_id)
            .cloned()
            .ok_or_else(|| AimodelError::NotFound {
                what: format!("model {}", model_id),
            })?;
        Ok(RemoteModel {
            model_id,
            name: format!("Model {}", model_id),
            model_type: "LORA".to_string(),
            nsfw: false,
            description: None,
            versions,
        })
    }

    async fn list_versions(&self, model_id: u64) -> Result<Vec<VersionRecord>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let mut versions = self.get_model(model_id).await?.versions;
        versions.sort_by_key(|v| (v.published_at, v.version_id));
        Ok(versions)
    }

    async fn resolve_download_url(
        &self,
        version_id: u64,
        _file_id: Option<u64>,
    ) -> Result<ResolvedDownload> {
        Err(AimodelError::NotFound {
            what: format!("download for version {}", version_id),
        })
    }
}
