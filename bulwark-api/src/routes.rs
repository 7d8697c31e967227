//! Route handlers and the router.

use axum::body::{Body, Bytes};
use axum::extract::{DefaultBodyLimit, Extension, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bulwark_envelope::{Ciphertext, Context, KEY_LEN};
use bulwark_keystore::{Enclave, Identity, KesError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};
use tokio_stream::StreamExt;

use crate::auth::{pipeline, EffectiveIdentity, ProxySettings, ENCLAVE_HEADER};
use crate::error::ApiError;

/// Body cap for payload-bearing routes.
pub const MAX_BODY: usize = 1 << 20;

/// Body cap for identity assignment.
const ASSIGN_BODY: usize = 1 << 10;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub struct AppState {
    pub default_enclave: Arc<Enclave>,
    pub enclaves: HashMap<String, Arc<Enclave>>,
    pub proxy: ProxySettings,
    pub metrics: Metrics,
    pub started: Instant,
    pub log_error: bool,
}

pub type Shared = Arc<AppState>;

impl AppState {
    /// Resolve the target enclave: the default, unless the request selects
    /// another one by header.
    pub fn enclave_for(&self, headers: &HeaderMap) -> Option<Arc<Enclave>> {
        match headers.get(ENCLAVE_HEADER) {
            None => Some(self.default_enclave.clone()),
            Some(value) => value
                .to_str()
                .ok()
                .and_then(|name| self.enclaves.get(name).cloned()),
        }
    }
}

/// In-process request counters.
#[derive(Default)]
pub struct Metrics {
    requests: AtomicU64,
    ok: AtomicU64,
    client_errors: AtomicU64,
    server_errors: AtomicU64,
    latency_ms_total: AtomicU64,
}

impl Metrics {
    pub fn observe(&self, status: StatusCode, latency: Duration) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.latency_ms_total
            .fetch_add(latency.as_millis() as u64, Ordering::Relaxed);
        if status.is_server_error() {
            self.server_errors.fetch_add(1, Ordering::Relaxed);
        } else if status.is_client_error() {
            self.client_errors.fetch_add(1, Ordering::Relaxed);
        } else {
            self.ok.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn snapshot(&self) -> serde_json::Value {
        json!({
            "requests": self.requests.load(Ordering::Relaxed),
            "ok": self.ok.load(Ordering::Relaxed),
            "client_errors": self.client_errors.load(Ordering::Relaxed),
            "server_errors": self.server_errors.load(Ordering::Relaxed),
            "latency_ms_total": self.latency_ms_total.load(Ordering::Relaxed),
        })
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router(state: Shared) -> Router {
    Router::new()
        .route("/version", get(version))
        .route("/metrics", get(metrics))
        .route("/v1/status", get(status))
        .route("/v1/key/create/:name", post(create_key))
        .route("/v1/key/import/:name", post(import_key))
        .route("/v1/key/generate/:name", post(generate_key))
        .route("/v1/key/encrypt/:name", post(encrypt_key))
        .route("/v1/key/decrypt/:name", post(decrypt_key))
        .route("/v1/key/delete/:name", delete(delete_key))
        .route("/v1/key/list/", get(list_keys_all))
        .route("/v1/key/list/:pattern", get(list_keys))
        .route("/v1/policy/describe/:name", get(describe_policy))
        .route("/v1/policy/read/:name", get(read_policy))
        .route("/v1/policy/write/:name", post(write_policy))
        .route("/v1/policy/delete/:name", delete(delete_policy))
        .route("/v1/policy/list/", get(list_policies_all))
        .route("/v1/policy/list/:pattern", get(list_policies))
        .route(
            "/v1/identity/assign/:policy/:identity",
            post(assign_identity).layer(DefaultBodyLimit::max(ASSIGN_BODY)),
        )
        .route("/v1/identity/forget/:identity", delete(forget_identity))
        .route("/v1/identity/list/", get(list_identities_all))
        .route("/v1/identity/list/:pattern", get(list_identities))
        .route("/v1/log/audit/trace", get(audit_trace))
        .layer(axum::middleware::from_fn_with_state(state.clone(), pipeline))
        .layer(DefaultBodyLimit::max(MAX_BODY))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct GenerateRequest {
    #[serde(default)]
    context: Context,
}

#[derive(Serialize)]
struct GenerateResponse {
    plaintext: String,
    ciphertext: Ciphertext,
}

#[derive(Deserialize)]
struct EncryptRequest {
    plaintext: String,
    #[serde(default)]
    context: Context,
}

#[derive(Serialize)]
struct EncryptResponse {
    ciphertext: Ciphertext,
}

#[derive(Deserialize)]
struct DecryptRequest {
    ciphertext: Ciphertext,
    #[serde(default)]
    context: Context,
}

#[derive(Serialize)]
struct DecryptResponse {
    plaintext: String,
}

#[derive(Deserialize)]
struct ImportRequest {
    key: String,
}

#[derive(Deserialize)]
struct WritePolicyRequest {
    #[serde(default)]
    allow: Vec<String>,
    #[serde(default)]
    deny: Vec<String>,
}

// ---------------------------------------------------------------------------
// Meta routes
// ---------------------------------------------------------------------------

async fn version() -> Json<serde_json::Value> {
    Json(json!({"version": env!("CARGO_PKG_VERSION")}))
}

async fn metrics(State(state): State<Shared>) -> Json<serde_json::Value> {
    Json(state.metrics.snapshot())
}

async fn status(
    State(state): State<Shared>,
    Extension(enclave): Extension<Arc<Enclave>>,
) -> Json<serde_json::Value> {
    let store = enclave.status().await;
    let state_name = if store.is_reachable() {
        "available"
    } else {
        "unreachable"
    };
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started.elapsed().as_secs(),
        "keystore": {
            "state": state_name,
            "latency_ms": store.latency.as_millis() as u64,
        },
    }))
}

// ---------------------------------------------------------------------------
// Key routes
// ---------------------------------------------------------------------------

async fn create_key(
    Extension(enclave): Extension<Arc<Enclave>>,
    Extension(EffectiveIdentity(identity)): Extension<EffectiveIdentity>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    enclave.create_key(&name, &identity).await?;
    Ok(StatusCode::OK)
}

async fn import_key(
    Extension(enclave): Extension<Arc<Enclave>>,
    Extension(EffectiveIdentity(identity)): Extension<EffectiveIdentity>,
    Path(name): Path<String>,
    Json(body): Json<ImportRequest>,
) -> Result<StatusCode, ApiError> {
    let raw = BASE64
        .decode(&body.key)
        .map_err(|_| ApiError::bad_request("key must be base64"))?;
    let material: [u8; KEY_LEN] = raw
        .try_into()
        .map_err(|_| ApiError::bad_request("key must be 32 bytes"))?;
    enclave.import_key(&name, material, &identity).await?;
    Ok(StatusCode::OK)
}

async fn generate_key(
    Extension(enclave): Extension<Arc<Enclave>>,
    Path(name): Path<String>,
    Json(body): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>, ApiError> {
    let (plaintext, ciphertext) = enclave.generate_key(&name, &body.context).await?;
    Ok(Json(GenerateResponse {
        plaintext: BASE64.encode(plaintext),
        ciphertext,
    }))
}

async fn encrypt_key(
    Extension(enclave): Extension<Arc<Enclave>>,
    Path(name): Path<String>,
    Json(body): Json<EncryptRequest>,
) -> Result<Json<EncryptResponse>, ApiError> {
    let plaintext = BASE64
        .decode(&body.plaintext)
        .map_err(|_| ApiError::bad_request("plaintext must be base64"))?;
    let ciphertext = enclave.encrypt_key(&name, &plaintext, &body.context).await?;
    Ok(Json(EncryptResponse { ciphertext }))
}

async fn decrypt_key(
    Extension(enclave): Extension<Arc<Enclave>>,
    Path(name): Path<String>,
    Json(body): Json<DecryptRequest>,
) -> Result<Json<DecryptResponse>, ApiError> {
    let plaintext = enclave
        .decrypt_key(&name, &body.ciphertext, &body.context)
        .await?;
    Ok(Json(DecryptResponse {
        plaintext: BASE64.encode(plaintext),
    }))
}

async fn delete_key(
    Extension(enclave): Extension<Arc<Enclave>>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    enclave.delete_key(&name).await?;
    Ok(StatusCode::OK)
}

async fn list_keys(
    Extension(enclave): Extension<Arc<Enclave>>,
    Path(pattern): Path<String>,
) -> Response {
    stream_keys(enclave, pattern).await
}

async fn list_keys_all(Extension(enclave): Extension<Arc<Enclave>>) -> Response {
    stream_keys(enclave, "*".into()).await
}

/// ND-JSON name listing. Entries that fail to load produce a per-entry
/// error line; a truncated backend listing produces a final one.
async fn stream_keys(enclave: Arc<Enclave>, pattern: String) -> Response {
    let iter = match enclave.list_keys(&pattern).await {
        Ok(iter) => iter,
        Err(e) => return ApiError::from(e).into_response(),
    };
    let truncated = iter.err().cloned();

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, Infallible>>(16);
    tokio::spawn(async move {
        for name in iter {
            let line = match enclave.describe_key(&name).await {
                Ok(info) => json!({"name": info.name, "created_at": info.created_at}),
                Err(_) => json!({"error": format!("cannot read key {}", name)}),
            };
            if tx.send(Ok(ndjson_line(&line))).await.is_err() {
                return;
            }
        }
        if truncated.is_some() {
            let _ = tx
                .send(Ok(ndjson_line(&json!({"error": "listing interrupted"}))))
                .await;
        }
    });

    ndjson_response(Body::from_stream(ReceiverStream::new(rx)))
}

// ---------------------------------------------------------------------------
// Policy routes
// ---------------------------------------------------------------------------

async fn describe_policy(
    Extension(enclave): Extension<Arc<Enclave>>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let info = enclave.describe_policy(&name)?;
    Ok(Json(info).into_response())
}

async fn read_policy(
    Extension(enclave): Extension<Arc<Enclave>>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let policy = enclave.get_policy(&name)?;
    Ok(Json(policy).into_response())
}

async fn write_policy(
    Extension(enclave): Extension<Arc<Enclave>>,
    Extension(EffectiveIdentity(identity)): Extension<EffectiveIdentity>,
    Path(name): Path<String>,
    Json(body): Json<WritePolicyRequest>,
) -> Result<StatusCode, ApiError> {
    let policy = bulwark_keystore::Policy::new(body.allow, body.deny, identity)?;
    enclave.set_policy(&name, policy).await?;
    Ok(StatusCode::OK)
}

async fn delete_policy(
    Extension(enclave): Extension<Arc<Enclave>>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    enclave.delete_policy(&name).await?;
    Ok(StatusCode::OK)
}

async fn list_policies(
    Extension(enclave): Extension<Arc<Enclave>>,
    Path(pattern): Path<String>,
) -> Response {
    policy_listing(&enclave, &pattern)
}

async fn list_policies_all(Extension(enclave): Extension<Arc<Enclave>>) -> Response {
    policy_listing(&enclave, "*")
}

fn policy_listing(enclave: &Enclave, pattern: &str) -> Response {
    let mut entries = enclave.list_policies(pattern);
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    let body: Vec<u8> = entries
        .iter()
        .flat_map(|(name, info)| {
            ndjson_line(&json!({"name": name, "created_at": info.created_at}))
        })
        .collect();
    ndjson_response(Body::from(body))
}

// ---------------------------------------------------------------------------
// Identity routes
// ---------------------------------------------------------------------------

async fn assign_identity(
    Extension(enclave): Extension<Arc<Enclave>>,
    Extension(EffectiveIdentity(caller)): Extension<EffectiveIdentity>,
    Path((policy, identity)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    if caller.as_str() == identity {
        return Err(KesError::SelfAssign.into());
    }
    let identity =
        Identity::new(identity).map_err(|_| ApiError::bad_request("invalid identity"))?;
    enclave.assign_policy(&policy, identity)?;
    Ok(StatusCode::OK)
}

async fn forget_identity(
    Extension(enclave): Extension<Arc<Enclave>>,
    Path(identity): Path<String>,
) -> Result<StatusCode, ApiError> {
    let identity =
        Identity::new(identity).map_err(|_| ApiError::bad_request("invalid identity"))?;
    enclave.forget_identity(&identity);
    Ok(StatusCode::OK)
}

async fn list_identities(
    Extension(enclave): Extension<Arc<Enclave>>,
    Path(pattern): Path<String>,
) -> Response {
    identity_listing(&enclave, &pattern)
}

async fn list_identities_all(Extension(enclave): Extension<Arc<Enclave>>) -> Response {
    identity_listing(&enclave, "*")
}

fn identity_listing(enclave: &Enclave, pattern: &str) -> Response {
    let mut identities = enclave.list_identities(pattern);
    identities.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    let body: Vec<u8> = identities
        .iter()
        .flat_map(|identity| {
            let policy = enclave.identity_policy(identity);
            ndjson_line(&json!({"identity": identity, "policy": policy}))
        })
        .collect();
    ndjson_response(Body::from(body))
}

// ---------------------------------------------------------------------------
// Audit trace
// ---------------------------------------------------------------------------

/// Live audit stream. No timeout applies; the subscription drops records
/// rather than back-pressuring request handling.
async fn audit_trace(Extension(enclave): Extension<Arc<Enclave>>) -> Response {
    let feed = enclave.audit().subscribe();
    let stream = BroadcastStream::new(feed).filter_map(|item| match item {
        Ok(record) => {
            let line = serde_json::to_value(&record).unwrap_or_else(|_| json!({}));
            Some(Ok::<_, Infallible>(ndjson_line(&line)))
        }
        // Lagged subscribers skip what they missed.
        Err(_) => None,
    });
    ndjson_response(Body::from_stream(stream))
}

// ---------------------------------------------------------------------------
// ND-JSON helpers
// ---------------------------------------------------------------------------

fn ndjson_line(value: &serde_json::Value) -> Bytes {
    let mut line = value.to_string().into_bytes();
    line.push(b'\n');
    Bytes::from(line)
}

fn ndjson_response(body: Body) -> Response {
    (
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        body,
    )
        .into_response()
}
