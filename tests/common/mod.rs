//! In-process mock servers for integration tests.
//!
//! These servers run within the test process on random available ports and
//! speak just enough of the etcd v3 JSON gateway and the B2 native API to
//! exercise the real HTTP clients.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use etcd_snapper::upload::UploadStep;

async fn bind() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind mock server");
    let addr = listener.local_addr().expect("Failed to get local address");
    (listener, addr)
}

fn serve(listener: TcpListener, app: Router) -> JoinHandle<()> {
    tokio::spawn(async move {
        axum::serve(listener, app)
            .await
            .expect("Mock server failed");
    })
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

// ============================================================================
// etcd gateway
// ============================================================================

/// Frame acknowledging watch creation.
pub fn watch_created_frame() -> String {
    json!({ "result": { "header": { "revision": "1" }, "created": true } }).to_string()
}

/// Frame carrying `count` mutations at `revision`.
pub fn watch_event_frame(revision: i64, count: usize) -> String {
    let events: Vec<Value> = (0..count)
        .map(|i| {
            json!({
                "kv": {
                    "key": STANDARD.encode(format!("hello/{}", i)),
                    "value": STANDARD.encode("world"),
                    "mod_revision": revision.to_string(),
                }
            })
        })
        .collect();
    json!({ "result": { "header": { "revision": revision.to_string() }, "events": events } })
        .to_string()
}

/// Progress notification: a header and nothing else.
pub fn watch_progress_frame(revision: i64) -> String {
    json!({ "result": { "header": { "revision": revision.to_string() } } }).to_string()
}

pub fn watch_canceled_frame(reason: &str) -> String {
    json!({ "result": { "canceled": true, "cancel_reason": reason } }).to_string()
}

pub fn snapshot_chunk_frame(data: &[u8]) -> String {
    json!({ "result": { "remaining_bytes": "0", "blob": STANDARD.encode(data) } }).to_string()
}

pub fn error_frame(grpc_code: i32, message: &str) -> String {
    json!({ "error": { "grpc_code": grpc_code, "http_code": 503, "message": message } })
        .to_string()
}

#[derive(Default)]
struct EtcdState {
    watch_frames: RwLock<Vec<String>>,
    snapshot_frames: RwLock<Vec<String>>,
    watch_status: RwLock<Option<StatusCode>>,
    watch_requests: RwLock<Vec<Value>>,
    snapshot_calls: AtomicUsize,
}

/// In-process stand-in for the etcd v3 JSON gateway.
///
/// Each request streams back the configured frames, one per line, with every
/// line split across two chunks, then closes the body.
pub struct MockEtcdServer {
    state: Arc<EtcdState>,
    _handle: JoinHandle<()>,
    addr: SocketAddr,
}

impl MockEtcdServer {
    pub async fn start() -> Self {
        let (listener, addr) = bind().await;
        let state = Arc::new(EtcdState::default());

        let app = Router::new()
            .route("/v3/watch", post(etcd_watch))
            .route("/v3/maintenance/snapshot", post(etcd_snapshot))
            .with_state(state.clone());

        Self {
            state,
            _handle: serve(listener, app),
            addr,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub async fn set_watch_frames(&self, frames: Vec<String>) {
        *self.state.watch_frames.write().await = frames;
    }

    pub async fn set_snapshot_frames(&self, frames: Vec<String>) {
        *self.state.snapshot_frames.write().await = frames;
    }

    /// Reject watch requests with `status` instead of streaming.
    pub async fn set_watch_status(&self, status: u16) {
        *self.state.watch_status.write().await = StatusCode::from_u16(status).ok();
    }

    pub async fn watch_requests(&self) -> Vec<Value> {
        self.state.watch_requests.read().await.clone()
    }

    pub fn snapshot_calls(&self) -> usize {
        self.state.snapshot_calls.load(Ordering::SeqCst)
    }
}

fn frame_body(frames: Vec<String>) -> Body {
    let chunks: Vec<Result<Bytes, std::io::Error>> = frames
        .into_iter()
        .flat_map(|frame| {
            let line = format!("{}\n", frame).into_bytes();
            let (head, tail) = line.split_at(line.len() / 2);
            [
                Ok(Bytes::copy_from_slice(head)),
                Ok(Bytes::copy_from_slice(tail)),
            ]
        })
        .collect();
    Body::from_stream(futures::stream::iter(chunks))
}

async fn etcd_watch(State(state): State<Arc<EtcdState>>, Json(request): Json<Value>) -> Response {
    state.watch_requests.write().await.push(request);

    if let Some(status) = *state.watch_status.read().await {
        return (status, "watch rejected").into_response();
    }
    frame_body(state.watch_frames.read().await.clone()).into_response()
}

async fn etcd_snapshot(State(state): State<Arc<EtcdState>>) -> Response {
    state.snapshot_calls.fetch_add(1, Ordering::SeqCst);
    frame_body(state.snapshot_frames.read().await.clone()).into_response()
}

// ============================================================================
// Backblaze B2
// ============================================================================

pub const ACCOUNT_TOKEN: &str = "account-token";
pub const UPLOAD_TOKEN: &str = "upload-token";

/// One request received by the upload endpoint.
#[derive(Debug, Clone)]
pub struct ReceivedUpload {
    pub authorization: Option<String>,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub sha1: Option<String>,
    pub body: Vec<u8>,
}

struct B2State {
    base_url: String,
    application_id: String,
    application_key: String,
    failures: RwLock<Vec<(UploadStep, u16)>>,
    upload_delay: RwLock<Duration>,
    upload_body_delay: RwLock<Duration>,
    authorize_calls: AtomicUsize,
    get_upload_url_calls: AtomicUsize,
    upload_calls: AtomicUsize,
    bucket_ids: RwLock<Vec<String>>,
    uploads: RwLock<Vec<ReceivedUpload>>,
}

impl B2State {
    async fn forced(&self, step: UploadStep) -> Option<Response> {
        let failures = self.failures.read().await;
        let (_, status) = failures.iter().find(|(s, _)| *s == step)?;
        let code = StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Some(
            (
                code,
                Json(json!({ "status": status, "code": "forced", "message": "forced failure" })),
            )
                .into_response(),
        )
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "status": 401, "code": "unauthorized", "message": "bad token" })),
    )
        .into_response()
}

/// In-process stand-in for the three B2 endpoints the uploader calls.
pub struct MockB2Server {
    state: Arc<B2State>,
    _handle: JoinHandle<()>,
}

impl MockB2Server {
    /// Start a server accepting exactly `application_id:application_key`.
    pub async fn start(application_id: &str, application_key: &str) -> Self {
        let (listener, addr) = bind().await;
        let state = Arc::new(B2State {
            base_url: format!("http://{}", addr),
            application_id: application_id.to_string(),
            application_key: application_key.to_string(),
            failures: RwLock::new(Vec::new()),
            upload_delay: RwLock::new(Duration::ZERO),
            upload_body_delay: RwLock::new(Duration::ZERO),
            authorize_calls: AtomicUsize::new(0),
            get_upload_url_calls: AtomicUsize::new(0),
            upload_calls: AtomicUsize::new(0),
            bucket_ids: RwLock::new(Vec::new()),
            uploads: RwLock::new(Vec::new()),
        });

        let app = Router::new()
            .route("/b2api/v1/b2_authorize_account", get(b2_authorize_account))
            .route("/b2api/v1/b2_get_upload_url", post(b2_get_upload_url))
            .route("/upload/bucket", post(b2_upload_file))
            .with_state(state.clone());

        Self {
            state,
            _handle: serve(listener, app),
        }
    }

    pub fn api_url(&self) -> String {
        self.state.base_url.clone()
    }

    /// Answer `step` with `status` from now on.
    pub async fn fail_at(&self, step: UploadStep, status: u16) {
        self.state.failures.write().await.push((step, status));
    }

    /// Hold every upload request for `delay` before answering.
    pub async fn set_upload_delay(&self, delay: Duration) {
        *self.state.upload_delay.write().await = delay;
    }

    /// Store uploads immediately, but hold the 200 response body for `delay`
    /// after sending the status line.
    pub async fn set_upload_body_delay(&self, delay: Duration) {
        *self.state.upload_body_delay.write().await = delay;
    }

    /// Calls per step: (authorize, get upload URL, upload file).
    pub fn calls(&self) -> (usize, usize, usize) {
        (
            self.state.authorize_calls.load(Ordering::SeqCst),
            self.state.get_upload_url_calls.load(Ordering::SeqCst),
            self.state.upload_calls.load(Ordering::SeqCst),
        )
    }

    pub async fn bucket_ids(&self) -> Vec<String> {
        self.state.bucket_ids.read().await.clone()
    }

    pub async fn uploads(&self) -> Vec<ReceivedUpload> {
        self.state.uploads.read().await.clone()
    }
}

async fn b2_authorize_account(State(state): State<Arc<B2State>>, headers: HeaderMap) -> Response {
    state.authorize_calls.fetch_add(1, Ordering::SeqCst);
    if let Some(response) = state.forced(UploadStep::Authorize).await {
        return response;
    }

    let credentials = format!("{}:{}", state.application_id, state.application_key);
    let expected = format!("Basic {}", STANDARD.encode(credentials));
    if header(&headers, "authorization").as_deref() != Some(expected.as_str()) {
        return unauthorized();
    }

    Json(json!({
        "accountId": "account",
        "authorizationToken": ACCOUNT_TOKEN,
        "apiUrl": state.base_url,
        "downloadUrl": state.base_url,
    }))
    .into_response()
}

async fn b2_get_upload_url(
    State(state): State<Arc<B2State>>,
    headers: HeaderMap,
    Json(request): Json<Value>,
) -> Response {
    state.get_upload_url_calls.fetch_add(1, Ordering::SeqCst);
    if let Some(response) = state.forced(UploadStep::GetUploadUrl).await {
        return response;
    }
    if header(&headers, "authorization").as_deref() != Some(ACCOUNT_TOKEN) {
        return unauthorized();
    }

    let bucket_id = request["bucketId"].as_str().unwrap_or_default().to_string();
    state.bucket_ids.write().await.push(bucket_id.clone());

    Json(json!({
        "bucketId": bucket_id,
        "uploadUrl": format!("{}/upload/bucket", state.base_url),
        "authorizationToken": UPLOAD_TOKEN,
    }))
    .into_response()
}

async fn b2_upload_file(
    State(state): State<Arc<B2State>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.upload_calls.fetch_add(1, Ordering::SeqCst);

    let delay = *state.upload_delay.read().await;
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    if let Some(response) = state.forced(UploadStep::UploadFile).await {
        return response;
    }

    state.uploads.write().await.push(ReceivedUpload {
        authorization: header(&headers, "authorization"),
        file_name: header(&headers, "x-bz-file-name"),
        content_type: header(&headers, "content-type"),
        sha1: header(&headers, "x-bz-content-sha1"),
        body: body.to_vec(),
    });

    let info = json!({ "fileId": "file-1", "contentLength": body.len() }).to_string();
    let body_delay = *state.upload_body_delay.read().await;
    if body_delay.is_zero() {
        return ([(CONTENT_TYPE, "application/json")], info).into_response();
    }

    let delayed = futures::stream::once(async move {
        tokio::time::sleep(body_delay).await;
        Ok::<_, std::io::Error>(Bytes::from(info))
    });
    (
        [(CONTENT_TYPE, "application/json")],
        Body::from_stream(delayed),
    )
        .into_response()
}
