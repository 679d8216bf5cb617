//! etcd v3 JSON gateway client.
//!
//! Talks to the grpc-gateway that etcd serves on its client port:
//! ```text
//! POST {endpoint}/v3/watch                  streamed WatchResponse frames
//! POST {endpoint}/v3/maintenance/snapshot   streamed SnapshotResponse frames
//! ```
//!
//! Streamed responses are newline-delimited JSON objects shaped as
//! `{"result": ...}` or `{"error": ...}`. Binary fields (keys, snapshot
//! blobs) travel base64 encoded and int64 fields travel as JSON strings.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::StreamExt;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::Deserialize;
use serde_json::json;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    prefix_range_end, ChangeEvent, ChangeEvents, ChangeStream, Result, SnapshotProducer,
    StoreError,
};

const WATCH_PATH: &str = "/v3/watch";
const SNAPSHOT_PATH: &str = "/v3/maintenance/snapshot";

/// Connection settings for the etcd gateway.
#[derive(Debug, Clone)]
pub struct EtcdConfig {
    /// Base URL of the etcd client port, e.g. `http://etcd:2379`.
    pub endpoint: String,
    /// Upper bound on establishing a TCP connection.
    pub dial_timeout: Duration,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:2379".to_string(),
            dial_timeout: Duration::from_secs(10),
        }
    }
}

/// etcd client speaking the v3 JSON gateway.
///
/// Only a connect timeout is configured on the HTTP client: the watch request
/// stays open for the lifetime of the process and a snapshot transfer takes as
/// long as the database is large.
pub struct EtcdGatewayClient {
    http: reqwest::Client,
    endpoint: String,
}

impl EtcdGatewayClient {
    /// Create a client for the given endpoint. Does not connect yet.
    pub fn new(config: &EtcdConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.dial_timeout)
            .build()?;

        Ok(Self {
            http,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
        })
    }

    /// Endpoint this client talks to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    /// Issue a POST whose response body is a frame stream.
    async fn post_stream(&self, path: &str, body: serde_json::Value) -> Result<reqwest::Response> {
        let response = self
            .http
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(format!("{} unreachable: {}", self.endpoint, e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(StoreError::Unavailable(format!(
                "{} returned {}: {}",
                path,
                status,
                text.trim()
            )));
        }

        Ok(response)
    }

    /// Stream the snapshot into `partial`, returning the number of bytes written.
    async fn stream_snapshot(&self, cancel: &CancellationToken, partial: &Path) -> Result<u64> {
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StoreError::Canceled),
            response = self.post_stream(SNAPSHOT_PATH, json!({})) => response?,
        };

        let mut file = fs::File::create(partial).await?;
        let mut chunks = response.bytes_stream();
        let mut lines = LineBuffer::default();
        let mut written = 0u64;

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StoreError::Canceled),
                chunk = chunks.next() => chunk,
            };
            let Some(chunk) = chunk else {
                break;
            };

            lines.push(&chunk?);
            while let Some(line) = lines.next_line() {
                written += write_blob(&mut file, &line).await?;
            }
        }
        if let Some(line) = lines.finish() {
            written += write_blob(&mut file, &line).await?;
        }

        if written == 0 {
            return Err(StoreError::Decode("snapshot stream carried no data".to_string()));
        }

        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }
}

#[async_trait]
impl ChangeStream for EtcdGatewayClient {
    async fn watch(&self, prefix: &str) -> Result<ChangeEvents> {
        let body = json!({
            "create_request": {
                "key": STANDARD.encode(prefix),
                "range_end": STANDARD.encode(prefix_range_end(prefix.as_bytes())),
            }
        });
        let response = self.post_stream(WATCH_PATH, body).await?;

        info!(endpoint = %self.endpoint, prefix = %prefix, "Watching etcd prefix");

        let stream = async_stream::stream! {
            let mut chunks = response.bytes_stream();
            let mut lines = LineBuffer::default();

            while let Some(chunk) = chunks.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(StoreError::Request(e));
                        return;
                    }
                };

                lines.push(&chunk);
                while let Some(line) = lines.next_line() {
                    match watch_event(&line) {
                        Ok(Some(event)) => yield Ok(event),
                        Ok(None) => {}
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl SnapshotProducer for EtcdGatewayClient {
    async fn write_snapshot(&self, cancel: &CancellationToken, dest: &Path) -> Result<()> {
        let partial = partial_path(dest);

        let written = match self.stream_snapshot(cancel, &partial).await {
            Ok(written) => written,
            Err(e) => {
                if let Err(rm) = fs::remove_file(&partial).await {
                    if rm.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %partial.display(), error = %rm, "Failed to remove partial snapshot");
                    }
                }
                return Err(e);
            }
        };

        if cancel.is_cancelled() {
            let _ = fs::remove_file(&partial).await;
            return Err(StoreError::Canceled);
        }

        fs::rename(&partial, dest).await?;
        debug!(path = %dest.display(), size = written, "Wrote etcd snapshot");
        Ok(())
    }
}

/// `snapshot.db` -> `snapshot.db.part`
fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

// ============================================================================
// Wire format
// ============================================================================

#[derive(Debug, Deserialize)]
struct Frame<T> {
    result: Option<T>,
    error: Option<GatewayError>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GatewayError {
    grpc_code: i32,
    message: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ResponseHeader {
    revision: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WatchResult {
    header: ResponseHeader,
    created: bool,
    canceled: bool,
    cancel_reason: String,
    compact_revision: Option<String>,
    events: Vec<IgnoredAny>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SnapshotResult {
    blob: String,
}

fn parse_frame<T: DeserializeOwned>(line: &[u8]) -> Result<T> {
    let frame: Frame<T> =
        serde_json::from_slice(line).map_err(|e| StoreError::Decode(e.to_string()))?;

    if let Some(err) = frame.error {
        return Err(StoreError::Unavailable(format!(
            "gateway error (grpc code {}): {}",
            err.grpc_code, err.message
        )));
    }

    frame
        .result
        .ok_or_else(|| StoreError::Decode("frame carries neither result nor error".to_string()))
}

/// Translate one watch frame. `None` for frames that carry no mutations
/// (creation acknowledgement, progress notifications).
fn watch_event(line: &[u8]) -> Result<Option<ChangeEvent>> {
    let result: WatchResult = parse_frame(line)?;

    if result.canceled {
        let reason = match &result.compact_revision {
            Some(rev) if result.cancel_reason.is_empty() => {
                format!("required revision compacted (compact revision {})", rev)
            }
            _ => result.cancel_reason.clone(),
        };
        return Err(StoreError::Unavailable(format!("watch canceled by server: {}", reason)));
    }

    if result.created || result.events.is_empty() {
        return Ok(None);
    }

    Ok(Some(ChangeEvent {
        revision: result.header.revision.as_deref().and_then(|r| r.parse().ok()),
        mutations: result.events.len(),
    }))
}

async fn write_blob(file: &mut fs::File, line: &[u8]) -> Result<u64> {
    let chunk: SnapshotResult = parse_frame(line)?;
    let blob = STANDARD
        .decode(chunk.blob.as_bytes())
        .map_err(|e| StoreError::Decode(format!("snapshot blob: {}", e)))?;
    file.write_all(&blob).await?;
    Ok(blob.len() as u64)
}

/// Splits a chunked byte stream into newline-delimited frames.
#[derive(Debug, Default)]
struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Next complete, non-blank line.
    fn next_line(&mut self) -> Option<Vec<u8>> {
        loop {
            let pos = self.buf.iter().position(|b| *b == b'\n')?;
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let trimmed = line.trim_ascii();
            if !trimmed.is_empty() {
                return Some(trimmed.to_vec());
            }
        }
    }

    /// Whatever trails the final newline once the body has ended.
    fn finish(&mut self) -> Option<Vec<u8>> {
        let rest = std::mem::take(&mut self.buf);
        let trimmed = rest.trim_ascii();
        (!trimmed.is_empty()).then(|| trimmed.to_vec())
    }
}
