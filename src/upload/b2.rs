//! Backblaze B2 uploader.
//!
//! Uses the B2 native API in three dependent steps:
//! ```text
//! GET  {api_url}/b2api/v1/b2_authorize_account   (HTTP basic auth)
//! POST {apiUrl}/b2api/v1/b2_get_upload_url        {"bucketId": ...}
//! POST {uploadUrl}                                 file bytes + SHA-1
//! ```
//!
//! A failing step aborts the rest and surfaces its own error. Nothing is
//! retried here.

use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use sha1::{Digest, Sha1};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{cancellable, B2Config, Result, UploadError, UploadStep, Uploader};

const AUTHORIZE_ACCOUNT_PATH: &str = "/b2api/v1/b2_authorize_account";
const GET_UPLOAD_URL_PATH: &str = "/b2api/v1/b2_get_upload_url";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizeAccountResponse {
    authorization_token: String,
    api_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetUploadUrlResponse {
    upload_url: String,
    authorization_token: String,
}

/// Uploads the snapshot to a Backblaze B2 bucket under a fixed object name.
pub struct B2Uploader {
    config: B2Config,
    http: reqwest::Client,
}

impl B2Uploader {
    /// Create a new B2 uploader. No request is made until `upload`.
    pub fn new(config: B2Config) -> reqwest::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()?;
        Ok(Self { config, http })
    }

    fn basic_auth(&self) -> String {
        let id_and_key = format!("{}:{}", self.config.application_id, self.config.application_key);
        format!("Basic {}", STANDARD.encode(id_and_key))
    }

    async fn authorize_account(&self, cancel: &CancellationToken) -> Result<AuthorizeAccountResponse> {
        let step = UploadStep::Authorize;
        let url = format!(
            "{}{}",
            self.config.api_url.trim_end_matches('/'),
            AUTHORIZE_ACCOUNT_PATH
        );
        let request = self
            .http
            .get(url)
            .header(reqwest::header::AUTHORIZATION, self.basic_auth());

        let response = send(cancel, step, request).await?;
        decode(cancel, step, response).await
    }

    async fn get_upload_url(
        &self,
        cancel: &CancellationToken,
        account: &AuthorizeAccountResponse,
    ) -> Result<GetUploadUrlResponse> {
        let step = UploadStep::GetUploadUrl;
        let url = format!(
            "{}{}",
            account.api_url.trim_end_matches('/'),
            GET_UPLOAD_URL_PATH
        );
        let request = self
            .http
            .post(url)
            .header(reqwest::header::AUTHORIZATION, &account.authorization_token)
            .json(&json!({ "bucketId": self.config.bucket_id }));

        let response = send(cancel, step, request).await?;
        decode(cancel, step, response).await
    }

    async fn upload_file(
        &self,
        cancel: &CancellationToken,
        target: &GetUploadUrlResponse,
        data: Vec<u8>,
    ) -> Result<()> {
        let step = UploadStep::UploadFile;
        let request = self
            .http
            .post(&target.upload_url)
            .header(reqwest::header::AUTHORIZATION, &target.authorization_token)
            .header("X-Bz-File-Name", encode_file_name(&self.config.object))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .header("X-Bz-Content-Sha1", sha1_hex(&data))
            .body(data);

        let response = send(cancel, step, request).await?;
        // B2 has stored the file once it answers 200; a cancel after this
        // point must not turn the upload into a failure. The drain only lets
        // the connection be reused and is bounded by the HTTP timeout.
        let _ = response.bytes().await;
        Ok(())
    }
}

#[async_trait]
impl Uploader for B2Uploader {
    async fn upload(&self, cancel: &CancellationToken, path: &Path) -> Result<()> {
        let started = Instant::now();
        let data = cancellable(cancel, fs::read(path)).await??;
        let size = data.len();

        let account = self.authorize_account(cancel).await?;
        let target = self.get_upload_url(cancel, &account).await?;
        self.upload_file(cancel, &target, data).await?;

        debug!(
            object = %self.config.object,
            bucket_id = %self.config.bucket_id,
            size,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Uploaded snapshot to B2"
        );
        Ok(())
    }

    fn retry_interval(&self) -> Duration {
        self.config.retry_interval
    }
}

/// Send `request`, mapping transport errors and non-200 statuses onto `step`.
async fn send(
    cancel: &CancellationToken,
    step: UploadStep,
    request: reqwest::RequestBuilder,
) -> Result<reqwest::Response> {
    let response = cancellable(cancel, request.send())
        .await?
        .map_err(|source| UploadError::Request { step, source })?;

    let status = response.status();
    if status != reqwest::StatusCode::OK {
        return Err(UploadError::from_status(step, status.as_u16()));
    }
    Ok(response)
}

async fn decode<T: serde::de::DeserializeOwned>(
    cancel: &CancellationToken,
    step: UploadStep,
    response: reqwest::Response,
) -> Result<T> {
    cancellable(cancel, response.json::<T>())
        .await?
        .map_err(|source| UploadError::Request { step, source })
}

/// Hex SHA-1 of the payload, as `X-Bz-Content-Sha1` expects.
fn sha1_hex(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// B2 file names travel percent-encoded in `X-Bz-File-Name`; `/` stays literal.
fn encode_file_name(name: &str) -> String {
    name.split('/')
        .map(|segment| url::form_urlencoded::byte_serialize(segment.as_bytes()).collect::<String>())
        .collect::<Vec<_>>()
        .join("/")
}
