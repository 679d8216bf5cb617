//! Durable upload of the local snapshot file.
//!
//! ## Backends
//!
//! - `B2Uploader` - Backblaze B2 native API (authorize, get upload URL, upload)
//! - `FilesystemUploader` - Local or mounted directory
//! - `MockUploader` - In-memory recorder for tests
//!
//! No backend retries internally. A failed upload surfaces the error of the
//! step that failed; the configured retry interval is only exposed to callers
//! through `Uploader::retry_interval`.

mod b2;
mod config;
mod filesystem;
pub mod mock;

pub use b2::B2Uploader;
pub use config::{
    B2Config, FilesystemUploadConfig, UploadConfig, UploaderType, DEFAULT_B2_API_URL,
};
pub use filesystem::FilesystemUploader;
pub use mock::{MockUploader, RecordedUpload};

use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// The dependent steps of one upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStep {
    /// Exchange account credentials for an API token.
    Authorize,
    /// Obtain a write target for the object.
    GetUploadUrl,
    /// Transfer the file bytes with their checksum.
    UploadFile,
}

impl fmt::Display for UploadStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UploadStep::Authorize => "Authorize account",
            UploadStep::GetUploadUrl => "Get upload URL",
            UploadStep::UploadFile => "Upload file",
        };
        f.write_str(name)
    }
}

/// Errors that can occur during an upload.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("{step} rejected credentials: status code {status}")]
    Auth { step: UploadStep, status: u16 },

    #[error("{step} status code: {status}")]
    Transfer { step: UploadStep, status: u16 },

    #[error("{step} request failed: {source}")]
    Request {
        step: UploadStep,
        #[source]
        source: reqwest::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Upload canceled")]
    Canceled,
}

impl UploadError {
    /// Classify a non-success HTTP status returned by `step`.
    pub fn from_status(step: UploadStep, status: u16) -> Self {
        match status {
            401 | 403 => UploadError::Auth { step, status },
            _ => UploadError::Transfer { step, status },
        }
    }

    /// The step that failed, if the error came from a remote step.
    pub fn step(&self) -> Option<UploadStep> {
        match self {
            UploadError::Auth { step, .. }
            | UploadError::Transfer { step, .. }
            | UploadError::Request { step, .. } => Some(*step),
            UploadError::Io(_) | UploadError::Canceled => None,
        }
    }
}

/// Result type for upload operations.
pub type Result<T> = std::result::Result<T, UploadError>;

/// Durable remote storage for the snapshot file.
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Store the contents of `path` remotely.
    ///
    /// The file is final when this is called. Cancellation is cooperative:
    /// implementations stop at their next await point once `cancel` fires and
    /// return `UploadError::Canceled`, but a transfer that already completed
    /// is not rolled back.
    async fn upload(&self, cancel: &CancellationToken, path: &Path) -> Result<()>;

    /// Suggested delay before a caller retries a failed upload.
    ///
    /// Purely advisory; nothing in this crate acts on it.
    fn retry_interval(&self) -> Duration {
        Duration::ZERO
    }
}

/// Run `fut` unless `cancel` fires first.
pub(crate) async fn cancellable<F: Future>(cancel: &CancellationToken, fut: F) -> Result<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(UploadError::Canceled),
        output = fut => Ok(output),
    }
}

/// Compute SHA-256 hash of a payload.
pub fn compute_hash(payload: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.finalize().to_vec()
}

/// Format hash as hex string.
pub fn hash_to_hex(hash: &[u8]) -> String {
    hex::encode(hash)
}

// ============================================================================
// Factory
// ============================================================================

/// Initialize the uploader selected by configuration.
pub async fn init_uploader(config: &UploadConfig) -> Result<Arc<dyn Uploader>> {
    use tracing::info;

    match config.uploader_type {
        UploaderType::B2 => {
            info!(
                bucket_id = %config.b2.bucket_id,
                object = %config.b2.object,
                api_url = %config.b2.api_url,
                "Uploader: b2"
            );
            let uploader = B2Uploader::new(config.b2.clone()).map_err(|source| {
                UploadError::Request {
                    step: UploadStep::Authorize,
                    source,
                }
            })?;
            Ok(Arc::new(uploader))
        }
        UploaderType::Filesystem => {
            info!(
                dir = %config.filesystem.dir.display(),
                object = %config.filesystem.object,
                "Uploader: filesystem"
            );
            let uploader = FilesystemUploader::new(config.filesystem.clone()).await?;
            Ok(Arc::new(uploader))
        }
    }
}
