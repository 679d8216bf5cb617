//! Mock uploader implementation for testing.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{Result, UploadError, UploadStep, Uploader};

/// One successful call to `MockUploader::upload`.
#[derive(Debug, Clone)]
pub struct RecordedUpload {
    pub path: PathBuf,
    pub contents: Vec<u8>,
    pub at: Instant,
}

/// Uploader that records what it was asked to ship.
#[derive(Default)]
pub struct MockUploader {
    uploads: RwLock<Vec<RecordedUpload>>,
    attempts: RwLock<usize>,
    delay: RwLock<Duration>,
    fail_status: RwLock<Option<(UploadStep, u16)>>,
    retry_interval: Duration,
}

impl MockUploader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: RwLock::new(delay),
            ..Self::default()
        }
    }

    pub fn with_retry_interval(retry_interval: Duration) -> Self {
        Self {
            retry_interval,
            ..Self::default()
        }
    }

    pub async fn set_delay(&self, delay: Duration) {
        *self.delay.write().await = delay;
    }

    /// Make every upload fail at `step` with the given HTTP status.
    pub async fn set_fail_status(&self, failure: Option<(UploadStep, u16)>) {
        *self.fail_status.write().await = failure;
    }

    /// Number of calls to `upload`, successful or not.
    pub async fn attempt_count(&self) -> usize {
        *self.attempts.read().await
    }

    pub async fn upload_count(&self) -> usize {
        self.uploads.read().await.len()
    }

    pub async fn uploads(&self) -> Vec<RecordedUpload> {
        self.uploads.read().await.clone()
    }
}

#[async_trait]
impl Uploader for MockUploader {
    async fn upload(&self, cancel: &CancellationToken, path: &Path) -> Result<()> {
        *self.attempts.write().await += 1;

        let contents = tokio::fs::read(path).await?;

        let delay = *self.delay.read().await;
        if !delay.is_zero() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(UploadError::Canceled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if cancel.is_cancelled() {
            return Err(UploadError::Canceled);
        }

        if let Some((step, status)) = *self.fail_status.read().await {
            return Err(UploadError::from_status(step, status));
        }

        self.uploads.write().await.push(RecordedUpload {
            path: path.to_path_buf(),
            contents,
            at: Instant::now(),
        });
        Ok(())
    }

    fn retry_interval(&self) -> Duration {
        self.retry_interval
    }
}
