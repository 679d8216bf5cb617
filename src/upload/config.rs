//! Uploader configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Default B2 API base URL used for account authorization.
pub const DEFAULT_B2_API_URL: &str = "https://api.backblazeb2.com";

/// Uploader backend discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploaderType {
    /// Backblaze B2 native API.
    #[default]
    B2,
    /// Local or mounted directory.
    Filesystem,
}

/// Configuration for the snapshot uploader.
#[derive(Debug, Clone, Default)]
pub struct UploadConfig {
    /// Which backend receives the snapshot.
    pub uploader_type: UploaderType,

    /// B2 configuration, used when `uploader_type` is `B2`.
    pub b2: B2Config,

    /// Filesystem configuration, used when `uploader_type` is `Filesystem`.
    pub filesystem: FilesystemUploadConfig,
}

/// Backblaze B2 uploader configuration.
#[derive(Clone)]
pub struct B2Config {
    /// Application key ID.
    pub application_id: String,
    /// Application key secret.
    pub application_key: String,
    /// Destination bucket ID.
    pub bucket_id: String,
    /// Object (file) name the snapshot is stored under.
    pub object: String,
    /// Advisory delay before retrying a failed upload.
    pub retry_interval: Duration,
    /// Base URL for `b2_authorize_account`.
    pub api_url: String,
    /// Per-request HTTP timeout.
    pub http_timeout: Duration,
}

impl Default for B2Config {
    fn default() -> Self {
        Self {
            application_id: String::new(),
            application_key: String::new(),
            bucket_id: String::new(),
            object: String::new(),
            retry_interval: Duration::ZERO,
            api_url: DEFAULT_B2_API_URL.to_string(),
            http_timeout: Duration::from_secs(10),
        }
    }
}

// Keeps the application key out of logs.
impl std::fmt::Debug for B2Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("B2Config")
            .field("application_id", &self.application_id)
            .field("application_key", &"<redacted>")
            .field("bucket_id", &self.bucket_id)
            .field("object", &self.object)
            .field("retry_interval", &self.retry_interval)
            .field("api_url", &self.api_url)
            .field("http_timeout", &self.http_timeout)
            .finish()
    }
}

/// Filesystem uploader configuration.
#[derive(Debug, Clone)]
pub struct FilesystemUploadConfig {
    /// Directory receiving the uploaded snapshot.
    pub dir: PathBuf,
    /// File name inside `dir`.
    pub object: String,
}

impl Default for FilesystemUploadConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/etcd-snapper/uploads"),
            object: "etcd-snapshot.db".to_string(),
        }
    }
}
