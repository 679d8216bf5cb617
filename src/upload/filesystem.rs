//! Filesystem-based snapshot upload.
//!
//! Copies the snapshot into a destination directory:
//! ```text
//! {dir}/
//!   {object}          snapshot bytes
//!   {object}.sha256   hex SHA-256 of the snapshot
//! ```
//!
//! The copy is written to a temp file and renamed into place, so readers of
//! `{object}` never observe a half-written snapshot.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    cancellable, compute_hash, hash_to_hex, FilesystemUploadConfig, Result, UploadError, Uploader,
};

/// Uploader that ships the snapshot to a local or mounted directory.
pub struct FilesystemUploader {
    dir: PathBuf,
    object: String,
}

impl FilesystemUploader {
    /// Create a new filesystem uploader.
    ///
    /// Creates the destination directory if it doesn't exist.
    pub async fn new(config: FilesystemUploadConfig) -> Result<Self> {
        fs::create_dir_all(&config.dir).await?;
        Ok(Self {
            dir: config.dir,
            object: config.object,
        })
    }

    /// Path the snapshot lands at.
    pub fn object_path(&self) -> PathBuf {
        self.dir.join(&self.object)
    }

    fn checksum_path(&self) -> PathBuf {
        self.dir.join(format!("{}.sha256", self.object))
    }
}

#[async_trait]
impl Uploader for FilesystemUploader {
    async fn upload(&self, cancel: &CancellationToken, path: &Path) -> Result<()> {
        let data = cancellable(cancel, fs::read(path)).await??;
        let hash = hash_to_hex(&compute_hash(&data));

        let target = self.object_path();
        let temp_path = temp_path(&target);
        cancellable(cancel, fs::write(&temp_path, &data)).await??;

        if cancel.is_cancelled() {
            let _ = fs::remove_file(&temp_path).await;
            return Err(UploadError::Canceled);
        }

        fs::rename(&temp_path, &target).await?;
        fs::write(self.checksum_path(), format!("{}  {}\n", hash, self.object)).await?;

        debug!(
            path = %target.display(),
            size = data.len(),
            sha256 = %hash,
            "Stored snapshot"
        );
        Ok(())
    }
}

/// `{target}.tmp`, next to the target and never equal to it.
fn temp_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}
