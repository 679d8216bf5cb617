//! Snapshot coordination.
//!
//! `SnapshotCoordinator` turns change notifications into snapshot cycles:
//!
//! ```text
//! ChangeStream ──► Debouncer ──► run_once ──► SnapshotProducer ──► Uploader
//!                  (quiet interval)  │
//!                                    └─ cancels the attempt in flight,
//!                                       then waits for the snapshot lock
//! ```
//!
//! At most one attempt touches the snapshot file at a time. A newer attempt
//! always supersedes an older one: the older attempt is told to stop at its
//! next cancellation checkpoint, and the newer one starts as soon as the
//! older one has released the lock.

mod debounce;

pub use debounce::{DebounceMode, Debouncer};

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::store::{ChangeStream, SnapshotProducer, StoreError};
use crate::upload::{UploadError, Uploader};

/// Coarse classification of a failed cycle, used for logging and exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The store could not be reached or streamed a bad response.
    StoreUnavailable,
    /// Reading or writing the local snapshot file failed.
    LocalIo,
    /// The upload backend rejected the credentials.
    UploadAuth,
    /// The upload backend returned a non-success status or the request failed.
    UploadTransfer,
    /// The attempt was superseded by a newer one.
    Canceled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::StoreUnavailable => "store_unavailable",
            ErrorKind::LocalIo => "local_io",
            ErrorKind::UploadAuth => "upload_auth",
            ErrorKind::UploadTransfer => "upload_transfer",
            ErrorKind::Canceled => "canceled",
        };
        f.write_str(name)
    }
}

/// Errors surfaced by a snapshot cycle or by the watch loop.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Snapshot failed: {0}")]
    Store(#[from] StoreError),

    #[error("Upload failed: {0}")]
    Upload(#[from] UploadError),

    #[error("Snapshot attempt superseded")]
    Superseded,
}

impl SnapshotError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SnapshotError::Store(StoreError::Io(_)) => ErrorKind::LocalIo,
            SnapshotError::Store(StoreError::Canceled) => ErrorKind::Canceled,
            SnapshotError::Store(_) => ErrorKind::StoreUnavailable,
            SnapshotError::Upload(UploadError::Auth { .. }) => ErrorKind::UploadAuth,
            SnapshotError::Upload(UploadError::Transfer { .. })
            | SnapshotError::Upload(UploadError::Request { .. }) => ErrorKind::UploadTransfer,
            SnapshotError::Upload(UploadError::Io(_)) => ErrorKind::LocalIo,
            SnapshotError::Upload(UploadError::Canceled) => ErrorKind::Canceled,
            SnapshotError::Superseded => ErrorKind::Canceled,
        }
    }

    /// True when the attempt stopped because a newer one replaced it.
    pub fn is_canceled(&self) -> bool {
        self.kind() == ErrorKind::Canceled
    }
}

/// Result type for snapshot operations.
pub type Result<T> = std::result::Result<T, SnapshotError>;

/// Coordinator settings.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Local file every attempt writes to and uploads from.
    pub snapshot_path: PathBuf,
    /// Key prefix whose changes trigger a snapshot.
    pub prefix: String,
    /// Delay between a change and the snapshot it triggers.
    pub quiet_interval: Duration,
    pub debounce_mode: DebounceMode,
}

impl CoordinatorConfig {
    pub fn new(snapshot_path: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            snapshot_path: snapshot_path.into(),
            prefix: prefix.into(),
            quiet_interval: Duration::from_secs(1),
            debounce_mode: DebounceMode::default(),
        }
    }

    pub fn with_quiet_interval(mut self, quiet_interval: Duration) -> Self {
        self.quiet_interval = quiet_interval;
        self
    }

    pub fn with_debounce_mode(mut self, debounce_mode: DebounceMode) -> Self {
        self.debounce_mode = debounce_mode;
        self
    }
}

/// Counts of snapshot cycles by outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    /// Attempts that acquired the snapshot lock.
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    /// Attempts superseded by a newer one.
    pub canceled: u64,
}

#[derive(Default)]
struct CycleCounters {
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    canceled: AtomicU64,
}

/// Serializes snapshot-then-upload cycles for one snapshot file.
///
/// Each coordinator owns its own lock and in-flight slot, so independent
/// coordinators never interfere with each other.
pub struct SnapshotCoordinator {
    config: CoordinatorConfig,
    producer: Arc<dyn SnapshotProducer>,
    uploader: Arc<dyn Uploader>,
    /// Held for the whole write-then-upload critical section.
    snapshot_lock: Mutex<()>,
    /// Cancellation handle of the attempt holding `snapshot_lock`.
    in_flight: Mutex<Option<CancellationToken>>,
    counters: CycleCounters,
}

impl SnapshotCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        producer: Arc<dyn SnapshotProducer>,
        uploader: Arc<dyn Uploader>,
    ) -> Self {
        Self {
            config,
            producer,
            uploader,
            snapshot_lock: Mutex::new(()),
            in_flight: Mutex::new(None),
            counters: CycleCounters::default(),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Whether an attempt currently holds the snapshot lock.
    pub async fn is_in_flight(&self) -> bool {
        self.in_flight.lock().await.is_some()
    }

    pub fn stats(&self) -> CycleStats {
        CycleStats {
            started: self.counters.started.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            canceled: self.counters.canceled.load(Ordering::Relaxed),
        }
    }

    /// Take one snapshot and upload it, superseding any attempt in flight.
    ///
    /// The previous attempt is cancelled before the lock is requested, so the
    /// wait is bounded by how quickly that attempt reaches a cancellation
    /// checkpoint. A failed snapshot is never uploaded.
    pub async fn run_once(&self) -> Result<()> {
        if let Some(previous) = self.in_flight.lock().await.as_ref() {
            debug!("Canceling in-flight snapshot attempt");
            previous.cancel();
        }

        let _snapshot_guard = self.snapshot_lock.lock().await;

        let cancel = CancellationToken::new();
        *self.in_flight.lock().await = Some(cancel.clone());
        self.counters.started.fetch_add(1, Ordering::Relaxed);

        let started = Instant::now();
        let result = self.snapshot_and_upload(&cancel).await;

        // Cleared before the lock is released.
        *self.in_flight.lock().await = None;

        match &result {
            Ok(()) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                info!(
                    path = %self.config.snapshot_path.display(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Snapshot uploaded"
                );
            }
            Err(e) if e.is_canceled() => {
                self.counters.canceled.fetch_add(1, Ordering::Relaxed);
                info!(error = %e, "Snapshot attempt superseded by a newer change");
            }
            Err(_) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    async fn snapshot_and_upload(&self, cancel: &CancellationToken) -> Result<()> {
        let path = &self.config.snapshot_path;

        self.producer.write_snapshot(cancel, path).await?;
        debug!(path = %path.display(), "Snapshot written");

        if cancel.is_cancelled() {
            return Err(SnapshotError::Superseded);
        }

        self.uploader.upload(cancel, path).await?;
        Ok(())
    }

    /// Take one snapshot, then watch until the change stream ends.
    ///
    /// A failed first cycle is returned without subscribing to changes.
    pub async fn run(self: &Arc<Self>, changes: &dyn ChangeStream) -> Result<()> {
        if let Err(e) = self.run_once().await {
            error!(kind = %e.kind(), error = %e, "Initial snapshot failed");
            return Err(e);
        }
        self.watch(changes).await
    }

    /// Watch the configured prefix and run a cycle after each quiet interval.
    ///
    /// Cycle failures are logged and do not stop watching. Returns when the
    /// change stream ends or fails; the stream is not re-established.
    pub async fn watch(self: &Arc<Self>, changes: &dyn ChangeStream) -> Result<()> {
        let mut events = changes.watch(&self.config.prefix).await?;
        let mut debouncer = Debouncer::new(self.config.debounce_mode, self.config.quiet_interval);

        info!(
            prefix = %self.config.prefix,
            quiet_interval_ms = self.config.quiet_interval.as_millis() as u64,
            debounce_mode = ?debouncer.mode(),
            "Watching for changes"
        );

        loop {
            match events.next().await {
                Some(Ok(event)) => {
                    debug!(
                        revision = ?event.revision,
                        mutations = event.mutations,
                        "Change detected"
                    );
                    let coordinator = Arc::clone(self);
                    debouncer.schedule(move || async move {
                        if let Err(e) = coordinator.run_once().await {
                            if !e.is_canceled() {
                                error!(kind = %e.kind(), error = %e, "Snapshot cycle failed");
                            }
                        }
                    });
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Change stream failed, stopping watch");
                    return Err(e.into());
                }
                None => {
                    warn!("Change stream closed, stopping watch");
                    return Err(StoreError::StreamClosed.into());
                }
            }
        }
    }
}
