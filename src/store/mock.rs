//! In-memory store stand-ins for testing.

use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use super::{ChangeEvent, ChangeEvents, ChangeStream, Result, SnapshotProducer, StoreError};

/// Change stream fed by a `MockChangeSender`.
///
/// Supports a single subscription. The stream ends once every sender has
/// been dropped.
pub struct MockChangeStream {
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Result<ChangeEvent>>>>,
    prefixes: RwLock<Vec<String>>,
}

/// Producer side of a `MockChangeStream`.
#[derive(Clone)]
pub struct MockChangeSender {
    sender: mpsc::UnboundedSender<Result<ChangeEvent>>,
    revision: Arc<AtomicI64>,
}

impl MockChangeStream {
    pub fn new() -> (Self, MockChangeSender) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let stream = Self {
            receiver: Mutex::new(Some(receiver)),
            prefixes: RwLock::new(Vec::new()),
        };
        let sender = MockChangeSender {
            sender,
            revision: Arc::new(AtomicI64::new(1)),
        };
        (stream, sender)
    }

    /// Prefixes passed to `watch`, in call order.
    pub async fn watched_prefixes(&self) -> Vec<String> {
        self.prefixes.read().await.clone()
    }
}

impl MockChangeSender {
    /// Emit one change notification. Returns false if nobody is listening.
    pub fn notify(&self) -> bool {
        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        self.sender
            .send(Ok(ChangeEvent {
                revision: Some(revision),
                mutations: 1,
            }))
            .is_ok()
    }

    /// Emit a stream error, as a lost subscription would.
    pub fn fail(&self, error: StoreError) -> bool {
        self.sender.send(Err(error)).is_ok()
    }
}

#[async_trait]
impl ChangeStream for MockChangeStream {
    async fn watch(&self, prefix: &str) -> Result<ChangeEvents> {
        let receiver = self.receiver.lock().await.take().ok_or_else(|| {
            StoreError::Unavailable("mock change stream already subscribed".to_string())
        })?;
        self.prefixes.write().await.push(prefix.to_string());
        Ok(Box::pin(UnboundedReceiverStream::new(receiver)))
    }
}

/// Wall-clock span of one completed snapshot write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteInterval {
    pub started: Instant,
    pub finished: Instant,
}

impl WriteInterval {
    pub fn overlaps(&self, other: &WriteInterval) -> bool {
        self.started < other.finished && other.started < self.finished
    }
}

/// Snapshot producer that writes a small marker file.
///
/// Each write lays down a partial marker, sleeps for the configured delay
/// (observing cancellation), then writes `snapshot {n}` where `n` is the
/// 1-based call number.
#[derive(Default)]
pub struct MockSnapshotProducer {
    write_delay: RwLock<Duration>,
    fail_on_write: RwLock<bool>,
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    writes: RwLock<Vec<WriteInterval>>,
}

impl MockSnapshotProducer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_write_delay(delay: Duration) -> Self {
        Self {
            write_delay: RwLock::new(delay),
            ..Self::default()
        }
    }

    pub async fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.write().await = delay;
    }

    pub async fn set_fail_on_write(&self, fail: bool) {
        *self.fail_on_write.write().await = fail;
    }

    /// Number of times `write_snapshot` was entered.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of writes observed in progress at the same time.
    pub fn max_concurrent_writes(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// Completed writes, in completion order.
    pub async fn completed_writes(&self) -> Vec<WriteInterval> {
        self.writes.read().await.clone()
    }
}

#[async_trait]
impl SnapshotProducer for MockSnapshotProducer {
    async fn write_snapshot(&self, cancel: &CancellationToken, dest: &Path) -> Result<()> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

        if *self.fail_on_write.read().await {
            return Err(StoreError::Unavailable("Mock snapshot failure".to_string()));
        }

        let started = Instant::now();
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        let result = self.write_marker(cancel, dest, n).await;

        self.active.fetch_sub(1, Ordering::SeqCst);
        if result.is_ok() {
            self.writes.write().await.push(WriteInterval {
                started,
                finished: Instant::now(),
            });
        }
        result
    }
}

impl MockSnapshotProducer {
    async fn write_marker(&self, cancel: &CancellationToken, dest: &Path, n: usize) -> Result<()> {
        tokio::fs::write(dest, format!("snapshot {} (partial)", n)).await?;

        let delay = *self.write_delay.read().await;
        if !delay.is_zero() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StoreError::Canceled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if cancel.is_cancelled() {
            return Err(StoreError::Canceled);
        }

        tokio::fs::write(dest, format!("snapshot {}", n)).await?;
        Ok(())
    }
}
