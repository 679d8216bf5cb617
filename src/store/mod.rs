//! Watched key-value store capabilities.
//!
//! The coordinator consumes the store through two narrow traits:
//! - `ChangeStream`: "something under this prefix changed" notifications
//! - `SnapshotProducer`: write a point-in-time copy of the store to a path
//!
//! ## Implementations
//!
//! - `EtcdGatewayClient` - etcd v3 JSON gateway over HTTP (both traits)
//! - `MockChangeStream` / `MockSnapshotProducer` - in-memory stand-ins

pub mod etcd;
pub mod mock;

pub use etcd::{EtcdConfig, EtcdGatewayClient};
pub use mock::{MockChangeSender, MockChangeStream, MockSnapshotProducer, WriteInterval};

use std::path::Path;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Errors that can occur while talking to the watched store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Malformed store response: {0}")]
    Decode(String),

    #[error("Snapshot file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Change stream closed")]
    StreamClosed,

    #[error("Snapshot canceled")]
    Canceled,
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// A single "keys under the prefix changed" notification.
///
/// The coordinator only cares that the event exists; the fields are carried
/// for logging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Store revision reported with the change, if known.
    pub revision: Option<i64>,
    /// Number of key mutations folded into this notification.
    pub mutations: usize,
}

/// Stream of change notifications. Ends when the subscription is lost.
pub type ChangeEvents = BoxStream<'static, Result<ChangeEvent>>;

/// Subscription to mutations under a key prefix.
#[async_trait]
pub trait ChangeStream: Send + Sync {
    /// Subscribe to changes of every key starting with `prefix`.
    ///
    /// The returned stream is unbounded. It ends (or yields an error) only
    /// when the underlying subscription is permanently lost; callers do not
    /// get automatic reconnection.
    async fn watch(&self, prefix: &str) -> Result<ChangeEvents>;
}

/// Writes a consistent copy of the full store state to a local file.
///
/// Cancellation is cooperative: implementations check `cancel` at I/O
/// boundaries and return `StoreError::Canceled` when they observe it, but may
/// finish work that was already past its last checkpoint.
#[async_trait]
pub trait SnapshotProducer: Send + Sync {
    /// Write the snapshot to `dest`, replacing any previous contents.
    ///
    /// On failure the previous contents of `dest` may or may not survive.
    async fn write_snapshot(&self, cancel: &CancellationToken, dest: &Path) -> Result<()>;
}

/// Compute the exclusive range end covering every key with `prefix`.
///
/// Mirrors etcd's prefix semantics: the last byte below 0xff is incremented
/// and everything after it dropped. A prefix made only of 0xff bytes (or an
/// empty prefix) has no upper bound, which etcd spells as a single NUL byte.
pub fn prefix_range_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.last_mut() {
        if *last < 0xff {
            *last += 1;
            return end;
        }
        end.pop();
    }
    vec![0]
}
