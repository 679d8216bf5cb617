//! etcd-snapper - coalescing etcd snapshot backups
//!
//! Watches a key prefix in etcd and, once changes settle, writes a snapshot of
//! the whole store to a local file and ships it to Backblaze B2 (or a
//! directory). Bursts of changes collapse into one snapshot; a newer change
//! supersedes a snapshot that is still in progress.
//!
//! ## Modules
//! - `store` - change stream and snapshot producer (etcd gateway, mocks)
//! - `upload` - durable upload of the snapshot file (B2, filesystem, mock)
//! - `snapshot` - the coordinator that ties them together
//! - `config` - file and environment configuration

pub mod config;
pub mod snapshot;
pub mod store;
pub mod upload;
pub mod utils;
