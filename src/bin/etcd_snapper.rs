//! etcd-snapper: watch an etcd prefix and back up coalesced snapshots
//!
//! ## Architecture
//! ```text
//! [etcd /v3/watch] -> [SnapshotCoordinator] -> [etcd /v3/maintenance/snapshot]
//!                              |                        |
//!                              |                        v
//!                              +-------------> [SNAPSHOT_PATH] -> [B2 bucket]
//! ```
//!
//! ## Configuration
//! - ESB_ETCD_ENDPOINT / ESB_ETCD_PREFIX: store and prefix to watch
//! - ESB_B2_*: Backblaze credentials, bucket and object name
//! - ESB_WAIT_FOR_CHANGES_INTERVAL: quiet interval in milliseconds
//! - ESB_CONFIG: optional YAML file with the same keys
//! - ESB_LOG: tracing filter (default "info")
//!
//! One snapshot is taken and uploaded at startup; failure there is fatal.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use etcd_snapper::config::Config;
use etcd_snapper::snapshot::SnapshotCoordinator;
use etcd_snapper::store::EtcdGatewayClient;
use etcd_snapper::upload::init_uploader;
use etcd_snapper::utils::bootstrap::{init_tracing, shutdown_signal};

#[derive(Parser, Debug)]
#[command(name = "etcd-snapper", version, about = "Coalescing etcd snapshot backups")]
struct Args {
    /// Local file each snapshot is written to before upload.
    snapshot_path: PathBuf,

    /// YAML configuration file.
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let args = Args::parse();

    let config = Config::load(args.config.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        endpoint = %config.etcd.endpoint,
        prefix = %config.prefix,
        snapshot_path = %args.snapshot_path.display(),
        "Starting etcd-snapper"
    );

    let etcd = Arc::new(EtcdGatewayClient::new(&config.etcd)?);
    let uploader = init_uploader(&config.upload).await?;
    let coordinator = Arc::new(SnapshotCoordinator::new(
        config.coordinator_config(&args.snapshot_path),
        etcd.clone(),
        uploader,
    ));

    let result = tokio::select! {
        result = coordinator.run(etcd.as_ref()) => result,
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            Ok(())
        }
    };

    let stats = coordinator.stats();
    info!(
        started = stats.started,
        completed = stats.completed,
        failed = stats.failed,
        canceled = stats.canceled,
        "Snapshot cycles"
    );

    if let Err(e) = result {
        warn!(error = %e, "Stopped watching");
        return Err(e.into());
    }
    Ok(())
}
