//! Application configuration.
//!
//! Flat keys loaded from an optional YAML file and `ESB_`-prefixed
//! environment variables, then validated into typed per-module configs.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::snapshot::{CoordinatorConfig, DebounceMode};
use crate::store::EtcdConfig;
use crate::upload::{
    B2Config, FilesystemUploadConfig, UploadConfig, UploaderType, DEFAULT_B2_API_URL,
};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "etcd-snapper.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "ESB_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "ESB";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "ESB_LOG";

const DEFAULT_DIAL_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_HTTP_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_FILESYSTEM_OBJECT: &str = "etcd-snapshot.db";

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration: {0}")]
    Source(#[from] ::config::ConfigError),

    #[error("Missing required configuration key: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Result type for configuration loading.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Keys as they appear in files and the environment, before validation.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawConfig {
    etcd_endpoint: Option<String>,
    etcd_prefix: Option<String>,
    etcd_dial_timeout_ms: Option<u64>,
    uploader: UploaderType,
    upload_dir: Option<PathBuf>,
    b2_application_id: Option<String>,
    b2_application_key: Option<String>,
    b2_bucket_id: Option<String>,
    b2_object: Option<String>,
    b2_upload_retry_interval: Option<u64>,
    b2_api_url: Option<String>,
    http_timeout_ms: Option<u64>,
    wait_for_changes_interval: Option<u64>,
    debounce_mode: DebounceMode,
}

/// Validated application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub etcd: EtcdConfig,
    /// Key prefix to watch.
    pub prefix: String,
    pub upload: UploadConfig,
    /// Quiet interval between a change and the snapshot it triggers.
    pub quiet_interval: Duration,
    pub debounce_mode: DebounceMode,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `etcd-snapper.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self> {
        let env_file = std::env::var(CONFIG_ENV_VAR).ok();
        Self::load_from(path, env_file.as_deref(), None)
    }

    /// Like `load`, but reads prefixed variables from `env` instead of the
    /// process environment when given.
    fn load_from(
        path: Option<&str>,
        env_file: Option<&str>,
        env: Option<::config::Map<String, String>>,
    ) -> Result<Self> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }
        if let Some(config_path) = env_file {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        let raw: RawConfig = builder
            // Values stay strings; numeric fields are parsed on deserialize.
            .add_source(Environment::with_prefix(CONFIG_ENV_PREFIX).source(env))
            .build()?
            .try_deserialize()?;

        raw.validate()
    }

    /// Coordinator settings for a snapshot written to `snapshot_path`.
    pub fn coordinator_config(&self, snapshot_path: impl Into<PathBuf>) -> CoordinatorConfig {
        CoordinatorConfig::new(snapshot_path, self.prefix.clone())
            .with_quiet_interval(self.quiet_interval)
            .with_debounce_mode(self.debounce_mode)
    }
}

impl RawConfig {
    fn validate(self) -> Result<Config> {
        let endpoint = normalize_endpoint(&required("etcd_endpoint", self.etcd_endpoint)?)?;
        let prefix = required("etcd_prefix", self.etcd_prefix)?;

        let wait_ms = self
            .wait_for_changes_interval
            .ok_or(ConfigError::Missing("wait_for_changes_interval"))?;
        if wait_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "wait_for_changes_interval",
                reason: "must be greater than zero".to_string(),
            });
        }

        let etcd = EtcdConfig {
            endpoint,
            dial_timeout: Duration::from_millis(
                self.etcd_dial_timeout_ms.unwrap_or(DEFAULT_DIAL_TIMEOUT_MS),
            ),
        };
        let http_timeout =
            Duration::from_millis(self.http_timeout_ms.unwrap_or(DEFAULT_HTTP_TIMEOUT_MS));

        let upload = match self.uploader {
            UploaderType::B2 => UploadConfig {
                uploader_type: UploaderType::B2,
                b2: B2Config {
                    application_id: required("b2_application_id", self.b2_application_id)?,
                    application_key: required("b2_application_key", self.b2_application_key)?,
                    bucket_id: required("b2_bucket_id", self.b2_bucket_id)?,
                    object: required("b2_object", self.b2_object)?,
                    retry_interval: Duration::from_millis(
                        self.b2_upload_retry_interval
                            .ok_or(ConfigError::Missing("b2_upload_retry_interval"))?,
                    ),
                    api_url: self
                        .b2_api_url
                        .filter(|url| !url.is_empty())
                        .unwrap_or_else(|| DEFAULT_B2_API_URL.to_string()),
                    http_timeout,
                },
                filesystem: FilesystemUploadConfig::default(),
            },
            UploaderType::Filesystem => UploadConfig {
                uploader_type: UploaderType::Filesystem,
                b2: B2Config::default(),
                filesystem: FilesystemUploadConfig {
                    dir: self.upload_dir.ok_or(ConfigError::Missing("upload_dir"))?,
                    object: self
                        .b2_object
                        .filter(|object| !object.is_empty())
                        .unwrap_or_else(|| DEFAULT_FILESYSTEM_OBJECT.to_string()),
                },
            },
        };

        Ok(Config {
            etcd,
            prefix,
            upload,
            quiet_interval: Duration::from_millis(wait_ms),
            debounce_mode: self.debounce_mode,
        })
    }
}

/// Empty values count as unset.
fn required(key: &'static str, value: Option<String>) -> Result<String> {
    value
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::Missing(key))
}

/// Accept `host:port` as shorthand for `http://host:port`.
fn normalize_endpoint(endpoint: &str) -> Result<String> {
    let endpoint = if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("http://{}", endpoint)
    };

    url::Url::parse(&endpoint).map_err(|e| ConfigError::Invalid {
        key: "etcd_endpoint",
        reason: e.to_string(),
    })?;
    Ok(endpoint)
}
