/// Engine configuration
///
/// Defaults mirror the production deployment: a 50MB buffer pool over a
/// remote page store with a 5 second per-call timeout. Values can be loaded
/// from a JSON file and overridden from the environment.

use std::env;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PageKvError, Result};
use crate::page::{MAX_RECORD_PAYLOAD, PAGE_SIZE};

const DEFAULT_BUFFER_POOL_BYTES: usize = 50 * 1024 * 1024; // 12,800 frames

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Memory budget for cached pages, in bytes
    pub buffer_pool_bytes: usize,
    /// Per-call deadline for remote reads, writes and log appends
    pub io_timeout_ms: u64,
    /// Extra attempts for idempotent block reads/writes. WAL appends are never retried.
    pub io_retries: u32,
    pub retry_backoff_ms: u64,
    pub max_key_size: usize,
    /// Number of per-key mutation locks
    pub key_lock_stripes: usize,
    /// Artificial latency for the in-memory backends
    pub simulated_latency_ms: u64,
    pub azure: AzureConfig,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AzureConfig {
    #[serde(skip_serializing)]
    pub connection_string: Option<String>,
    pub container_name: String,
    pub data_blob_name: String,
    pub wal_blob_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            buffer_pool_bytes: DEFAULT_BUFFER_POOL_BYTES,
            io_timeout_ms: 5_000,
            io_retries: 2,
            retry_backoff_ms: 50,
            max_key_size: 256,
            key_lock_stripes: 64,
            simulated_latency_ms: 0,
            azure: AzureConfig::default(),
        }
    }
}

impl Default for AzureConfig {
    fn default() -> Self {
        Self {
            connection_string: None,
            container_name: "pagekv-data".to_string(),
            data_blob_name: "db-pages".to_string(),
            wal_blob_name: "db-wal".to_string(),
        }
    }
}

impl fmt::Debug for AzureConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureConfig")
            .field(
                "connection_string",
                &self.connection_string.as_ref().map(|_| "<redacted>"),
            )
            .field("container_name", &self.container_name)
            .field("data_blob_name", &self.data_blob_name)
            .field("wal_blob_name", &self.wal_blob_name)
            .finish()
    }
}

impl Config {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| PageKvError::ConfigError(format!("invalid config JSON: {}", e)))
    }

    /// Load from `PAGEKV_CONFIG` (a JSON file) if set, then apply `PAGEKV_*`
    /// overrides and `AZURE_STORAGE_CONNECTION_STRING`.
    pub fn from_env() -> Result<Self> {
        let mut config = match env::var("PAGEKV_CONFIG") {
            Ok(path) => {
                let json = std::fs::read_to_string(&path).map_err(|e| {
                    PageKvError::ConfigError(format!("cannot read {}: {}", path, e))
                })?;
                Self::from_json(&json)?
            }
            Err(_) => Self::default(),
        };

        if let Some(v) = env_parse("PAGEKV_BUFFER_POOL_BYTES")? {
            config.buffer_pool_bytes = v;
        }
        if let Some(v) = env_parse("PAGEKV_IO_TIMEOUT_MS")? {
            config.io_timeout_ms = v;
        }
        if let Some(v) = env_parse("PAGEKV_IO_RETRIES")? {
            config.io_retries = v;
        }
        if let Some(v) = env_parse("PAGEKV_SIMULATED_LATENCY_MS")? {
            config.simulated_latency_ms = v;
        }
        if let Ok(conn) = env::var("AZURE_STORAGE_CONNECTION_STRING") {
            config.azure.connection_string = Some(conn);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.buffer_pool_bytes < PAGE_SIZE {
            return Err(PageKvError::ConfigError(format!(
                "buffer_pool_bytes must hold at least one {} byte page",
                PAGE_SIZE
            )));
        }
        if self.io_timeout_ms == 0 {
            return Err(PageKvError::ConfigError("io_timeout_ms must be > 0".into()));
        }
        if self.key_lock_stripes == 0 {
            return Err(PageKvError::ConfigError(
                "key_lock_stripes must be > 0".into(),
            ));
        }
        if self.max_key_size == 0 || self.max_key_size > MAX_RECORD_PAYLOAD {
            return Err(PageKvError::ConfigError(format!(
                "max_key_size must be in [1, {}]",
                MAX_RECORD_PAYLOAD
            )));
        }
        Ok(())
    }

    pub fn frame_count(&self) -> usize {
        self.buffer_pool_bytes / PAGE_SIZE
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn simulated_latency(&self) -> Duration {
        Duration::from_millis(self.simulated_latency_ms)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| PageKvError::ConfigError(format!("{} has invalid value '{}'", name, raw))),
        Err(_) => Ok(None),
    }
}
