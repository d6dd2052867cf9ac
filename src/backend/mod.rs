/// Remote collaborators
///
/// The engine talks to two external services: a block store holding
/// fixed-size pages addressed by byte offset, and an append-only log store
/// backing the WAL. Both are slow and occasionally fail, so every call is
/// fallible and async.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::Result;

#[cfg(feature = "azure")]
pub mod azure;
pub mod memory;

pub use memory::{MemoryBlockStorage, MemoryLogStorage};

/// Byte-addressed remote block storage.
#[async_trait]
pub trait BlockStorage: Send + Sync {
    /// Read `length` bytes at `offset`. Ranges never written read back as zeros.
    async fn read_range(&self, offset: u64, length: usize) -> Result<Bytes>;

    async fn write_range(&self, offset: u64, data: Bytes) -> Result<()>;

    /// Total addressable bytes, if the backend is bounded.
    fn capacity_bytes(&self) -> Option<u64> {
        None
    }
}

/// Durable append-only record log.
///
/// Positions are logical record indices. They increase monotonically and are
/// never reused, even after a prefix is discarded.
#[async_trait]
pub trait LogStorage: Send + Sync {
    /// Durably append one record and return its position.
    async fn append(&self, record: Bytes) -> Result<u64>;

    /// All retained records at or after `position`, in append order.
    async fn read_from(&self, position: u64) -> Result<Vec<(u64, Bytes)>>;

    /// Drop every record before `position`.
    async fn discard_before(&self, position: u64) -> Result<()>;
}

pub type Collaborators = (Arc<dyn BlockStorage>, Arc<dyn LogStorage>);

/// Connect the two collaborators described by `config`.
///
/// Uses Azure when a connection string is configured and the `azure` feature
/// is compiled in; otherwise falls back to the in-memory backends.
pub async fn connect(config: &Config) -> Result<Collaborators> {
    if let Some(remote) = connect_azure(config).await? {
        return Ok(remote);
    }

    info!("Using in-memory storage");
    let latency = config.simulated_latency();
    let blocks = MemoryBlockStorage::new();
    blocks.set_latency(latency);
    let log = MemoryLogStorage::new();
    log.set_latency(latency);
    Ok((Arc::new(blocks), Arc::new(log)))
}

#[cfg(feature = "azure")]
async fn connect_azure(config: &Config) -> Result<Option<Collaborators>> {
    let azure = &config.azure;
    let Some(conn) = azure.connection_string.as_deref() else {
        return Ok(None);
    };

    info!("Connecting to Azure container {}", azure.container_name);
    let blocks =
        azure::AzurePageBlobStorage::new(conn, &azure.container_name, &azure.data_blob_name).await?;
    let log =
        azure::AzureAppendBlobLog::new(conn, &azure.container_name, &azure.wal_blob_name).await?;
    Ok(Some((Arc::new(blocks), Arc::new(log))))
}

#[cfg(not(feature = "azure"))]
async fn connect_azure(config: &Config) -> Result<Option<Collaborators>> {
    if config.azure.connection_string.is_some() {
        warn!("Azure connection string set but the `azure` feature is disabled");
    }
    Ok(None)
}
