/// Azure collaborators
///
/// Page Blobs serve as the remote block device: 4KB pages are 512-byte
/// aligned, so every page maps onto a valid page range. Append Blobs back the
/// WAL, one newline-terminated record per appended block.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use azure_storage::prelude::*;
use azure_storage_blobs::prelude::*;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tracing::{debug, info, warn};

use super::{BlockStorage, LogStorage};
use crate::error::{PageKvError, Result};

const BLOB_SIZE: u64 = 1024 * 1024 * 1024; // 1GB total capacity

fn blob_service(connection_string: &str) -> Result<BlobServiceClient> {
    let mut account_name = String::new();
    let mut account_key = String::new();

    for part in connection_string.split(';') {
        if let Some((key, value)) = part.split_once('=') {
            match key {
                "AccountName" => account_name = value.to_string(),
                "AccountKey" => account_key = value.to_string(),
                _ => {}
            }
        }
    }

    if account_name.is_empty() || account_key.is_empty() {
        return Err(PageKvError::ConfigError(
            "Invalid connection string: missing AccountName or AccountKey".into(),
        ));
    }

    let creds = StorageCredentials::access_key(account_name.clone(), account_key);
    Ok(BlobServiceClient::new(account_name, creds))
}

async fn container(connection_string: &str, container_name: &str) -> Result<ContainerClient> {
    let container_client = blob_service(connection_string)?.container_client(container_name);
    if !container_client.exists().await? {
        info!("Creating container {}", container_name);
        container_client.create().await?;
    }
    Ok(container_client)
}

async fn download(blob_client: &BlobClient, range: Option<std::ops::Range<u64>>) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    let mut get = blob_client.get();
    if let Some(range) = range {
        get = get.range(range);
    }
    let mut stream = get.into_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        data.extend_from_slice(&chunk.data.collect().await?);
    }
    Ok(data)
}

/// A fixed-size Page Blob used as a block device.
pub struct AzurePageBlobStorage {
    blob_client: BlobClient,
}

impl AzurePageBlobStorage {
    pub async fn new(connection_string: &str, container_name: &str, blob_name: &str) -> Result<Self> {
        info!("Initializing page blob storage: container={}, blob={}", container_name, blob_name);

        let blob_client = container(connection_string, container_name)
            .await?
            .blob_client(blob_name);

        if !blob_client.exists().await? {
            info!("Creating page blob {} with size {} bytes", blob_name, BLOB_SIZE);
            blob_client.put_page_blob(BLOB_SIZE as u128).await?;
        }

        Ok(Self { blob_client })
    }
}

#[async_trait]
impl BlockStorage for AzurePageBlobStorage {
    async fn read_range(&self, offset: u64, length: usize) -> Result<Bytes> {
        debug!("Reading {} bytes at offset {}", length, offset);
        let mut data = download(&self.blob_client, Some(offset..offset + length as u64)).await?;

        // Sparse page blob ranges come back as zeros; a short body means the
        // range ran past the end of the blob.
        if data.len() < length {
            data.resize(length, 0);
        }
        Ok(Bytes::from(data))
    }

    async fn write_range(&self, offset: u64, data: Bytes) -> Result<()> {
        debug!("Writing {} bytes at offset {}", data.len(), offset);
        let range = BA512Range::new(offset, offset + data.len() as u64 - 1)?;
        self.blob_client.put_page(range, data).await?;
        Ok(())
    }

    fn capacity_bytes(&self) -> Option<u64> {
        Some(BLOB_SIZE)
    }
}

/// An Append Blob used as the WAL's log store.
///
/// Record positions are line numbers offset by `base`, the number of records
/// discarded so far by this process.
pub struct AzureAppendBlobLog {
    blob_client: BlobClient,
    base: AtomicU64,
    next: AtomicU64,
}

impl AzureAppendBlobLog {
    pub async fn new(connection_string: &str, container_name: &str, blob_name: &str) -> Result<Self> {
        info!("Initializing append blob log: container={}, blob={}", container_name, blob_name);

        let blob_client = container(connection_string, container_name)
            .await?
            .blob_client(blob_name);

        let existing = if blob_client.exists().await? {
            split_records(&download(&blob_client, None).await?).len() as u64
        } else {
            info!("Creating WAL Append Blob: {}", blob_name);
            blob_client.put_append_blob().await?;
            0
        };

        Ok(Self {
            blob_client,
            base: AtomicU64::new(0),
            next: AtomicU64::new(existing),
        })
    }
}

fn split_records(data: &[u8]) -> Vec<Bytes> {
    data.split(|&b| b == b'\n')
        .filter(|line| !line.is_empty())
        .map(Bytes::copy_from_slice)
        .collect()
}

fn frame(records: &[Bytes]) -> Bytes {
    let mut buf = BytesMut::new();
    for record in records {
        buf.extend_from_slice(record);
        buf.extend_from_slice(b"\n");
    }
    buf.freeze()
}

#[async_trait]
impl LogStorage for AzureAppendBlobLog {
    async fn append(&self, record: Bytes) -> Result<u64> {
        self.blob_client
            .append_block(frame(std::slice::from_ref(&record)))
            .await?;
        Ok(self.next.fetch_add(1, Ordering::SeqCst))
    }

    async fn read_from(&self, position: u64) -> Result<Vec<(u64, Bytes)>> {
        let base = self.base.load(Ordering::SeqCst);
        let records = split_records(&download(&self.blob_client, None).await?);
        let skip = position.saturating_sub(base) as usize;
        Ok(records
            .into_iter()
            .enumerate()
            .skip(skip)
            .map(|(i, record)| (base + i as u64, record))
            .collect())
    }

    /// Append Blobs cannot drop a prefix, so the retained suffix is rewritten
    /// into a fresh blob. The rewrite is not atomic: a crash between delete and
    /// re-append loses the retained suffix.
    async fn discard_before(&self, position: u64) -> Result<()> {
        let retained: Vec<Bytes> = self
            .read_from(position)
            .await?
            .into_iter()
            .map(|(_, record)| record)
            .collect();

        warn!("Rewriting WAL blob, keeping {} records", retained.len());
        self.blob_client.delete().await?;
        self.blob_client.put_append_blob().await?;
        if !retained.is_empty() {
            self.blob_client.append_block(frame(&retained)).await?;
        }

        let base = self.base.load(Ordering::SeqCst);
        self.base.store(position.max(base), Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_framing() {
        let records = vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")];
        let framed = frame(&records);
        assert_eq!(&framed[..], b"one\ntwo\n");
        assert_eq!(split_records(&framed), records);
    }

    #[test]
    fn test_rejects_connection_string_without_key() {
        assert!(matches!(
            blob_service("AccountName=devstore;"),
            Err(PageKvError::ConfigError(_))
        ));
    }
}
