/// In-process collaborators
///
/// Behave like the remote services (sparse zero-filled block reads, positional
/// append-only log) and add knobs for tests: injected latency, fail-next-N
/// switches and call counters. Clones share the same underlying storage, so a
/// clone kept by a test survives a simulated process crash.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use super::{BlockStorage, LogStorage};
use crate::error::{PageKvError, Result};

#[derive(Default)]
struct Faults {
    latency_ms: AtomicU64,
    fail_reads: AtomicU32,
    fail_writes: AtomicU32,
}

impl Faults {
    async fn delay(&self) {
        let ms = self.latency_ms.load(Ordering::Relaxed);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }
}

/// Consume one pending failure, if any.
fn take(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[derive(Default)]
struct BlockInner {
    blob: RwLock<Vec<u8>>,
    faults: Faults,
    reads: AtomicU64,
    writes: AtomicU64,
}

/// A growable in-memory blob standing in for a remote page store.
#[derive(Clone, Default)]
pub struct MemoryBlockStorage {
    inner: Arc<BlockInner>,
}

impl MemoryBlockStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_latency(&self, latency: Duration) {
        self.inner.faults.set_latency(latency);
    }

    /// Make the next `n` reads fail.
    pub fn fail_next_reads(&self, n: u32) {
        self.inner.faults.fail_reads.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` writes fail.
    pub fn fail_next_writes(&self, n: u32) {
        self.inner.faults.fail_writes.store(n, Ordering::SeqCst);
    }

    /// Successful remote reads so far
    pub fn reads(&self) -> u64 {
        self.inner.reads.load(Ordering::SeqCst)
    }

    /// Successful remote writes so far
    pub fn writes(&self) -> u64 {
        self.inner.writes.load(Ordering::SeqCst)
    }

    /// Direct view of stored bytes, bypassing counters and faults.
    pub fn peek(&self, offset: u64, length: usize) -> Vec<u8> {
        read_sparse(&self.inner.blob.read(), offset, length)
    }
}

fn read_sparse(blob: &[u8], offset: u64, length: usize) -> Vec<u8> {
    let mut out = vec![0u8; length];
    let start = offset as usize;
    if start < blob.len() {
        let end = (start + length).min(blob.len());
        out[..end - start].copy_from_slice(&blob[start..end]);
    }
    out
}

#[async_trait]
impl BlockStorage for MemoryBlockStorage {
    async fn read_range(&self, offset: u64, length: usize) -> Result<Bytes> {
        self.inner.faults.delay().await;
        if take(&self.inner.faults.fail_reads) {
            return Err(PageKvError::io("read_range", "injected read failure"));
        }
        let data = read_sparse(&self.inner.blob.read(), offset, length);
        self.inner.reads.fetch_add(1, Ordering::SeqCst);
        Ok(Bytes::from(data))
    }

    async fn write_range(&self, offset: u64, data: Bytes) -> Result<()> {
        self.inner.faults.delay().await;
        if take(&self.inner.faults.fail_writes) {
            return Err(PageKvError::io("write_range", "injected write failure"));
        }
        {
            let mut blob = self.inner.blob.write();
            let start = offset as usize;
            let end = start + data.len();
            if blob.len() < end {
                blob.resize(end, 0);
            }
            blob[start..end].copy_from_slice(&data);
        }
        self.inner.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct LogState {
    /// Position of `records[0]`
    base: u64,
    records: VecDeque<Bytes>,
}

#[derive(Default)]
struct LogInner {
    state: RwLock<LogState>,
    faults: Faults,
    appends: AtomicU64,
}

/// An in-memory append-only log standing in for a remote log store.
#[derive(Clone, Default)]
pub struct MemoryLogStorage {
    inner: Arc<LogInner>,
}

impl MemoryLogStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_latency(&self, latency: Duration) {
        self.inner.faults.set_latency(latency);
    }

    /// Make the next `n` appends fail.
    pub fn fail_next_appends(&self, n: u32) {
        self.inner.faults.fail_writes.store(n, Ordering::SeqCst);
    }

    /// Records currently retained
    pub fn record_count(&self) -> usize {
        self.inner.state.read().records.len()
    }

    pub fn appends(&self) -> u64 {
        self.inner.appends.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LogStorage for MemoryLogStorage {
    async fn append(&self, record: Bytes) -> Result<u64> {
        self.inner.faults.delay().await;
        if take(&self.inner.faults.fail_writes) {
            return Err(PageKvError::io("append", "injected append failure"));
        }
        let position = {
            let mut state = self.inner.state.write();
            state.records.push_back(record);
            state.base + state.records.len() as u64 - 1
        };
        self.inner.appends.fetch_add(1, Ordering::SeqCst);
        Ok(position)
    }

    async fn read_from(&self, position: u64) -> Result<Vec<(u64, Bytes)>> {
        self.inner.faults.delay().await;
        if take(&self.inner.faults.fail_reads) {
            return Err(PageKvError::io("read_from", "injected read failure"));
        }
        let state = self.inner.state.read();
        let skip = position.saturating_sub(state.base) as usize;
        Ok(state
            .records
            .iter()
            .enumerate()
            .skip(skip)
            .map(|(i, record)| (state.base + i as u64, record.clone()))
            .collect())
    }

    async fn discard_before(&self, position: u64) -> Result<()> {
        self.inner.faults.delay().await;
        let mut state = self.inner.state.write();
        let n = (position.saturating_sub(state.base) as usize).min(state.records.len());
        state.records.drain(..n);
        state.base += n as u64;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unwritten_ranges_read_as_zeros() {
        let storage = MemoryBlockStorage::new();
        storage
            .write_range(4096, Bytes::from(vec![7u8; 4096]))
            .await
            .unwrap();

        let before = storage.read_range(0, 4096).await.unwrap();
        assert!(before.iter().all(|&b| b == 0));
        let page = storage.read_range(4096, 4096).await.unwrap();
        assert!(page.iter().all(|&b| b == 7));
        let past_end = storage.read_range(40960, 4096).await.unwrap();
        assert_eq!(past_end.len(), 4096);
        assert_eq!(storage.reads(), 3);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let storage = MemoryBlockStorage::new();
        storage.fail_next_writes(1);
        assert!(storage.write_range(0, Bytes::from_static(b"x")).await.is_err());
        assert!(storage.write_range(0, Bytes::from_static(b"x")).await.is_ok());
        assert_eq!(storage.writes(), 1);
    }

    #[tokio::test]
    async fn test_log_positions_survive_discard() {
        let log = MemoryLogStorage::new();
        for i in 0..5u8 {
            assert_eq!(log.append(Bytes::from(vec![i])).await.unwrap(), i as u64);
        }

        log.discard_before(3).await.unwrap();
        assert_eq!(log.record_count(), 2);

        let records = log.read_from(0).await.unwrap();
        let positions: Vec<u64> = records.iter().map(|(p, _)| *p).collect();
        assert_eq!(positions, vec![3, 4]);
        assert_eq!(log.append(Bytes::from_static(b"n")).await.unwrap(), 5);
        assert_eq!(log.read_from(5).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_clones_share_storage() {
        let log = MemoryLogStorage::new();
        let survivor = log.clone();
        log.append(Bytes::from_static(b"a")).await.unwrap();
        drop(log);
        assert_eq!(survivor.read_from(0).await.unwrap().len(), 1);
    }
}
