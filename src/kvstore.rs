/// KVStore: Key-Value Store Engine
///
/// This is the top-level database layer. It orchestrates the BufferPool, the
/// WAL and the block store adapter: every mutation is appended to the WAL
/// before it changes the index or any page, so a mutation is either durable
/// or reported as failed. The page's frame is reserved ahead of the append,
/// which leaves nothing after it that can fail.
///
/// Each key owns one data page for its whole life. A delete rewrites that
/// page as a tombstone; a later set reuses it.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::stream::{self, Stream, StreamExt};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::backend::{self, BlockStorage, LogStorage, MemoryBlockStorage, MemoryLogStorage};
use crate::block_store::BlockStoreAdapter;
use crate::buffer_pool::BufferPool;
use crate::config::Config;
use crate::error::{PageKvError, Result};
use crate::page::{
    self, HeaderPage, PageId, RecordPage, FIRST_DATA_PAGE_ID, HEADER_PAGE_ID, PAGE_SIZE,
};
use crate::wal::{Operation, WalEntry, WriteAheadLog};

/// Engine lifecycle. Calls are served only while `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Recovering,
    Ready,
    Stopped,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Recovering => "recovering",
            EngineState::Ready => "ready",
            EngineState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Where a key lives. Tombstoned keys keep their page for reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexEntry {
    Present { page_id: PageId },
    Tombstoned { page_id: PageId },
}

impl IndexEntry {
    fn page_id(self) -> PageId {
        match self {
            IndexEntry::Present { page_id } | IndexEntry::Tombstoned { page_id } => page_id,
        }
    }
}

pub struct KVStore {
    /// In-memory index: key -> owning page
    index: Arc<DashMap<Vec<u8>, IndexEntry>>,

    /// Buffer pool for caching pages
    buffer_pool: Arc<BufferPool>,

    /// Write-Ahead Log for durability
    wal: Arc<WriteAheadLog>,

    disk: Arc<BlockStoreAdapter>,

    /// Next unallocated data page
    next_page_id: AtomicU64,

    /// Serializes mutations of the same key
    key_locks: Vec<Mutex<()>>,

    /// Mutations hold it shared; checkpoint holds it exclusively so that
    /// nothing is half-applied when the marker is taken.
    commit_gate: RwLock<()>,

    state: parking_lot::RwLock<EngineState>,
    config: Config,
}

impl KVStore {
    /// Open an engine over the given collaborators and recover its state.
    pub async fn open(
        config: Config,
        blocks: Arc<dyn BlockStorage>,
        log: Arc<dyn LogStorage>,
    ) -> Result<Self> {
        config.validate()?;
        info!("Initializing KVStore");

        let disk = Arc::new(BlockStoreAdapter::new(blocks, &config));
        let buffer_pool = Arc::new(BufferPool::new(disk.clone(), config.frame_count()));
        let wal = Arc::new(WriteAheadLog::open(log, &config).await?);

        let store = Self {
            index: Arc::new(DashMap::new()),
            buffer_pool,
            wal,
            disk,
            next_page_id: AtomicU64::new(FIRST_DATA_PAGE_ID),
            key_locks: (0..config.key_lock_stripes).map(|_| Mutex::new(())).collect(),
            commit_gate: RwLock::new(()),
            state: parking_lot::RwLock::new(EngineState::Recovering),
            config,
        };

        // Perform crash recovery
        store.recover().await?;

        Ok(store)
    }

    /// Engine over fresh in-process backends.
    pub async fn in_memory(config: Config) -> Result<Self> {
        let latency = config.simulated_latency();
        let blocks = MemoryBlockStorage::new();
        blocks.set_latency(latency);
        let log = MemoryLogStorage::new();
        log.set_latency(latency);
        Self::open(config, Arc::new(blocks), Arc::new(log)).await
    }

    /// Engine over the backends `config` describes.
    pub async fn from_config(config: Config) -> Result<Self> {
        let (blocks, log) = backend::connect(&config).await?;
        Self::open(config, blocks, log).await
    }

    /// Engine over Azure Page Blob and Append Blob storage.
    #[cfg(feature = "azure")]
    pub async fn new(connection_string: &str) -> Result<Self> {
        let mut config = Config::default();
        config.azure.connection_string = Some(connection_string.to_string());
        Self::from_config(config).await
    }

    /// Rebuild the index from flushed pages, then replay the WAL on top.
    async fn recover(&self) -> Result<()> {
        info!("Starting crash recovery...");

        let header = page::decode_header(&self.buffer_pool.fetch(HEADER_PAGE_ID).await?)?;
        let next_page_id = header.map_or(FIRST_DATA_PAGE_ID, |h| h.next_page_id.max(FIRST_DATA_PAGE_ID));
        if let Some(h) = header {
            info!(
                "Header page: {} pages allocated, checkpoint at LSN {}",
                h.next_page_id, h.checkpoint_lsn
            );
        }

        // Highest LSN wins when a key appears on more than one page
        let mut newest: HashMap<Vec<u8>, (u64, IndexEntry)> = HashMap::new();
        for page_id in FIRST_DATA_PAGE_ID..next_page_id {
            let data = self.buffer_pool.fetch(page_id).await?;
            let (key, lsn, entry) = match page::decode_record(page_id, &data)? {
                RecordPage::Empty => continue,
                RecordPage::Live { key, lsn, .. } => (key, lsn, IndexEntry::Present { page_id }),
                RecordPage::Tombstone { key, lsn } => (key, lsn, IndexEntry::Tombstoned { page_id }),
            };
            match newest.get(&key) {
                Some(&(seen, _)) if seen >= lsn => {}
                _ => {
                    newest.insert(key, (lsn, entry));
                }
            }
        }
        let from_pages = newest.len();
        for (key, (_, entry)) in newest {
            self.index.insert(key, entry);
        }
        self.next_page_id.store(next_page_id, Ordering::SeqCst);

        let mut replayed = 0usize;
        for entry in self.wal.replay().await? {
            self.replay_entry(entry?).await?;
            replayed += 1;
        }

        self.buffer_pool.reset_counters();
        *self.state.write() = EngineState::Ready;

        info!(
            "Crash recovery complete: {} keys from pages, {} WAL entries replayed",
            from_pages, replayed
        );
        Ok(())
    }

    /// Apply one WAL entry without logging it again.
    async fn replay_entry(&self, entry: WalEntry) -> Result<()> {
        let lsn = entry.sequence_number;
        match entry.operation {
            Operation::Set => {
                let value = entry.value.ok_or_else(|| PageKvError::WalCorruption {
                    position: lsn,
                    reason: format!("set at LSN {} carries no value", lsn),
                })?;
                let (page_id, _) = self.page_for(&entry.key)?;
                self.apply(&entry.key, Some(&value), lsn, page_id).await?;
                debug!("Recovered: SET {} (LSN {})", String::from_utf8_lossy(&entry.key), lsn);
            }
            Operation::Delete => {
                let Some(existing) = self.lookup(&entry.key) else {
                    debug!("Recovered: DELETE of unknown key at LSN {}, skipping", lsn);
                    return Ok(());
                };
                self.apply(&entry.key, None, lsn, existing.page_id()).await?;
                debug!("Recovered: DELETE {} (LSN {})", String::from_utf8_lossy(&entry.key), lsn);
            }
        }
        Ok(())
    }

    /// Set a key-value pair.
    ///
    /// Returns once the WAL append is durable; the page write-back happens on
    /// eviction or checkpoint.
    pub async fn set(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<()> {
        let (key, value) = (key.as_ref(), value.as_ref());
        self.ensure_ready()?;
        page::check_record_size(key, value, self.config.max_key_size)?;

        let _gate = self.commit_gate.read().await;
        let _guard = self.key_lock(key).lock().await;

        let (page_id, fresh) = self.page_for(key)?;

        // 1. Claim the page's frame; any eviction write-back happens now
        self.buffer_pool.reserve(page_id, fresh).await?;

        // 2. Log to WAL (DURABILITY POINT)
        let lsn = self.logged(Operation::Set, key, Some(value), page_id).await?;

        // 3. Apply the change
        self.apply(key, Some(value), lsn, page_id).await?;

        debug!("SET: {} -> page {} (LSN {})", String::from_utf8_lossy(key), page_id, lsn);
        Ok(())
    }

    /// Get a value by key
    pub async fn get(&self, key: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>> {
        let key = key.as_ref();
        self.ensure_ready()?;

        match self.lookup(key) {
            Some(IndexEntry::Present { page_id }) => self.read_live(key, page_id).await,
            _ => {
                debug!("GET: {} not found", String::from_utf8_lossy(key));
                Ok(None)
            }
        }
    }

    /// Delete a key. Returns whether a live value was removed; deleting an
    /// absent key is a no-op and writes nothing to the WAL.
    pub async fn delete(&self, key: impl AsRef<[u8]>) -> Result<bool> {
        let key = key.as_ref();
        self.ensure_ready()?;

        let _gate = self.commit_gate.read().await;
        let _guard = self.key_lock(key).lock().await;

        let Some(IndexEntry::Present { page_id }) = self.lookup(key) else {
            debug!("DELETE: {} not found", String::from_utf8_lossy(key));
            return Ok(false);
        };

        self.buffer_pool.reserve(page_id, false).await?;
        let lsn = self.logged(Operation::Delete, key, None, page_id).await?;
        self.apply(key, None, lsn, page_id).await?;

        debug!("DELETE: {} (LSN {})", String::from_utf8_lossy(key), lsn);
        Ok(true)
    }

    /// Stream every live entry in index order.
    ///
    /// The key set is captured when the stream is created; pages are fetched
    /// as the stream is polled. Call again to restart.
    pub fn scan(&self) -> Result<impl Stream<Item = Result<(Vec<u8>, Vec<u8>)>> + '_> {
        self.ensure_ready()?;

        let snapshot: Vec<(Vec<u8>, PageId)> = self
            .index
            .iter()
            .filter_map(|entry| match *entry.value() {
                IndexEntry::Present { page_id } => Some((entry.key().clone(), page_id)),
                IndexEntry::Tombstoned { .. } => None,
            })
            .collect();
        debug!("SCAN: {} candidate entries", snapshot.len());

        Ok(stream::iter(snapshot)
            .then(move |(key, page_id)| async move {
                let value = self.read_live(&key, page_id).await?;
                Ok::<_, PageKvError>(value.map(|value| (key, value)))
            })
            .filter_map(|item| async move { item.transpose() }))
    }

    /// Write back all dirty pages. Does not touch the WAL.
    pub async fn flush(&self) -> Result<()> {
        self.ensure_ready()?;
        self.buffer_pool.flush_all().await
    }

    /// Create a checkpoint
    ///
    /// Waits for in-flight mutations, flushes every dirty page and the header
    /// page, then moves the WAL marker and discards the covered log prefix.
    pub async fn checkpoint(&self) -> Result<()> {
        self.ensure_ready()?;
        let _gate = self.commit_gate.write().await;

        let lsn = self.wal.current_lsn();
        info!("Creating checkpoint at LSN {}...", lsn);

        // 1. Flush all dirty pages
        self.buffer_pool.flush_all().await?;

        // 2. Persist the allocation high-water mark
        let header = HeaderPage {
            next_page_id: self.next_page_id.load(Ordering::SeqCst),
            checkpoint_lsn: lsn,
        };
        self.buffer_pool
            .put(HEADER_PAGE_ID, page::encode_header(&header))
            .await?;
        self.buffer_pool.flush(HEADER_PAGE_ID).await?;

        // 3. Record the marker, then drop the covered log prefix
        self.wal.checkpoint(lsn).await?;
        self.wal.clear().await?;

        info!("Checkpoint complete");
        Ok(())
    }

    /// Stop serving calls, checkpointing first if `clean`.
    pub async fn shutdown(&self, clean: bool) -> Result<()> {
        if clean {
            self.checkpoint().await?;
        }
        *self.state.write() = EngineState::Stopped;
        info!("KVStore stopped (clean: {})", clean);
        Ok(())
    }

    pub fn state(&self) -> EngineState {
        *self.state.read()
    }

    /// Get store statistics. In-memory only.
    pub fn stats(&self) -> KVStoreStats {
        let bp_stats = self.buffer_pool.stats();

        let mut num_keys = 0;
        let mut tombstones = 0;
        for entry in self.index.iter() {
            match entry.value() {
                IndexEntry::Present { .. } => num_keys += 1,
                IndexEntry::Tombstoned { .. } => tombstones += 1,
            }
        }

        KVStoreStats {
            num_keys,
            tombstones,
            cache_hits: bp_stats.hits,
            cache_misses: bp_stats.misses,
            cache_hit_ratio: bp_stats.hit_ratio(),
            dirty_pages: bp_stats.dirty_pages,
            used_frames: bp_stats.used_frames,
            total_frames: bp_stats.total_frames,
            buffer_pool_used_mb: (bp_stats.used_frames * PAGE_SIZE) / (1024 * 1024),
            buffer_pool_total_mb: (bp_stats.total_frames * PAGE_SIZE) / (1024 * 1024),
            wal_entries: self.wal.entry_count(),
            current_lsn: self.wal.current_lsn(),
            checkpoint_lsn: self.wal.checkpoint_lsn(),
            state: self.state(),
        }
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state() {
            EngineState::Ready => Ok(()),
            state => Err(PageKvError::NotReady { state }),
        }
    }

    fn lookup(&self, key: &[u8]) -> Option<IndexEntry> {
        self.index.get(key).map(|entry| *entry.value())
    }

    fn key_lock(&self, key: &[u8]) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.key_locks[(hasher.finish() % self.key_locks.len() as u64) as usize]
    }

    /// The key's existing page, or a newly allocated one (`true`).
    fn page_for(&self, key: &[u8]) -> Result<(PageId, bool)> {
        if let Some(entry) = self.lookup(key) {
            return Ok((entry.page_id(), false));
        }
        let max_pages = self.disk.max_pages();
        self.next_page_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |id| {
                (id < max_pages).then_some(id + 1)
            })
            .map(|id| (id, true))
            .map_err(|_| PageKvError::StorageFull { max_pages })
    }

    /// Append to the WAL, releasing the page reservation if the append fails.
    async fn logged(
        &self,
        operation: Operation,
        key: &[u8],
        value: Option<&[u8]>,
        page_id: PageId,
    ) -> Result<u64> {
        match self.wal.append(operation, key, value).await {
            Ok(lsn) => Ok(lsn),
            Err(e) => {
                self.buffer_pool.unpin(page_id).await;
                Err(e)
            }
        }
    }

    /// Write the record page and publish the index entry. After a
    /// reservation the page is cached and pinned, so the `put` needs no
    /// eviction and cannot fail.
    async fn apply(&self, key: &[u8], value: Option<&[u8]>, lsn: u64, page_id: PageId) -> Result<()> {
        let data = page::encode_record(key, value, lsn)?;
        self.buffer_pool.put(page_id, data).await?;

        let entry = match value {
            Some(_) => IndexEntry::Present { page_id },
            None => IndexEntry::Tombstoned { page_id },
        };
        self.index.insert(key.to_vec(), entry);
        Ok(())
    }

    async fn read_live(&self, key: &[u8], page_id: PageId) -> Result<Option<Vec<u8>>> {
        let data = self.buffer_pool.fetch(page_id).await?;
        match page::decode_record(page_id, &data)? {
            RecordPage::Live { key: stored, value, .. } if stored == key => Ok(Some(value)),
            RecordPage::Live { .. } | RecordPage::Tombstone { .. } | RecordPage::Empty => {
                // A concurrent delete can leave a tombstone behind a stale index read
                if !matches!(self.lookup(key), Some(IndexEntry::Tombstoned { .. })) {
                    warn!(
                        "Page {} does not hold a live record for {}",
                        page_id,
                        String::from_utf8_lossy(key)
                    );
                }
                Ok(None)
            }
        }
    }
}

/// Store statistics
#[derive(Debug, Clone, PartialEq)]
pub struct KVStoreStats {
    pub num_keys: usize,
    pub tombstones: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_ratio: f64,
    pub dirty_pages: usize,
    pub used_frames: usize,
    pub total_frames: usize,
    pub buffer_pool_used_mb: usize,
    pub buffer_pool_total_mb: usize,
    pub wal_entries: usize,
    pub current_lsn: u64,
    pub checkpoint_lsn: u64,
    pub state: EngineState,
}
