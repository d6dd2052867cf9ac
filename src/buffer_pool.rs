/// Buffer Pool: LRU-based memory management for database pages
///
/// Manages a fixed arena of page frames addressed by index. The page table
/// maps each cached page id to exactly one frame; recency is a tick-ordered
/// map whose first unpinned entry is the eviction victim. A dirty victim is
/// written back before its frame is reused, and a failed write-back aborts
/// the eviction with the pool unchanged.
///
/// All state sits behind one async mutex. Eviction performs remote I/O while
/// holding it, which makes frame hand-off a single atomic step. Miss reads
/// run without it so that hits are not stuck behind a remote round trip.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::block_store::BlockStoreAdapter;
use crate::error::{PageKvError, Result};
use crate::page::{PageId, PAGE_SIZE};

pub type FrameId = usize;

#[derive(Debug)]
struct Frame {
    page_id: PageId,
    data: Vec<u8>,
    is_dirty: bool,
    /// Reservations waiting for their `put`; a pinned frame is never evicted
    pin_count: usize,
    last_access: u64,
}

/// Miss reads in flight for one page
struct Loading {
    readers: usize,
    /// Bumped whenever the page is installed while reads are in flight
    version: u64,
}

struct PoolState {
    /// `None` marks a free frame
    frames: Vec<Option<Frame>>,
    page_table: HashMap<PageId, FrameId>,
    free_list: Vec<FrameId>,
    /// Access tick -> frame; the first entry is least recently used
    lru: BTreeMap<u64, FrameId>,
    clock: u64,
    loading: HashMap<PageId, Loading>,
}

impl PoolState {
    fn touch(&mut self, frame_id: FrameId) {
        self.clock += 1;
        let tick = self.clock;
        if let Some(frame) = self.frames[frame_id].as_mut() {
            self.lru.remove(&frame.last_access);
            frame.last_access = tick;
            self.lru.insert(tick, frame_id);
        }
    }

    /// Copy of a cached page, optionally pinning its frame.
    fn hit(&mut self, page_id: PageId, pin: bool) -> Option<Vec<u8>> {
        let frame_id = self.page_table.get(&page_id).copied()?;
        self.touch(frame_id);
        let frame = self.frames[frame_id].as_mut()?;
        if pin {
            frame.pin_count += 1;
        }
        Some(frame.data.clone())
    }

    fn begin_load(&mut self, page_id: PageId) -> u64 {
        let loading = self.loading.entry(page_id).or_insert(Loading {
            readers: 0,
            version: 0,
        });
        loading.readers += 1;
        loading.version
    }

    fn end_load(&mut self, page_id: PageId) -> u64 {
        let Some(loading) = self.loading.get_mut(&page_id) else {
            return 0;
        };
        let version = loading.version;
        loading.readers -= 1;
        if loading.readers == 0 {
            self.loading.remove(&page_id);
        }
        version
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    /// Counted in hit/miss stats
    Fetch,
    /// Pins the frame; not counted
    Reserve,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    write_backs: AtomicU64,
    used_frames: AtomicUsize,
    dirty_pages: AtomicUsize,
}

pub struct BufferPool {
    disk: Arc<BlockStoreAdapter>,
    capacity: usize,
    state: Mutex<PoolState>,
    counters: Counters,
}

impl BufferPool {
    pub fn new(disk: Arc<BlockStoreAdapter>, num_frames: usize) -> Self {
        info!(
            "Initializing buffer pool: {} frames ({} MB)",
            num_frames,
            num_frames * PAGE_SIZE / (1024 * 1024)
        );

        let mut frames = Vec::with_capacity(num_frames);
        frames.resize_with(num_frames, || None);

        Self {
            disk,
            capacity: num_frames,
            state: Mutex::new(PoolState {
                frames,
                page_table: HashMap::new(),
                free_list: (0..num_frames).rev().collect(),
                lru: BTreeMap::new(),
                clock: 0,
                loading: HashMap::new(),
            }),
            counters: Counters::default(),
        }
    }

    /// Return a copy of the page, reading through on a miss.
    ///
    /// On failure nothing is installed.
    pub async fn fetch(&self, page_id: PageId) -> Result<Vec<u8>> {
        self.load(page_id, Access::Fetch).await
    }

    /// Pin a frame for `page_id` so that the following `put` cannot need an
    /// eviction. Any write-back happens here, so a failure leaves the caller
    /// free to abort before it has committed to anything.
    ///
    /// A `fresh` page has never been handed out and starts as a dirty zero
    /// page instead of being read. The pin is released by `put` or `unpin`.
    pub async fn reserve(&self, page_id: PageId, fresh: bool) -> Result<()> {
        if !fresh {
            return self.load(page_id, Access::Reserve).await.map(|_| ());
        }

        let mut state = self.state.lock().await;
        if state.hit(page_id, true).is_some() {
            return Ok(());
        }
        let frame_id = self.allocate_frame(&mut state).await?;
        self.install(&mut state, frame_id, page_id, vec![0u8; PAGE_SIZE], true, true);
        Ok(())
    }

    /// Drop a pin taken by `reserve` without writing the page.
    pub async fn unpin(&self, page_id: PageId) {
        let mut state = self.state.lock().await;
        let Some(frame_id) = state.page_table.get(&page_id).copied() else {
            return;
        };
        if let Some(frame) = state.frames[frame_id].as_mut() {
            frame.pin_count = frame.pin_count.saturating_sub(1);
        }
    }

    /// Install or overwrite the cached copy and mark it dirty, releasing one
    /// pin if the page was reserved.
    ///
    /// Never writes the page itself; only an eviction it triggers may, and a
    /// reserved page triggers none.
    pub async fn put(&self, page_id: PageId, data: Vec<u8>) -> Result<()> {
        if data.len() != PAGE_SIZE {
            return Err(PageKvError::InvalidPageSize {
                expected: PAGE_SIZE,
                actual: data.len(),
            });
        }

        let mut state = self.state.lock().await;

        let cached = state.page_table.get(&page_id).copied();
        if let Some(frame_id) = cached {
            if let Some(frame) = state.frames[frame_id].as_mut() {
                if !frame.is_dirty {
                    self.counters.dirty_pages.fetch_add(1, Ordering::Relaxed);
                }
                frame.data = data;
                frame.is_dirty = true;
                frame.pin_count = frame.pin_count.saturating_sub(1);
            }
            state.touch(frame_id);
            return Ok(());
        }

        let frame_id = self.allocate_frame(&mut state).await?;
        self.install(&mut state, frame_id, page_id, data, true, false);
        Ok(())
    }

    /// Write back one page if it is cached and dirty.
    pub async fn flush(&self, page_id: PageId) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(frame_id) = state.page_table.get(&page_id).copied() else {
            return Ok(());
        };
        self.write_back(&mut state, frame_id).await
    }

    /// Write back every dirty page in page-id order.
    ///
    /// Stops at the first failure; pages already written stay clean.
    pub async fn flush_all(&self) -> Result<()> {
        let mut state = self.state.lock().await;

        let mut dirty: Vec<(PageId, FrameId)> = state
            .page_table
            .iter()
            .filter(|(_, &frame_id)| {
                state.frames[frame_id]
                    .as_ref()
                    .map_or(false, |frame| frame.is_dirty)
            })
            .map(|(&page_id, &frame_id)| (page_id, frame_id))
            .collect();
        dirty.sort_unstable();

        if !dirty.is_empty() {
            info!("Flushing {} dirty pages", dirty.len());
        }
        for (_, frame_id) in dirty {
            self.write_back(&mut state, frame_id).await?;
        }
        Ok(())
    }

    pub async fn contains(&self, page_id: PageId) -> bool {
        self.state.lock().await.page_table.contains_key(&page_id)
    }

    /// Zero the hit/miss/eviction counters.
    pub fn reset_counters(&self) {
        self.counters.hits.store(0, Ordering::Relaxed);
        self.counters.misses.store(0, Ordering::Relaxed);
        self.counters.evictions.store(0, Ordering::Relaxed);
        self.counters.write_backs.store(0, Ordering::Relaxed);
    }

    /// Snapshot of the pool counters. Never blocks on the pool lock.
    pub fn stats(&self) -> BufferPoolStats {
        BufferPoolStats {
            total_frames: self.capacity,
            used_frames: self.counters.used_frames.load(Ordering::Relaxed),
            dirty_pages: self.counters.dirty_pages.load(Ordering::Relaxed),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            write_backs: self.counters.write_backs.load(Ordering::Relaxed),
        }
    }

    /// Serve from the cache, or read the page with the pool unlocked and
    /// install it. If the page was installed while the read was in flight the
    /// read may be stale, so it is retried unless the page is still cached.
    async fn load(&self, page_id: PageId, access: Access) -> Result<Vec<u8>> {
        let pin = access == Access::Reserve;
        let mut first = true;

        loop {
            let version = {
                let mut state = self.state.lock().await;
                if let Some(data) = state.hit(page_id, pin) {
                    if first && access == Access::Fetch {
                        debug!("Buffer hit for page {}", page_id);
                        self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    }
                    return Ok(data);
                }
                if first && access == Access::Fetch {
                    debug!("Buffer miss for page {}", page_id);
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                }
                first = false;
                state.begin_load(page_id)
            };

            let read = self.disk.read_page(page_id).await;

            let mut state = self.state.lock().await;
            let current = state.end_load(page_id);
            if let Some(data) = state.hit(page_id, pin) {
                return Ok(data);
            }
            let data = read?;
            if current != version {
                debug!("Page {} changed during read, reading again", page_id);
                continue;
            }

            let frame_id = self.allocate_frame(&mut state).await?;
            self.install(&mut state, frame_id, page_id, data.clone(), false, pin);
            return Ok(data);
        }
    }

    /// Get a free frame, evicting the least recently used page if necessary.
    async fn allocate_frame(&self, state: &mut PoolState) -> Result<FrameId> {
        if let Some(frame_id) = state.free_list.pop() {
            return Ok(frame_id);
        }

        let (tick, victim) = state
            .lru
            .iter()
            .find(|(_, &frame_id)| {
                state.frames[frame_id]
                    .as_ref()
                    .map_or(false, |frame| frame.pin_count == 0)
            })
            .map(|(&tick, &frame_id)| (tick, frame_id))
            .ok_or(PageKvError::BufferPoolExhausted)?;

        let frame = state.frames[victim]
            .as_ref()
            .ok_or(PageKvError::BufferPoolExhausted)?;
        let victim_page = frame.page_id;

        if frame.is_dirty {
            info!("Writing back dirty page {} before eviction", victim_page);
            if let Err(e) = self.disk.write_page(victim_page, &frame.data).await {
                warn!("Eviction of page {} aborted: {}", victim_page, e);
                return Err(e);
            }
            self.counters.write_backs.fetch_add(1, Ordering::Relaxed);
            self.counters.dirty_pages.fetch_sub(1, Ordering::Relaxed);
        }

        debug!("Evicting LRU page {} from frame {}", victim_page, victim);
        state.lru.remove(&tick);
        state.page_table.remove(&victim_page);
        state.frames[victim] = None;
        self.counters.used_frames.fetch_sub(1, Ordering::Relaxed);
        self.counters.evictions.fetch_add(1, Ordering::Relaxed);

        Ok(victim)
    }

    fn install(
        &self,
        state: &mut PoolState,
        frame_id: FrameId,
        page_id: PageId,
        data: Vec<u8>,
        dirty: bool,
        pinned: bool,
    ) {
        state.frames[frame_id] = Some(Frame {
            page_id,
            data,
            is_dirty: dirty,
            pin_count: usize::from(pinned),
            last_access: 0,
        });
        state.page_table.insert(page_id, frame_id);
        state.touch(frame_id);
        if let Some(loading) = state.loading.get_mut(&page_id) {
            loading.version += 1;
        }

        self.counters.used_frames.fetch_add(1, Ordering::Relaxed);
        if dirty {
            self.counters.dirty_pages.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn write_back(&self, state: &mut PoolState, frame_id: FrameId) -> Result<()> {
        let Some(frame) = state.frames[frame_id].as_ref() else {
            return Ok(());
        };
        if !frame.is_dirty {
            return Ok(());
        }

        self.disk.write_page(frame.page_id, &frame.data).await?;

        if let Some(frame) = state.frames[frame_id].as_mut() {
            frame.is_dirty = false;
        }
        self.counters.write_backs.fetch_add(1, Ordering::Relaxed);
        self.counters.dirty_pages.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferPoolStats {
    pub total_frames: usize,
    pub used_frames: usize,
    pub dirty_pages: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub write_backs: u64,
}

impl BufferPoolStats {
    /// Fraction of fetches served from memory; 0.0 before any fetch.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::backend::{BlockStorage, MemoryBlockStorage};
    use crate::config::Config;
    use tokio_test::{assert_err, assert_ok};

    fn pool(frames: usize) -> (BufferPool, MemoryBlockStorage) {
        let storage = MemoryBlockStorage::new();
        let config = Config {
            io_retries: 0,
            ..Config::default()
        };
        let disk = Arc::new(BlockStoreAdapter::new(Arc::new(storage.clone()), &config));
        (BufferPool::new(disk, frames), storage)
    }

    fn page(fill: u8) -> Vec<u8> {
        vec![fill; PAGE_SIZE]
    }

    #[tokio::test]
    async fn test_fetch_caches_page() {
        let (bp, storage) = pool(4);

        assert_eq!(bp.fetch(3).await.unwrap(), page(0));
        assert_eq!(bp.fetch(3).await.unwrap(), page(0));

        assert_eq!(storage.reads(), 1);
        let stats = bp.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert_eq!(stats.used_frames, 1);
    }

    #[tokio::test]
    async fn test_evicts_least_recently_used() {
        let (bp, storage) = pool(3);

        for id in 1..=3 {
            bp.fetch(id).await.unwrap();
        }
        // 1 becomes most recent, leaving 2 as the victim
        bp.fetch(1).await.unwrap();
        bp.fetch(4).await.unwrap();

        assert!(bp.contains(1).await);
        assert!(!bp.contains(2).await);
        assert!(bp.contains(3).await);
        assert!(bp.contains(4).await);

        let reads = storage.reads();
        bp.fetch(2).await.unwrap();
        assert_eq!(storage.reads(), reads + 1);
    }

    #[tokio::test]
    async fn test_dirty_page_written_before_reuse() {
        let (bp, storage) = pool(2);

        bp.put(10, page(0xAA)).await.unwrap();
        bp.put(11, page(0xBB)).await.unwrap();
        assert_eq!(storage.writes(), 0);

        bp.put(12, page(0xCC)).await.unwrap();

        assert_eq!(storage.writes(), 1);
        assert_eq!(storage.peek(10 * PAGE_SIZE as u64, PAGE_SIZE), page(0xAA));
        assert!(!bp.contains(10).await);
        assert_eq!(bp.fetch(10).await.unwrap(), page(0xAA));
    }

    #[tokio::test]
    async fn test_failed_write_back_aborts_eviction() {
        let (bp, storage) = pool(1);

        bp.put(1, page(1)).await.unwrap();
        storage.fail_next_writes(1);

        let err = assert_err!(bp.put(2, page(2)).await);
        assert!(err.is_retryable());
        assert!(bp.contains(1).await);
        assert!(!bp.contains(2).await);
        assert_eq!(bp.stats().dirty_pages, 1);

        assert_ok!(bp.put(2, page(2)).await);
        assert_eq!(storage.peek(PAGE_SIZE as u64, PAGE_SIZE), page(1));
    }

    #[tokio::test]
    async fn test_failed_read_installs_nothing() {
        let (bp, storage) = pool(2);

        storage.fail_next_reads(1);
        assert_err!(bp.fetch(5).await);
        assert!(!bp.contains(5).await);
        assert_eq!(bp.stats().used_frames, 0);
    }

    #[tokio::test]
    async fn test_flush_is_idempotent() {
        let (bp, storage) = pool(4);

        bp.put(2, page(7)).await.unwrap();
        bp.flush(2).await.unwrap();
        bp.flush(2).await.unwrap();
        bp.flush(99).await.unwrap();

        assert_eq!(storage.writes(), 1);
        assert_eq!(bp.stats().dirty_pages, 0);
        assert!(bp.contains(2).await);
    }

    #[tokio::test]
    async fn test_flush_all_writes_every_dirty_page() {
        let (bp, storage) = pool(8);

        for id in 0..5 {
            bp.put(id, page(id as u8 + 1)).await.unwrap();
        }
        bp.fetch(6).await.unwrap();
        bp.flush_all().await.unwrap();

        assert_eq!(storage.writes(), 5);
        assert_eq!(bp.stats().dirty_pages, 0);
        for id in 0..5u64 {
            assert_eq!(storage.peek(id * PAGE_SIZE as u64, PAGE_SIZE), page(id as u8 + 1));
        }
    }

    #[tokio::test]
    async fn test_rejects_wrong_page_size() {
        let (bp, _storage) = pool(2);

        let err = assert_err!(bp.put(1, vec![0u8; 100]).await);
        assert!(matches!(err, PageKvError::InvalidPageSize { actual: 100, .. }));
        assert!(!bp.contains(1).await);
    }

    #[tokio::test]
    async fn test_overfilled_pool_miss_on_first_page() {
        let capacity = 8;
        let (bp, storage) = pool(capacity);

        for id in 0..(capacity as u64 + 5) {
            bp.put(id, page(id as u8)).await.unwrap();
        }
        assert_eq!(storage.reads(), 0);

        assert_eq!(bp.fetch(0).await.unwrap(), page(0));
        assert_eq!(storage.reads(), 1);

        let stats = bp.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.hit_ratio(), 0.0);
        assert_eq!(stats.used_frames, capacity);
    }

    #[tokio::test]
    async fn test_reserved_frame_is_never_evicted() {
        let (bp, storage) = pool(1);

        assert_ok!(bp.reserve(1, true).await);
        let err = assert_err!(bp.put(2, page(2)).await);
        assert!(matches!(err, PageKvError::BufferPoolExhausted));
        assert!(bp.contains(1).await);

        // the put that follows a reservation releases it
        bp.put(1, page(1)).await.unwrap();
        assert_ok!(bp.put(2, page(2)).await);
        assert_eq!(storage.peek(PAGE_SIZE as u64, PAGE_SIZE), page(1));
        assert_eq!(storage.reads(), 0);
    }

    #[tokio::test]
    async fn test_failed_reservation_leaves_pool_unchanged() {
        let (bp, storage) = pool(1);

        bp.put(1, page(1)).await.unwrap();
        storage.fail_next_writes(1);
        assert_err!(bp.reserve(2, true).await);
        assert!(bp.contains(1).await);
        assert!(!bp.contains(2).await);

        assert_ok!(bp.reserve(2, true).await);
        bp.unpin(2).await;
        assert_ok!(bp.put(3, page(3)).await);
        assert!(!bp.contains(2).await);
    }

    #[tokio::test]
    async fn test_reserve_reads_uncached_page_without_counting() {
        let (bp, storage) = pool(2);
        storage.write_range(4 * PAGE_SIZE as u64, page(4).into()).await.unwrap();

        assert_ok!(bp.reserve(4, false).await);
        assert_eq!(storage.reads(), 1);
        let stats = bp.stats();
        assert_eq!((stats.hits, stats.misses), (0, 0));

        assert_eq!(bp.fetch(4).await.unwrap(), page(4));
        assert_eq!(bp.stats().hits, 1);
        bp.unpin(4).await;
    }

    #[tokio::test]
    async fn test_hit_is_not_blocked_by_slow_miss() {
        let (bp, storage) = pool(4);
        let bp = Arc::new(bp);
        bp.put(1, page(1)).await.unwrap();

        storage.set_latency(Duration::from_millis(300));
        let slow = {
            let bp = Arc::clone(&bp);
            tokio::spawn(async move { bp.fetch(2).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let hit = tokio::time::timeout(Duration::from_millis(100), bp.fetch(1)).await;
        assert_eq!(assert_ok!(hit).unwrap(), page(1));
        assert_eq!(slow.await.unwrap().unwrap(), page(0));
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_frame() {
        let (bp, storage) = pool(4);
        storage.set_latency(Duration::from_millis(50));

        let (a, b) = tokio::join!(bp.fetch(3), bp.fetch(3));
        assert_eq!(a.unwrap(), page(0));
        assert_eq!(b.unwrap(), page(0));
        assert_eq!(bp.stats().used_frames, 1);
    }

    #[tokio::test]
    async fn test_miss_never_installs_stale_copy() {
        let (bp, storage) = pool(1);
        let bp = Arc::new(bp);
        storage.set_latency(Duration::from_millis(100));

        let reader = {
            let bp = Arc::clone(&bp);
            tokio::spawn(async move { bp.fetch(4).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // overwrite page 4 and push it out while the read is in flight
        bp.put(4, page(9)).await.unwrap();
        bp.put(5, page(5)).await.unwrap();

        assert_eq!(reader.await.unwrap().unwrap(), page(9));
        assert_eq!(bp.fetch(4).await.unwrap(), page(9));
    }
}
