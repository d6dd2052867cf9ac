/// PageKV - crash-safe key-value store over remote block storage
///
/// A persistent key-value engine layered on a slow, remote, block-oriented
/// store (Azure Page Blobs in production, in-memory backends for tests).
///
/// Architecture:
/// 1. BlockStoreAdapter: page id -> byte range on the remote block store
/// 2. BufferPool: LRU page cache with flush-before-evict
/// 3. WriteAheadLog: durability and crash recovery over an append-only log
/// 4. KVStore: key-value interface with checksummed record pages

pub mod backend;
pub mod block_store;
pub mod buffer_pool;
pub mod config;
pub mod error;
pub mod kvstore;
pub mod page;
pub mod wal;

pub use backend::{BlockStorage, LogStorage, MemoryBlockStorage, MemoryLogStorage};
pub use block_store::BlockStoreAdapter;
pub use buffer_pool::{BufferPool, BufferPoolStats};
pub use config::{AzureConfig, Config};
pub use error::{ErrorKind, PageKvError, Result};
pub use kvstore::{EngineState, KVStore, KVStoreStats};
pub use page::{PageId, PAGE_SIZE};
pub use wal::{Operation, WalEntry, WriteAheadLog};
