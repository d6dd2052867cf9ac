/// BlockStore: Pager Layer - Treats remote block storage as a raw page device
///
/// Translates page ids to byte ranges (`page_id * 4096`) and moves whole
/// pages. Stateless: no caching, no batching. Every remote call runs under the
/// configured timeout; idempotent reads and writes are retried on I/O errors.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::backend::BlockStorage;
use crate::config::Config;
use crate::error::{PageKvError, Result};
use crate::page::{PageId, PAGE_SIZE};

/// Run one remote call under a deadline, mapping expiry to `Timeout`.
pub(crate) async fn with_timeout<T, F>(op: &'static str, timeout: Duration, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(PageKvError::Timeout { op, timeout }),
    }
}

pub struct BlockStoreAdapter {
    storage: Arc<dyn BlockStorage>,
    io_timeout: Duration,
    retries: u32,
    backoff: Duration,
}

impl BlockStoreAdapter {
    pub fn new(storage: Arc<dyn BlockStorage>, config: &Config) -> Self {
        Self {
            storage,
            io_timeout: config.io_timeout(),
            retries: config.io_retries,
            backoff: config.retry_backoff(),
        }
    }

    /// Read one page. A short or long response is a malformed page.
    pub async fn read_page(&self, page_id: PageId) -> Result<Vec<u8>> {
        let offset = self.offset(page_id)?;
        debug!("Reading page {} from offset {}", page_id, offset);

        let data = self
            .with_retry("read_page", || self.storage.read_range(offset, PAGE_SIZE))
            .await?;

        if data.len() != PAGE_SIZE {
            return Err(PageKvError::MalformedPage {
                page_id,
                expected: PAGE_SIZE,
                actual: data.len(),
            });
        }
        Ok(data.to_vec())
    }

    pub async fn write_page(&self, page_id: PageId, data: &[u8]) -> Result<()> {
        if data.len() != PAGE_SIZE {
            return Err(PageKvError::MalformedPage {
                page_id,
                expected: PAGE_SIZE,
                actual: data.len(),
            });
        }
        let offset = self.offset(page_id)?;
        debug!("Writing page {} at offset {}", page_id, offset);

        let bytes = Bytes::copy_from_slice(data);
        self.with_retry("write_page", || self.storage.write_range(offset, bytes.clone()))
            .await
    }

    /// Number of addressable pages
    pub fn max_pages(&self) -> u64 {
        self.storage
            .capacity_bytes()
            .map(|bytes| bytes / PAGE_SIZE as u64)
            .unwrap_or(u64::MAX)
    }

    fn offset(&self, page_id: PageId) -> Result<u64> {
        if page_id >= self.max_pages() {
            return Err(PageKvError::StorageFull {
                max_pages: self.max_pages(),
            });
        }
        page_id
            .checked_mul(PAGE_SIZE as u64)
            .ok_or(PageKvError::StorageFull {
                max_pages: self.max_pages(),
            })
    }

    async fn with_retry<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match with_timeout(op, self.io_timeout, call()).await {
                Err(e) if e.is_retryable() && attempt < self.retries => {
                    attempt += 1;
                    warn!("{} failed ({}), retry {}/{}", op, e, attempt, self.retries);
                    tokio::time::sleep(self.backoff * attempt).await;
                }
                result => return result,
            }
        }
    }
}
