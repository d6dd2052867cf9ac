/// WAL: Write-Ahead Log for Durability and Crash Recovery
///
/// Every mutation is logged before it is applied. Appends are serialized by
/// one async lock, so append order, sequence order and replay order agree.
/// Each physical record is `<crc32 as 8 hex digits> <json>`; the checkpoint
/// marker is itself a record, so it survives restarts and `clear()`.
///
/// Recovery rules:
/// - an undecodable record is a torn write if the next entry continues the
///   sequence (or nothing follows), and is skipped; ahead of the first
///   readable record, only LSN 1 continues it;
/// - a sequence gap or a decreasing sequence number is corruption;
/// - a repeated sequence number (re-append after an ambiguous timeout)
///   supersedes the earlier record.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::backend::LogStorage;
use crate::block_store::with_timeout;
use crate::config::Config;
use crate::error::{PageKvError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Set,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalEntry {
    pub sequence_number: u64,
    pub operation: Operation,
    pub key: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WalRecord {
    Entry(WalEntry),
    Checkpoint { up_to: u64 },
}

fn encode_record(record: &WalRecord) -> Result<Bytes> {
    let json = serde_json::to_vec(record)?;
    let mut data = format!("{:08x} ", crc32fast::hash(&json)).into_bytes();
    data.extend_from_slice(&json);
    Ok(Bytes::from(data))
}

fn decode_record(raw: &[u8]) -> std::result::Result<WalRecord, String> {
    if raw.len() < 9 || raw[8] != b' ' {
        return Err(format!("truncated record ({} bytes)", raw.len()));
    }
    let expected = std::str::from_utf8(&raw[..8])
        .ok()
        .and_then(|hex| u32::from_str_radix(hex, 16).ok())
        .ok_or_else(|| "unreadable checksum".to_string())?;
    let json = &raw[9..];
    let actual = crc32fast::hash(json);
    if expected != actual {
        return Err(format!("checksum mismatch: expected {:08x}, got {:08x}", expected, actual));
    }
    serde_json::from_slice(json).map_err(|e| e.to_string())
}

/// Decodes raw records into positioned `WalRecord`s, applying the recovery
/// rules. The newest entry is held back until a higher sequence number
/// arrives, so a repeated sequence number can still replace it. Checkpoint
/// records seen while an entry is held wait behind it.
struct RecordCursor {
    records: std::vec::IntoIter<(u64, Bytes)>,
    ready: VecDeque<(u64, WalRecord)>,
    pending: Option<(u64, WalEntry)>,
    held: Vec<(u64, WalRecord)>,
    last_seq: Option<u64>,
    skipped: Option<(u64, String)>,
    failed: bool,
}

impl RecordCursor {
    fn new(records: Vec<(u64, Bytes)>) -> Self {
        Self {
            records: records.into_iter(),
            ready: VecDeque::new(),
            pending: None,
            held: Vec::new(),
            last_seq: None,
            skipped: None,
            failed: false,
        }
    }

    fn release(&mut self) {
        if let Some((p, entry)) = self.pending.take() {
            self.ready.push_back((p, WalRecord::Entry(entry)));
        }
        self.ready.extend(self.held.drain(..));
    }

    fn accept(&mut self, position: u64, entry: WalEntry) -> Result<()> {
        let seq = entry.sequence_number;
        match self.last_seq {
            Some(last) if seq == last => {
                warn!("WAL: record at position {} supersedes LSN {}", position, seq);
                self.pending = Some((position, entry));
                self.skipped = None;
                return Ok(());
            }
            Some(last) if seq != last + 1 => {
                let (at, reason) = match self.skipped.take() {
                    Some((at, reason)) => (at, format!("unreadable record ({}) hides LSN {}", reason, last + 1)),
                    None => (position, format!("expected LSN {}, found {}", last + 1, seq)),
                };
                return Err(PageKvError::WalCorruption { position: at, reason });
            }
            // Nothing readable precedes this entry. Only a log that starts
            // at LSN 1 can have lost a leading record to a torn write.
            None if seq != 1 => {
                if let Some((at, reason)) = self.skipped.take() {
                    return Err(PageKvError::WalCorruption {
                        position: at,
                        reason: format!("unreadable record ({}) precedes LSN {}", reason, seq),
                    });
                }
            }
            _ => {}
        }

        if let Some((at, reason)) = self.skipped.take() {
            warn!("WAL: skipping torn record at position {}: {}", at, reason);
        }
        self.release();
        self.last_seq = Some(seq);
        self.pending = Some((position, entry));
        Ok(())
    }
}

impl Iterator for RecordCursor {
    type Item = Result<(u64, WalRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(ready) = self.ready.pop_front() {
                return Some(Ok(ready));
            }
            if self.failed {
                return None;
            }

            let Some((position, raw)) = self.records.next() else {
                if let Some((at, reason)) = self.skipped.take() {
                    warn!("WAL: ignoring torn tail record at position {}: {}", at, reason);
                }
                self.release();
                return self.ready.pop_front().map(Ok);
            };

            match decode_record(&raw) {
                Err(reason) => {
                    if let Some((at, earlier)) = self.skipped.replace((position, reason)) {
                        warn!("WAL: skipping unreadable record at position {}: {}", at, earlier);
                    }
                }
                Ok(WalRecord::Checkpoint { up_to }) => {
                    if self.last_seq.is_none() {
                        self.last_seq = Some(up_to);
                    }
                    let record = (position, WalRecord::Checkpoint { up_to });
                    if self.pending.is_some() {
                        self.held.push(record);
                    } else {
                        self.ready.push_back(record);
                    }
                }
                Ok(WalRecord::Entry(entry)) => {
                    if let Err(e) = self.accept(position, entry) {
                        self.failed = true;
                        self.ready.clear();
                        return Some(Err(e));
                    }
                }
            }
        }
    }
}

/// Entries to re-apply after a restart, in ascending sequence order.
///
/// Log contents are read once when the replay is created; decoding happens
/// lazily as the iterator advances. Calling `WriteAheadLog::replay` again
/// starts a fresh pass.
pub struct WalReplay {
    cursor: RecordCursor,
    checkpoint_lsn: u64,
}

impl WalReplay {
    pub fn checkpoint_lsn(&self) -> u64 {
        self.checkpoint_lsn
    }
}

impl Iterator for WalReplay {
    type Item = Result<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.cursor.next()? {
                Ok((_, WalRecord::Entry(entry))) if entry.sequence_number > self.checkpoint_lsn => {
                    return Some(Ok(entry));
                }
                Ok(_) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

#[derive(Debug, Default)]
struct WalState {
    next_seq: u64,
    checkpoint_lsn: u64,
    checkpoint_position: Option<u64>,
    /// (sequence number, position) of every entry still in the log
    live: VecDeque<(u64, u64)>,
}

/// Write-Ahead Log implementation
pub struct WriteAheadLog {
    storage: Arc<dyn LogStorage>,
    io_timeout: Duration,
    state: Mutex<WalState>,

    // Mirrors of `state` readable without the lock
    lsn: AtomicU64,
    checkpoint_lsn: AtomicU64,
    entry_count: AtomicUsize,
}

impl WriteAheadLog {
    /// Open the log, restoring the sequence counter and checkpoint marker
    /// from whatever the log store already holds.
    pub async fn open(storage: Arc<dyn LogStorage>, config: &Config) -> Result<Self> {
        info!("Initializing WAL");
        let io_timeout = config.io_timeout();

        let records = with_timeout("wal_read", io_timeout, storage.read_from(0)).await?;
        let mut state = WalState::default();
        let mut last_seq = 0;

        for item in RecordCursor::new(records) {
            match item? {
                (position, WalRecord::Entry(entry)) => {
                    last_seq = entry.sequence_number;
                    state.live.push_back((entry.sequence_number, position));
                }
                (position, WalRecord::Checkpoint { up_to }) => {
                    if up_to >= state.checkpoint_lsn {
                        state.checkpoint_lsn = up_to;
                        state.checkpoint_position = Some(position);
                    }
                }
            }
        }
        state.next_seq = last_seq.max(state.checkpoint_lsn) + 1;

        info!(
            "WAL: {} entries on log, next LSN {}, checkpoint at LSN {}",
            state.live.len(),
            state.next_seq,
            state.checkpoint_lsn
        );

        Ok(Self {
            storage,
            io_timeout,
            lsn: AtomicU64::new(state.next_seq - 1),
            checkpoint_lsn: AtomicU64::new(state.checkpoint_lsn),
            entry_count: AtomicUsize::new(state.live.len()),
            state: Mutex::new(state),
        })
    }

    /// Append an entry and return its sequence number once it is durable.
    ///
    /// This is the durability point for every mutation. A failed or timed-out
    /// append does not consume the sequence number.
    pub async fn append(&self, operation: Operation, key: &[u8], value: Option<&[u8]>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let seq = state.next_seq;

        let entry = WalEntry {
            sequence_number: seq,
            operation,
            key: key.to_vec(),
            value: value.map(<[u8]>::to_vec),
        };
        let record = encode_record(&WalRecord::Entry(entry))?;

        let position = with_timeout("wal_append", self.io_timeout, self.storage.append(record)).await?;

        state.next_seq += 1;
        state.live.push_back((seq, position));
        self.lsn.store(seq, Ordering::SeqCst);
        self.entry_count.store(state.live.len(), Ordering::SeqCst);

        debug!("WAL: Appended {:?} at LSN {}", operation, seq);
        Ok(seq)
    }

    /// Entries above the current checkpoint marker, in sequence order.
    pub async fn replay(&self) -> Result<WalReplay> {
        info!("WAL: Starting replay for crash recovery");
        let checkpoint_lsn = self.state.lock().await.checkpoint_lsn;
        let records = with_timeout("wal_read", self.io_timeout, self.storage.read_from(0)).await?;
        Ok(WalReplay {
            cursor: RecordCursor::new(records),
            checkpoint_lsn,
        })
    }

    /// Durably record that every entry up to `up_to` is reflected in flushed
    /// pages. The marker never moves backwards.
    pub async fn checkpoint(&self, up_to: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        let last = state.next_seq - 1;
        if up_to > last {
            return Err(PageKvError::InvalidCheckpoint { requested: up_to, last });
        }
        if up_to < state.checkpoint_lsn {
            debug!("WAL: checkpoint {} is behind marker {}, ignoring", up_to, state.checkpoint_lsn);
            return Ok(());
        }

        let record = encode_record(&WalRecord::Checkpoint { up_to })?;
        let position = with_timeout("wal_append", self.io_timeout, self.storage.append(record)).await?;

        state.checkpoint_lsn = up_to;
        state.checkpoint_position = Some(position);
        self.checkpoint_lsn.store(up_to, Ordering::SeqCst);

        info!("WAL: Checkpoint created at LSN {}", up_to);
        Ok(())
    }

    /// Discard log storage covered by the latest checkpoint.
    ///
    /// Keeps the checkpoint record itself and every entry above the marker.
    pub async fn clear(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(checkpoint_position) = state.checkpoint_position else {
            debug!("WAL: no checkpoint yet, nothing to clear");
            return Ok(());
        };

        let marker = state.checkpoint_lsn;
        let cut = state
            .live
            .iter()
            .find(|(seq, _)| *seq > marker)
            .map_or(checkpoint_position, |&(_, position)| position.min(checkpoint_position));

        info!("WAL: Clearing log before position {} (LSN <= {})", cut, marker);
        with_timeout("wal_clear", self.io_timeout, self.storage.discard_before(cut)).await?;

        state.live.retain(|&(_, position)| position >= cut);
        self.entry_count.store(state.live.len(), Ordering::SeqCst);
        Ok(())
    }

    /// Last assigned sequence number (0 before the first append)
    pub fn current_lsn(&self) -> u64 {
        self.lsn.load(Ordering::SeqCst)
    }

    pub fn checkpoint_lsn(&self) -> u64 {
        self.checkpoint_lsn.load(Ordering::SeqCst)
    }

    /// Entries physically held by the log
    pub fn entry_count(&self) -> usize {
        self.entry_count.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryLogStorage;
    use tokio_test::{assert_err, assert_ok};

    async fn open(log: &MemoryLogStorage) -> WriteAheadLog {
        WriteAheadLog::open(Arc::new(log.clone()), &Config::default())
            .await
            .unwrap()
    }

    async fn replayed(wal: &WriteAheadLog) -> Vec<u64> {
        wal.replay()
            .await
            .unwrap()
            .map(|entry| entry.unwrap().sequence_number)
            .collect()
    }

    #[tokio::test]
    async fn test_sequence_numbers_are_contiguous() {
        let log = MemoryLogStorage::new();
        let wal = open(&log).await;

        assert_eq!(wal.append(Operation::Set, b"k1", Some(b"v1")).await.unwrap(), 1);
        assert_eq!(wal.append(Operation::Set, b"k2", Some(b"v2")).await.unwrap(), 2);
        assert_eq!(wal.append(Operation::Delete, b"k1", None).await.unwrap(), 3);
        assert_eq!(wal.current_lsn(), 3);
        assert_eq!(wal.entry_count(), 3);

        let entries: Vec<WalEntry> = wal.replay().await.unwrap().map(|e| e.unwrap()).collect();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].operation, Operation::Delete);
        assert_eq!(entries[2].value, None);
        assert_eq!(entries[1].value.as_deref(), Some(&b"v2"[..]));
    }

    #[tokio::test]
    async fn test_failed_append_does_not_consume_sequence() {
        let log = MemoryLogStorage::new();
        let wal = open(&log).await;

        wal.append(Operation::Set, b"a", Some(b"1")).await.unwrap();
        log.fail_next_appends(1);
        let err = assert_err!(wal.append(Operation::Set, b"b", Some(b"2")).await);
        assert!(err.is_retryable());
        assert_eq!(wal.append(Operation::Set, b"b", Some(b"2")).await.unwrap(), 2);
        assert_eq!(replayed(&wal).await, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_checkpoint_limits_replay() {
        let log = MemoryLogStorage::new();
        let wal = open(&log).await;

        for i in 0..4u8 {
            wal.append(Operation::Set, &[i], Some(b"v")).await.unwrap();
        }
        wal.checkpoint(4).await.unwrap();
        wal.append(Operation::Set, b"late", Some(b"v")).await.unwrap();

        assert_eq!(replayed(&wal).await, vec![5]);
        assert_eq!(wal.checkpoint_lsn(), 4);
    }

    #[tokio::test]
    async fn test_clear_keeps_entries_above_marker() {
        let log = MemoryLogStorage::new();
        let wal = open(&log).await;

        for i in 0..5u8 {
            wal.append(Operation::Set, &[i], Some(b"v")).await.unwrap();
        }
        wal.checkpoint(3).await.unwrap();
        wal.clear().await.unwrap();

        // entries 4 and 5 plus the checkpoint record
        assert_eq!(log.record_count(), 3);
        assert_eq!(wal.entry_count(), 2);
        assert_eq!(replayed(&wal).await, vec![4, 5]);
    }

    #[tokio::test]
    async fn test_reopen_continues_after_clear() {
        let log = MemoryLogStorage::new();
        {
            let wal = open(&log).await;
            for i in 0..3u8 {
                wal.append(Operation::Set, &[i], Some(b"v")).await.unwrap();
            }
            wal.checkpoint(3).await.unwrap();
            wal.clear().await.unwrap();
            assert_eq!(log.record_count(), 1);
        }

        let wal = open(&log).await;
        assert_eq!(wal.current_lsn(), 3);
        assert_eq!(wal.checkpoint_lsn(), 3);
        assert_eq!(wal.entry_count(), 0);
        assert!(replayed(&wal).await.is_empty());
        assert_eq!(wal.append(Operation::Set, b"x", Some(b"y")).await.unwrap(), 4);
        assert_eq!(replayed(&wal).await, vec![4]);
    }

    #[tokio::test]
    async fn test_checkpoint_beyond_last_lsn_is_rejected() {
        let log = MemoryLogStorage::new();
        let wal = open(&log).await;

        wal.append(Operation::Set, b"a", Some(b"1")).await.unwrap();
        let err = assert_err!(wal.checkpoint(5).await);
        assert!(matches!(err, PageKvError::InvalidCheckpoint { requested: 5, last: 1 }));
        assert_ok!(wal.clear().await);
        assert_eq!(log.record_count(), 1);
    }

    #[tokio::test]
    async fn test_torn_records_are_skipped() {
        let log = MemoryLogStorage::new();
        {
            let wal = open(&log).await;
            wal.append(Operation::Set, b"a", Some(b"1")).await.unwrap();
        }
        // a crash mid-append leaves a partial record behind
        log.append(Bytes::from_static(b"1234abcd {\"type\":\"en")).await.unwrap();

        let wal = open(&log).await;
        assert_eq!(wal.current_lsn(), 1);
        assert_eq!(wal.append(Operation::Set, b"b", Some(b"2")).await.unwrap(), 2);

        let reopened = open(&log).await;
        assert_eq!(replayed(&reopened).await, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_corruption_hiding_an_entry_is_fatal() {
        let log = MemoryLogStorage::new();
        {
            let wal = open(&log).await;
            wal.append(Operation::Set, b"a", Some(b"1")).await.unwrap();
            wal.append(Operation::Set, b"b", Some(b"2")).await.unwrap();
            wal.append(Operation::Set, b"c", Some(b"3")).await.unwrap();
        }
        let records = log.read_from(0).await.unwrap();
        let corrupted = MemoryLogStorage::new();
        for (position, record) in records {
            let record = if position == 1 {
                let mut bytes = record.to_vec();
                let last = bytes.len() - 2;
                bytes[last] ^= 0x20;
                Bytes::from(bytes)
            } else {
                record
            };
            corrupted.append(record).await.unwrap();
        }

        let result = WriteAheadLog::open(Arc::new(corrupted), &Config::default()).await;
        assert!(matches!(result, Err(PageKvError::WalCorruption { position: 1, .. })));
    }

    #[tokio::test]
    async fn test_corruption_of_first_record_is_fatal() {
        let log = MemoryLogStorage::new();
        {
            let wal = open(&log).await;
            wal.append(Operation::Set, b"a", Some(b"1")).await.unwrap();
            wal.append(Operation::Set, b"b", Some(b"2")).await.unwrap();
            wal.append(Operation::Set, b"c", Some(b"3")).await.unwrap();
        }
        let records = log.read_from(0).await.unwrap();
        let corrupted = MemoryLogStorage::new();
        for (position, record) in records {
            let record = if position == 0 {
                let mut bytes = record.to_vec();
                let last = bytes.len() - 2;
                bytes[last] ^= 0x20;
                Bytes::from(bytes)
            } else {
                record
            };
            corrupted.append(record).await.unwrap();
        }

        let result = WriteAheadLog::open(Arc::new(corrupted), &Config::default()).await;
        assert!(matches!(result, Err(PageKvError::WalCorruption { position: 0, .. })));

        // A torn write ahead of LSN 1 hides nothing.
        let torn_start = MemoryLogStorage::new();
        torn_start.append(Bytes::from_static(b"0000 {\"Ent")).await.unwrap();
        let entry = encode_record(&WalRecord::Entry(WalEntry {
            sequence_number: 1,
            operation: Operation::Set,
            key: b"a".to_vec(),
            value: Some(b"1".to_vec()),
        }))
        .unwrap();
        torn_start.append(entry).await.unwrap();
        let wal = open(&torn_start).await;
        assert_eq!(wal.current_lsn(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_sequence_keeps_later_record() {
        let log = MemoryLogStorage::new();
        let first = encode_record(&WalRecord::Entry(WalEntry {
            sequence_number: 1,
            operation: Operation::Set,
            key: b"k".to_vec(),
            value: Some(b"old".to_vec()),
        }))
        .unwrap();
        let second = encode_record(&WalRecord::Entry(WalEntry {
            sequence_number: 1,
            operation: Operation::Set,
            key: b"k".to_vec(),
            value: Some(b"new".to_vec()),
        }))
        .unwrap();
        log.append(first).await.unwrap();
        log.append(second).await.unwrap();

        let wal = open(&log).await;
        assert_eq!(wal.current_lsn(), 1);
        let entries: Vec<WalEntry> = wal.replay().await.unwrap().map(|e| e.unwrap()).collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].value.as_deref(), Some(&b"new"[..]));
    }

    #[tokio::test]
    async fn test_duplicate_across_checkpoint_record_replays_once() {
        let entry = |seq: u64, value: &[u8]| {
            encode_record(&WalRecord::Entry(WalEntry {
                sequence_number: seq,
                operation: Operation::Set,
                key: b"k".to_vec(),
                value: Some(value.to_vec()),
            }))
            .unwrap()
        };
        let log = MemoryLogStorage::new();
        log.append(entry(1, b"first")).await.unwrap();
        log.append(entry(2, b"old")).await.unwrap();
        log.append(encode_record(&WalRecord::Checkpoint { up_to: 1 }).unwrap())
            .await
            .unwrap();
        log.append(entry(2, b"new")).await.unwrap();

        let wal = open(&log).await;
        assert_eq!(wal.current_lsn(), 2);
        assert_eq!(wal.checkpoint_lsn(), 1);
        let entries: Vec<WalEntry> = wal.replay().await.unwrap().map(|e| e.unwrap()).collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].sequence_number, 2);
        assert_eq!(entries[0].value.as_deref(), Some(&b"new"[..]));
    }

    #[test]
    fn test_record_checksum() {
        let record = WalRecord::Checkpoint { up_to: 12 };
        let encoded = encode_record(&record).unwrap();
        assert_eq!(decode_record(&encoded).unwrap(), record);

        let mut damaged = encoded.to_vec();
        damaged[12] ^= 0x01;
        assert!(decode_record(&damaged).is_err());
    }
}
