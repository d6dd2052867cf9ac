/// Page layouts
///
/// Every page is 4KB. Page 0 is the header page, written at checkpoint time;
/// every other page holds at most one key-value record.
///
/// Record page:
/// [Magic: 4 bytes] [Version: 2 bytes] [Checksum: 4 bytes] [LSN: 8 bytes]
/// [Kind: 1 byte] [Key Length: 4 bytes] [Value Length: 4 bytes]
/// [Key Data] [Value Data] [Padding to 4096]
///
/// The checksum covers everything after the checksum field.

use crate::error::{PageKvError, Result};

pub const PAGE_SIZE: usize = 4096;

pub type PageId = u64;

pub const HEADER_PAGE_ID: PageId = 0;
pub const FIRST_DATA_PAGE_ID: PageId = 1;

const RECORD_MAGIC: u32 = 0x5245_4B50; // "PKER"
const HEADER_MAGIC: u32 = 0x4844_4B50; // "PKDH"
const VERSION: u16 = 1;

const CHECKSUM_OFFSET: usize = 6;
const CHECKSUMMED_FROM: usize = 10;
const LSN_OFFSET: usize = 10;
const KIND_OFFSET: usize = 18;
const KEY_LEN_OFFSET: usize = 19;
const VALUE_LEN_OFFSET: usize = 23;

pub const RECORD_HEADER_SIZE: usize = 27;
pub const MAX_RECORD_PAYLOAD: usize = PAGE_SIZE - RECORD_HEADER_SIZE;

const KIND_LIVE: u8 = 1;
const KIND_TOMBSTONE: u8 = 2;

/// Decoded contents of a data page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordPage {
    /// Never written (all zeros)
    Empty,
    Live { key: Vec<u8>, value: Vec<u8>, lsn: u64 },
    Tombstone { key: Vec<u8>, lsn: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderPage {
    pub next_page_id: PageId,
    pub checkpoint_lsn: u64,
}

/// Reject records that cannot fit a single page.
pub fn check_record_size(key: &[u8], value: &[u8], max_key_size: usize) -> Result<()> {
    if key.len() > max_key_size {
        return Err(PageKvError::KeyTooLarge {
            size: key.len(),
            max: max_key_size,
        });
    }
    let max_value = MAX_RECORD_PAYLOAD - key.len();
    if value.len() > max_value {
        return Err(PageKvError::ValueTooLarge {
            size: value.len(),
            max: max_value,
        });
    }
    Ok(())
}

/// Encode a record; `value` of `None` produces a tombstone.
pub fn encode_record(key: &[u8], value: Option<&[u8]>, lsn: u64) -> Result<Vec<u8>> {
    let value_bytes = value.unwrap_or(&[]);
    if key.len() + value_bytes.len() > MAX_RECORD_PAYLOAD {
        return Err(PageKvError::ValueTooLarge {
            size: value_bytes.len(),
            max: MAX_RECORD_PAYLOAD.saturating_sub(key.len()),
        });
    }

    let mut page = vec![0u8; PAGE_SIZE];
    page[0..4].copy_from_slice(&RECORD_MAGIC.to_le_bytes());
    page[4..6].copy_from_slice(&VERSION.to_le_bytes());
    page[LSN_OFFSET..LSN_OFFSET + 8].copy_from_slice(&lsn.to_le_bytes());
    page[KIND_OFFSET] = if value.is_some() { KIND_LIVE } else { KIND_TOMBSTONE };
    page[KEY_LEN_OFFSET..KEY_LEN_OFFSET + 4].copy_from_slice(&(key.len() as u32).to_le_bytes());
    page[VALUE_LEN_OFFSET..VALUE_LEN_OFFSET + 4]
        .copy_from_slice(&(value_bytes.len() as u32).to_le_bytes());

    let key_start = RECORD_HEADER_SIZE;
    let value_start = key_start + key.len();
    page[key_start..value_start].copy_from_slice(key);
    page[value_start..value_start + value_bytes.len()].copy_from_slice(value_bytes);

    seal(&mut page);
    Ok(page)
}

pub fn decode_record(page_id: PageId, page: &[u8]) -> Result<RecordPage> {
    if page.len() != PAGE_SIZE {
        return Err(PageKvError::InvalidPageSize {
            expected: PAGE_SIZE,
            actual: page.len(),
        });
    }
    if page.iter().all(|&b| b == 0) {
        return Ok(RecordPage::Empty);
    }

    verify(page_id, page, RECORD_MAGIC)?;

    let lsn = read_u64(page, LSN_OFFSET);
    let key_len = read_u32(page, KEY_LEN_OFFSET) as usize;
    let value_len = read_u32(page, VALUE_LEN_OFFSET) as usize;
    if key_len + value_len > MAX_RECORD_PAYLOAD {
        return Err(PageKvError::InvalidPageFormat {
            page_id,
            reason: format!("record length {} exceeds page", key_len + value_len),
        });
    }

    let key_start = RECORD_HEADER_SIZE;
    let value_start = key_start + key_len;
    let key = page[key_start..value_start].to_vec();

    match page[KIND_OFFSET] {
        KIND_LIVE => Ok(RecordPage::Live {
            key,
            value: page[value_start..value_start + value_len].to_vec(),
            lsn,
        }),
        KIND_TOMBSTONE => Ok(RecordPage::Tombstone { key, lsn }),
        other => Err(PageKvError::InvalidPageFormat {
            page_id,
            reason: format!("unknown record kind {}", other),
        }),
    }
}

pub fn encode_header(header: &HeaderPage) -> Vec<u8> {
    let mut page = vec![0u8; PAGE_SIZE];
    page[0..4].copy_from_slice(&HEADER_MAGIC.to_le_bytes());
    page[4..6].copy_from_slice(&VERSION.to_le_bytes());
    page[10..18].copy_from_slice(&header.next_page_id.to_le_bytes());
    page[18..26].copy_from_slice(&header.checkpoint_lsn.to_le_bytes());
    seal(&mut page);
    page
}

/// Returns `None` for a store that has never been checkpointed.
pub fn decode_header(page: &[u8]) -> Result<Option<HeaderPage>> {
    if page.len() != PAGE_SIZE {
        return Err(PageKvError::InvalidPageSize {
            expected: PAGE_SIZE,
            actual: page.len(),
        });
    }
    if page.iter().all(|&b| b == 0) {
        return Ok(None);
    }

    verify(HEADER_PAGE_ID, page, HEADER_MAGIC)?;

    Ok(Some(HeaderPage {
        next_page_id: read_u64(page, 10),
        checkpoint_lsn: read_u64(page, 18),
    }))
}

fn seal(page: &mut [u8]) {
    let checksum = crc32fast::hash(&page[CHECKSUMMED_FROM..]);
    page[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&checksum.to_le_bytes());
}

fn verify(page_id: PageId, page: &[u8], magic: u32) -> Result<()> {
    let found = read_u32(page, 0);
    if found != magic {
        return Err(PageKvError::InvalidPageFormat {
            page_id,
            reason: format!("invalid magic number: {:#x}", found),
        });
    }

    let version = u16::from_le_bytes([page[4], page[5]]);
    if version != VERSION {
        return Err(PageKvError::InvalidPageFormat {
            page_id,
            reason: format!("unsupported version: {}", version),
        });
    }

    let stored = read_u32(page, CHECKSUM_OFFSET);
    let computed = crc32fast::hash(&page[CHECKSUMMED_FROM..]);
    if stored != computed {
        return Err(PageKvError::ChecksumMismatch {
            page_id,
            expected: stored,
            actual: computed,
        });
    }
    Ok(())
}

fn read_u32(page: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&page[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64(page: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&page[offset..offset + 8]);
    u64::from_le_bytes(buf)
}
