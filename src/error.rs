use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::kvstore::EngineState;

#[derive(Error, Debug)]
pub enum PageKvError {
    #[error("Remote I/O failed during {op}: {reason}")]
    Io { op: &'static str, reason: String },

    #[error("Remote I/O timed out during {op} after {timeout:?}")]
    Timeout { op: &'static str, timeout: Duration },

    #[error("Malformed page {page_id}: expected {expected} bytes, got {actual}")]
    MalformedPage {
        page_id: u64,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid page size: expected {expected} bytes, got {actual}")]
    InvalidPageSize { expected: usize, actual: usize },

    #[error("Page {page_id} checksum mismatch: expected {expected:x}, got {actual:x}")]
    ChecksumMismatch {
        page_id: u64,
        expected: u32,
        actual: u32,
    },

    #[error("Invalid format in page {page_id}: {reason}")]
    InvalidPageFormat { page_id: u64, reason: String },

    #[error("Key too large: {size} bytes (max: {max})")]
    KeyTooLarge { size: usize, max: usize },

    #[error("Value too large: {size} bytes (max: {max})")]
    ValueTooLarge { size: usize, max: usize },

    #[error("Block storage is full ({max_pages} pages)")]
    StorageFull { max_pages: u64 },

    #[error("Buffer pool has no frames to allocate")]
    BufferPoolExhausted,

    #[error("WAL corruption detected at position {position}: {reason}")]
    WalCorruption { position: u64, reason: String },

    #[error("Cannot checkpoint up to LSN {requested}: last assigned LSN is {last}")]
    InvalidCheckpoint { requested: u64, last: u64 },

    #[error("Engine is not serving requests (state: {state})")]
    NotReady { state: EngineState },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

pub type Result<T> = std::result::Result<T, PageKvError>;

/// Coarse classification used by callers deciding whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Remote collaborator failed or timed out. Retryable.
    Io,
    /// Bad input or bad bytes. Fatal to the operation, not the process.
    Validation,
    /// The engine cannot serve the call in its current state.
    Unavailable,
    Config,
}

impl PageKvError {
    pub(crate) fn io(op: &'static str, err: impl fmt::Display) -> Self {
        PageKvError::Io {
            op,
            reason: err.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PageKvError::Io { .. }
            | PageKvError::Timeout { .. }
            | PageKvError::MalformedPage { .. } => ErrorKind::Io,
            PageKvError::InvalidPageSize { .. }
            | PageKvError::ChecksumMismatch { .. }
            | PageKvError::InvalidPageFormat { .. }
            | PageKvError::KeyTooLarge { .. }
            | PageKvError::ValueTooLarge { .. }
            | PageKvError::WalCorruption { .. }
            | PageKvError::InvalidCheckpoint { .. }
            | PageKvError::Serialization(_) => ErrorKind::Validation,
            PageKvError::StorageFull { .. }
            | PageKvError::BufferPoolExhausted
            | PageKvError::NotReady { .. } => ErrorKind::Unavailable,
            PageKvError::ConfigError(_) => ErrorKind::Config,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Io
    }
}

#[cfg(feature = "azure")]
impl From<azure_core::Error> for PageKvError {
    fn from(err: azure_core::Error) -> Self {
        PageKvError::io("azure", err)
    }
}
