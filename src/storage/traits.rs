//! Storage traits and error types
//!
//! This module defines the sink a round writes its outcomes to and the error
//! type shared by the crawl database and segments.

use crate::record::FetchRecord;
use crate::storage::{ContentEntry, TextEntry};
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Crawl database is locked by {holder} (last heartbeat {heartbeat})")]
    Locked { holder: String, heartbeat: String },

    #[error("Crawl database lock for segment {segment} was taken over by another run")]
    LockLost { segment: String },

    #[error("Segment {0} is closed")]
    SegmentClosed(PathBuf),

    #[error("Round not found: {0}")]
    RoundNotFound(i64),

    #[error("Lock poisoned: {0}")]
    Poisoned(&'static str),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Destination for everything one round produces
///
/// The bundled implementation is [`SegmentWriter`](crate::storage::SegmentWriter).
/// Implementations are shared by all workers of a round and must accept
/// concurrent writes.
pub trait SegmentSink: Send + Sync {
    /// Appends the outcome of a fetch attempt
    fn write_fetch(&self, record: &FetchRecord) -> StorageResult<()>;

    /// Appends a raw page body
    fn write_content(&self, content: &ContentEntry) -> StorageResult<()>;

    /// Appends the records discovered on the page identified by `parent_key`
    fn write_links(&self, parent_key: &str, links: &[FetchRecord]) -> StorageResult<()>;

    /// Appends extracted text and structured output
    fn write_text(&self, text: &TextEntry) -> StorageResult<()>;
}
