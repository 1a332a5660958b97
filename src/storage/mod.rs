//! Storage module for persisting crawl data
//!
//! This module handles all on-disk state of a crawl:
//! - The crawl database holding the latest record per key
//! - The advisory lock guarding the crawl database between runs
//! - Per-round segments with fetch outcomes, content, links and text
//! - Merging a segment back into the crawl database
//! - Round history for statistics and resumption

mod crawldb;
mod schema;
mod segment;
mod traits;

pub use crawldb::{CrawlDb, CRAWLDB_FILE, SEGMENTS_DIR};
pub use schema::STAGING_TABLES;
pub use segment::{SegmentCounts, SegmentReader, SegmentWriter, DEFAULT_BUFFER_SIZE};
pub use traits::{SegmentSink, StorageError, StorageResult};

use crate::record::{FetchRecord, FetchStatus};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::Row;

/// Raw body of a fetched page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentEntry {
    pub key: String,
    pub url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

/// Text and structured output produced by extraction
#[derive(Debug, Clone, PartialEq)]
pub struct TextEntry {
    pub key: String,
    pub url: String,
    pub text: Option<String>,
    pub output: Option<serde_json::Value>,
}

/// Current state of the crawl database lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockState {
    pub locked: bool,
    pub holder: Option<String>,
    /// File name of the segment the holder writes to
    pub segment: Option<String>,
    pub heartbeat: Option<DateTime<Utc>>,
}

/// Proof that this run holds the crawl database lock
///
/// Returned by [`CrawlDb::lock`]; heartbeats, merges and the unlock only
/// touch the lock while it still names this holder and segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    holder: String,
    segment: String,
}

impl LockToken {
    pub(crate) fn new(holder: String, segment: String) -> Self {
        Self { holder, segment }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// File name of the segment the lock was taken for
    pub fn segment(&self) -> &str {
        &self.segment
    }
}

/// What a merge applied to the crawl database
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Fetch outcomes upserted
    pub outcomes: usize,
    /// Link children that were new to the crawl database
    pub linked: usize,
}

/// Represents one round of a crawl
#[derive(Debug, Clone)]
pub struct RoundRecord {
    pub id: i64,
    pub depth: u32,
    pub segment: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub config_hash: String,
    pub status: RoundStatus,
    pub generated: u64,
    pub fetched: u64,
    pub failed: u64,
    pub abort_reason: Option<String>,
}

/// Counters recorded when a round finishes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundSummary {
    pub generated: u64,
    pub fetched: u64,
    pub failed: u64,
    pub abort_reason: Option<String>,
}

/// Status of a round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundStatus {
    Running,
    Completed,
    /// Cut short by the watchdog or a stop request; outcomes were still merged
    Aborted,
    /// The process died mid-round; recovered by the next run
    Interrupted,
    Failed,
}

impl RoundStatus {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
            Self::Interrupted => "interrupted",
            Self::Failed => "failed",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "aborted" => Some(Self::Aborted),
            "interrupted" => Some(Self::Interrupted),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Columns of a stored record, in the order [`record_from_row`] reads them
pub(crate) const RECORD_COLUMNS: &str =
    "key, url, status, fetch_time, retry_count, execute_count, http_code, location, metadata";

fn conversion_error(
    idx: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

/// Reads the record columns starting at `offset`
pub(crate) fn record_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<FetchRecord> {
    let key: String = row.get(offset)?;
    let url: String = row.get(offset + 1)?;

    let status_str: String = row.get(offset + 2)?;
    let status = FetchStatus::from_db_string(&status_str)
        .ok_or_else(|| conversion_error(offset + 2, format!("unknown status '{}'", status_str)))?;

    let fetch_time = row
        .get::<_, Option<String>>(offset + 3)?
        .map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| conversion_error(offset + 3, e))
        })
        .transpose()?;

    let metadata: String = row.get(offset + 8)?;
    let metadata =
        serde_json::from_str(&metadata).map_err(|e| conversion_error(offset + 8, e))?;

    let mut record = FetchRecord::from_parts(url, key, status);
    record.fetch_time = fetch_time;
    record.retry_count = row.get(offset + 4)?;
    record.execute_count = row.get(offset + 5)?;
    record.http_code = row.get(offset + 6)?;
    record.location = row.get(offset + 7)?;
    record.metadata = metadata;
    Ok(record)
}

/// Column values of a record that need encoding before binding
pub(crate) struct EncodedRecord {
    pub status: &'static str,
    pub fetch_time: Option<String>,
    pub metadata: String,
}

pub(crate) fn encode_record(record: &FetchRecord) -> StorageResult<EncodedRecord> {
    Ok(EncodedRecord {
        status: record.status.to_db_string(),
        fetch_time: record.fetch_time.map(|t| t.to_rfc3339()),
        metadata: serde_json::to_string(&record.metadata)?,
    })
}
