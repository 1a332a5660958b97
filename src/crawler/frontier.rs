//! Sources of records for a round

use crate::record::FetchRecord;
use crate::storage::CrawlDb;
use crate::Result;
use std::collections::VecDeque;
use std::sync::Arc;

/// Records a round should attempt
///
/// `next` may block (for example on database I/O) and is only ever called
/// from the feeder's blocking thread. Once it returns `Ok(None)` it keeps
/// doing so.
pub trait Frontier: Send {
    fn next(&mut self) -> Result<Option<FetchRecord>>;

    /// Records handed out so far
    fn total_generated(&self) -> usize;
}

/// In-memory frontier over a fixed list
#[derive(Debug, Default)]
pub struct ListFrontier {
    records: VecDeque<FetchRecord>,
    generated: usize,
}

impl ListFrontier {
    pub fn new(records: impl IntoIterator<Item = FetchRecord>) -> Self {
        Self {
            records: records.into_iter().collect(),
            generated: 0,
        }
    }

    pub fn from_urls<S: AsRef<str>>(urls: impl IntoIterator<Item = S>) -> Self {
        Self::new(urls.into_iter().map(|u| FetchRecord::new(u.as_ref())))
    }
}

impl Frontier for ListFrontier {
    fn next(&mut self) -> Result<Option<FetchRecord>> {
        let record = self.records.pop_front();
        if record.is_some() {
            self.generated += 1;
        }
        Ok(record)
    }

    fn total_generated(&self) -> usize {
        self.generated
    }
}

/// Records per database page
const DEFAULT_BATCH_SIZE: usize = 256;

/// Generates a round's work from the crawl database
///
/// Pages through the database in insertion order, yielding records that are
/// unfetched or linked, and gone records that have not yet used up
/// `max_execute_count` attempts. Stops after `top_n` records when set.
pub struct CrawlDbFrontier {
    db: Arc<CrawlDb>,
    cursor: i64,
    buffer: VecDeque<FetchRecord>,
    batch_size: usize,
    top_n: Option<usize>,
    max_execute_count: u32,
    generated: usize,
    exhausted: bool,
}

impl CrawlDbFrontier {
    pub fn new(db: Arc<CrawlDb>, top_n: Option<usize>, max_execute_count: u32) -> Self {
        Self {
            db,
            cursor: 0,
            buffer: VecDeque::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            top_n,
            max_execute_count,
            generated: 0,
            exhausted: false,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    fn fill(&mut self) -> Result<()> {
        let batch = self
            .db
            .pending_batch(self.cursor, self.batch_size, self.max_execute_count)?;
        match batch.last() {
            Some((rowid, _)) => self.cursor = *rowid,
            None => self.exhausted = true,
        }
        self.buffer.extend(batch.into_iter().map(|(_, record)| record));
        Ok(())
    }
}

impl Frontier for CrawlDbFrontier {
    fn next(&mut self) -> Result<Option<FetchRecord>> {
        if self.top_n.map_or(false, |n| self.generated >= n) {
            return Ok(None);
        }
        if self.buffer.is_empty() && !self.exhausted {
            self.fill()?;
        }

        let record = self.buffer.pop_front();
        if record.is_some() {
            self.generated += 1;
        }
        Ok(record)
    }

    fn total_generated(&self) -> usize {
        self.generated
    }
}
