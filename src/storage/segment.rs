//! Per-round segments
//!
//! A segment is a SQLite file under `<crawl_path>/segments/` written once by
//! the workers of a single round. Rows are buffered in memory and flushed in
//! one transaction whenever the buffer fills and when the segment closes.

use crate::record::FetchRecord;
use crate::storage::schema::{initialize_segment_schema, table_exists, STAGING_TABLES};
use crate::storage::traits::{SegmentSink, StorageError, StorageResult};
use crate::storage::{encode_record, record_from_row, ContentEntry, TextEntry, RECORD_COLUMNS};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// Rows buffered before a flush
pub const DEFAULT_BUFFER_SIZE: usize = 64;

/// Number of rows in each segment stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentCounts {
    pub fetch: usize,
    pub content: usize,
    pub links: usize,
    pub text: usize,
}

#[derive(Default)]
struct Pending {
    fetch: Vec<FetchRecord>,
    content: Vec<ContentEntry>,
    links: Vec<(String, FetchRecord)>,
    text: Vec<TextEntry>,
}

impl Pending {
    fn len(&self) -> usize {
        self.fetch.len() + self.content.len() + self.links.len() + self.text.len()
    }
}

struct WriterState {
    /// `None` once the segment is closed
    conn: Option<Connection>,
    pending: Pending,
    written: SegmentCounts,
}

/// Buffered writer for one round's segment
pub struct SegmentWriter {
    path: PathBuf,
    buffer_size: usize,
    state: Mutex<WriterState>,
}

impl SegmentWriter {
    /// Creates the segment file with the default buffer size
    pub fn create(path: &Path) -> StorageResult<Self> {
        Self::with_buffer_size(path, DEFAULT_BUFFER_SIZE)
    }

    /// Creates the segment file, flushing every `buffer_size` rows
    pub fn with_buffer_size(path: &Path, buffer_size: usize) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        ",
        )?;
        initialize_segment_schema(&conn)?;

        debug!("Opened segment {}", path.display());

        Ok(Self {
            path: path.to_path_buf(),
            buffer_size: buffer_size.max(1),
            state: Mutex::new(WriterState {
                conn: Some(conn),
                pending: Pending::default(),
                written: SegmentCounts::default(),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn state(&self) -> StorageResult<MutexGuard<'_, WriterState>> {
        self.state
            .lock()
            .map_err(|_| StorageError::Poisoned("segment writer"))
    }

    fn push(&self, add: impl FnOnce(&mut Pending)) -> StorageResult<()> {
        let mut state = self.state()?;
        if state.conn.is_none() {
            return Err(StorageError::SegmentClosed(self.path.clone()));
        }
        add(&mut state.pending);
        if state.pending.len() >= self.buffer_size {
            flush_locked(&mut state)?;
        }
        Ok(())
    }

    /// Writes all buffered rows
    pub fn flush(&self) -> StorageResult<()> {
        let mut state = self.state()?;
        flush_locked(&mut state)
    }

    /// Flushes and closes the segment
    ///
    /// Closing twice is harmless. Every later write fails with
    /// [`StorageError::SegmentClosed`].
    pub fn close(&self) -> StorageResult<SegmentCounts> {
        let mut state = self.state()?;
        if state.conn.is_none() {
            return Ok(state.written);
        }

        flush_locked(&mut state)?;
        if let Some(conn) = state.conn.take() {
            conn.close().map_err(|(_, e)| e)?;
        }

        debug!(
            "Closed segment {} ({} fetch, {} links, {} content, {} text)",
            self.path.display(),
            state.written.fetch,
            state.written.links,
            state.written.content,
            state.written.text
        );
        Ok(state.written)
    }

    pub fn is_closed(&self) -> bool {
        self.state().map(|s| s.conn.is_none()).unwrap_or(true)
    }

    /// Rows accepted so far, flushed or not
    pub fn counts(&self) -> StorageResult<SegmentCounts> {
        let state = self.state()?;
        Ok(SegmentCounts {
            fetch: state.written.fetch + state.pending.fetch.len(),
            content: state.written.content + state.pending.content.len(),
            links: state.written.links + state.pending.links.len(),
            text: state.written.text + state.pending.text.len(),
        })
    }
}

fn flush_locked(state: &mut WriterState) -> StorageResult<()> {
    if state.pending.len() == 0 {
        return Ok(());
    }
    let conn = match state.conn.as_mut() {
        Some(conn) => conn,
        None => return Ok(()),
    };

    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare_cached(&format!(
            "INSERT INTO fetch ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            RECORD_COLUMNS
        ))?;
        for record in &state.pending.fetch {
            let enc = encode_record(record)?;
            stmt.execute(params![
                record.key(),
                record.url(),
                enc.status,
                enc.fetch_time,
                record.retry_count,
                record.execute_count,
                record.http_code,
                record.location,
                enc.metadata,
            ])?;
        }

        let mut stmt = tx.prepare_cached(&format!(
            "INSERT INTO parse_links (parent_key, {}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            RECORD_COLUMNS
        ))?;
        for (parent_key, record) in &state.pending.links {
            let enc = encode_record(record)?;
            stmt.execute(params![
                parent_key,
                record.key(),
                record.url(),
                enc.status,
                enc.fetch_time,
                record.retry_count,
                record.execute_count,
                record.http_code,
                record.location,
                enc.metadata,
            ])?;
        }

        let mut stmt = tx.prepare_cached(
            "INSERT INTO content (key, url, content_type, body) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for entry in &state.pending.content {
            stmt.execute(params![entry.key, entry.url, entry.content_type, entry.body])?;
        }

        let mut stmt = tx.prepare_cached(
            "INSERT INTO parse_text (key, url, text, output) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for entry in &state.pending.text {
            let output = entry.output.as_ref().map(serde_json::to_string).transpose()?;
            stmt.execute(params![entry.key, entry.url, entry.text, output])?;
        }
    }
    tx.commit()?;

    let pending = std::mem::take(&mut state.pending);
    state.written.fetch += pending.fetch.len();
    state.written.links += pending.links.len();
    state.written.content += pending.content.len();
    state.written.text += pending.text.len();
    Ok(())
}

impl SegmentSink for SegmentWriter {
    fn write_fetch(&self, record: &FetchRecord) -> StorageResult<()> {
        self.push(|p| p.fetch.push(record.clone()))
    }

    fn write_content(&self, content: &ContentEntry) -> StorageResult<()> {
        self.push(|p| p.content.push(content.clone()))
    }

    fn write_links(&self, parent_key: &str, links: &[FetchRecord]) -> StorageResult<()> {
        if links.is_empty() {
            return Ok(());
        }
        self.push(|p| {
            p.links
                .extend(links.iter().map(|l| (parent_key.to_string(), l.clone())))
        })
    }

    fn write_text(&self, text: &TextEntry) -> StorageResult<()> {
        self.push(|p| p.text.push(text.clone()))
    }
}

impl Drop for SegmentWriter {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            if let Err(e) = flush_locked(&mut state) {
                warn!("Failed to flush segment {} on drop: {}", self.path.display(), e);
            }
        }
    }
}

/// Read access to a segment, used by the merge and for inspection
pub struct SegmentReader {
    path: PathBuf,
    conn: Connection,
}

impl SegmentReader {
    /// Opens an existing segment
    pub fn open(path: &Path) -> StorageResult<Self> {
        if !path.is_file() {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("segment {} does not exist", path.display()),
            )));
        }
        let conn = Connection::open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            conn,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true until the segment has been merged
    pub fn has_staging(&self) -> StorageResult<bool> {
        Ok(table_exists(&self.conn, STAGING_TABLES[0])?)
    }

    /// Calls `visit` with every fetch outcome in write order
    pub fn visit_outcomes(
        &self,
        mut visit: impl FnMut(FetchRecord) -> StorageResult<()>,
    ) -> StorageResult<usize> {
        if !table_exists(&self.conn, "fetch")? {
            return Ok(0);
        }
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {} FROM fetch ORDER BY seq", RECORD_COLUMNS))?;
        let mut rows = stmt.query([])?;
        let mut visited = 0;
        while let Some(row) = rows.next()? {
            visit(record_from_row(row, 0)?)?;
            visited += 1;
        }
        Ok(visited)
    }

    /// Calls `visit` with every discovered link and the key of the page it was found on
    pub fn visit_links(
        &self,
        mut visit: impl FnMut(&str, FetchRecord) -> StorageResult<()>,
    ) -> StorageResult<usize> {
        if !table_exists(&self.conn, "parse_links")? {
            return Ok(0);
        }
        let mut stmt = self.conn.prepare(&format!(
            "SELECT parent_key, {} FROM parse_links ORDER BY seq",
            RECORD_COLUMNS
        ))?;
        let mut rows = stmt.query([])?;
        let mut visited = 0;
        while let Some(row) = rows.next()? {
            let parent_key: String = row.get(0)?;
            visit(&parent_key, record_from_row(row, 1)?)?;
            visited += 1;
        }
        Ok(visited)
    }

    /// All fetch outcomes in write order
    pub fn outcomes(&self) -> StorageResult<Vec<FetchRecord>> {
        let mut records = Vec::new();
        self.visit_outcomes(|r| {
            records.push(r);
            Ok(())
        })?;
        Ok(records)
    }

    /// Latest stored body for `key`
    pub fn content(&self, key: &str) -> StorageResult<Option<ContentEntry>> {
        let entry = self
            .conn
            .query_row(
                "SELECT key, url, content_type, body FROM content WHERE key = ?1 ORDER BY seq DESC LIMIT 1",
                params![key],
                |row| {
                    Ok(ContentEntry {
                        key: row.get(0)?,
                        url: row.get(1)?,
                        content_type: row.get(2)?,
                        body: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(entry)
    }

    /// Latest extracted text for `key`
    pub fn text(&self, key: &str) -> StorageResult<Option<TextEntry>> {
        let row = self
            .conn
            .query_row(
                "SELECT key, url, text, output FROM parse_text WHERE key = ?1 ORDER BY seq DESC LIMIT 1",
                params![key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((key, url, text, output)) => Ok(Some(TextEntry {
                key,
                url,
                text,
                output: output.map(|o| serde_json::from_str(&o)).transpose()?,
            })),
            None => Ok(None),
        }
    }

    /// Row counts per stream; dropped staging tables count as empty
    pub fn counts(&self) -> StorageResult<SegmentCounts> {
        let count = |table: &str| -> StorageResult<usize> {
            if !table_exists(&self.conn, table)? {
                return Ok(0);
            }
            let n: i64 =
                self.conn
                    .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                        row.get(0)
                    })?;
            Ok(n as usize)
        };

        Ok(SegmentCounts {
            fetch: count("fetch")?,
            content: count("content")?,
            links: count("parse_links")?,
            text: count("parse_text")?,
        })
    }

    /// Removes the tables the merge consumes
    pub fn drop_staging(&self) -> StorageResult<()> {
        for table in STAGING_TABLES {
            self.conn
                .execute_batch(&format!("DROP TABLE IF EXISTS {};", table))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::FetchStatus;
    use tempfile::TempDir;

    fn fetched(url: &str) -> FetchRecord {
        let mut record = FetchRecord::new(url);
        record.complete(FetchStatus::Fetched, Some(200), 0).unwrap();
        record
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("segments").join("s1.sqlite");
        let writer = SegmentWriter::create(&path).unwrap();

        writer.write_fetch(&fetched("https://example.com/")).unwrap();
        writer
            .write_links(
                "https://example.com/",
                &[
                    FetchRecord::linked("https://example.com/b"),
                    FetchRecord::linked("https://example.com/c"),
                ],
            )
            .unwrap();
        writer
            .write_content(&ContentEntry {
                key: "https://example.com/".to_string(),
                url: "https://example.com/".to_string(),
                content_type: Some("text/html".to_string()),
                body: b"<html></html>".to_vec(),
            })
            .unwrap();
        writer
            .write_text(&TextEntry {
                key: "https://example.com/".to_string(),
                url: "https://example.com/".to_string(),
                text: Some("hello".to_string()),
                output: Some(serde_json::json!({"title": "Home"})),
            })
            .unwrap();

        let counts = writer.close().unwrap();
        assert_eq!(
            counts,
            SegmentCounts {
                fetch: 1,
                content: 1,
                links: 2,
                text: 1
            }
        );

        let reader = SegmentReader::open(&path).unwrap();
        assert!(reader.has_staging().unwrap());
        assert_eq!(reader.counts().unwrap(), counts);

        let outcomes = reader.outcomes().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].status, FetchStatus::Fetched);
        assert_eq!(outcomes[0].http_code, Some(200));
        assert!(outcomes[0].fetch_time.is_some());

        let mut links = Vec::new();
        reader
            .visit_links(|parent, link| {
                links.push((parent.to_string(), link.url().to_string()));
                Ok(())
            })
            .unwrap();
        assert_eq!(links[0].0, "https://example.com/");
        assert_eq!(links[1].1, "https://example.com/c");

        let content = reader.content("https://example.com/").unwrap().unwrap();
        assert_eq!(content.body, b"<html></html>");

        let text = reader.text("https://example.com/").unwrap().unwrap();
        assert_eq!(text.text.as_deref(), Some("hello"));
        assert_eq!(text.output.unwrap()["title"], "Home");
    }

    #[test]
    fn test_write_after_close_fails() {
        let dir = TempDir::new().unwrap();
        let writer = SegmentWriter::create(&dir.path().join("s.sqlite")).unwrap();
        writer.close().unwrap();

        let result = writer.write_fetch(&fetched("https://example.com/"));
        assert!(matches!(result, Err(StorageError::SegmentClosed(_))));
        assert!(writer.is_closed());

        // Second close is harmless
        assert_eq!(writer.close().unwrap(), SegmentCounts::default());
    }

    #[test]
    fn test_buffer_flushes_when_full() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.sqlite");
        let writer = SegmentWriter::with_buffer_size(&path, 2).unwrap();

        writer.write_fetch(&fetched("https://example.com/1")).unwrap();
        assert_eq!(SegmentReader::open(&path).unwrap().counts().unwrap().fetch, 0);

        writer.write_fetch(&fetched("https://example.com/2")).unwrap();
        assert_eq!(SegmentReader::open(&path).unwrap().counts().unwrap().fetch, 2);

        writer.write_fetch(&fetched("https://example.com/3")).unwrap();
        assert_eq!(writer.counts().unwrap().fetch, 3);
        writer.close().unwrap();
        assert_eq!(SegmentReader::open(&path).unwrap().counts().unwrap().fetch, 3);
    }

    #[test]
    fn test_drop_staging_keeps_output() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.sqlite");
        let writer = SegmentWriter::create(&path).unwrap();
        writer.write_fetch(&fetched("https://example.com/")).unwrap();
        writer
            .write_text(&TextEntry {
                key: "https://example.com/".to_string(),
                url: "https://example.com/".to_string(),
                text: Some("kept".to_string()),
                output: None,
            })
            .unwrap();
        writer.close().unwrap();

        let reader = SegmentReader::open(&path).unwrap();
        reader.drop_staging().unwrap();
        reader.drop_staging().unwrap();

        assert!(!reader.has_staging().unwrap());
        assert!(reader.outcomes().unwrap().is_empty());
        assert_eq!(reader.counts().unwrap().text, 1);
    }

    #[test]
    fn test_open_missing_segment() {
        let dir = TempDir::new().unwrap();
        assert!(SegmentReader::open(&dir.path().join("missing.sqlite")).is_err());
    }
}
