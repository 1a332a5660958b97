//! The crawl database
//!
//! Holds the latest [`FetchRecord`] per key across all rounds, the advisory
//! lock that marks a round in progress, and the round history. Rounds never
//! write here directly: their outcomes land in a segment that [`CrawlDb::merge`]
//! folds in once the round is over.

use crate::record::{FetchRecord, FetchStatus};
use crate::storage::schema::initialize_crawldb_schema;
use crate::storage::segment::SegmentReader;
use crate::storage::traits::{StorageError, StorageResult};
use crate::storage::{
    encode_record, record_from_row, LockState, LockToken, MergeStats, RoundRecord, RoundStatus, RoundSummary,
    RECORD_COLUMNS,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Statement};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

/// File name of the crawl database inside the crawl directory
pub const CRAWLDB_FILE: &str = "crawldb.sqlite";

/// Directory holding the segments inside the crawl directory
pub const SEGMENTS_DIR: &str = "segments";

const UPSERT_SQL: &str = "INSERT INTO crawldb (key, url, status, fetch_time, retry_count, execute_count, http_code, location, metadata)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
     ON CONFLICT(key) DO UPDATE SET
         url = excluded.url,
         status = excluded.status,
         fetch_time = excluded.fetch_time,
         retry_count = excluded.retry_count,
         execute_count = excluded.execute_count,
         http_code = excluded.http_code,
         location = excluded.location,
         metadata = excluded.metadata";

const INSERT_IF_ABSENT_SQL: &str = "INSERT OR IGNORE INTO crawldb (key, url, status, fetch_time, retry_count, execute_count, http_code, location, metadata)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)";

/// Segment name a recovering run holds the lock under
const RECOVERY_SEGMENT: &str = "(recovery)";

const ROUND_COLUMNS: &str = "id, depth, segment, started_at, finished_at, config_hash, status, generated, fetched, failed, abort_reason";

/// SQLite-backed crawl database rooted at a crawl directory
pub struct CrawlDb {
    root: PathBuf,
    conn: Mutex<Connection>,
}

impl CrawlDb {
    /// Opens or creates the crawl database under `root`
    ///
    /// # Arguments
    ///
    /// * `root` - Crawl directory; created with its `segments/` subdirectory if missing
    pub fn open(root: &Path) -> StorageResult<Self> {
        std::fs::create_dir_all(root.join(SEGMENTS_DIR))?;

        let conn = Connection::open(root.join(CRAWLDB_FILE))?;

        // Merges must be durable before the lock is released
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            PRAGMA temp_store = MEMORY;
        ",
        )?;
        conn.busy_timeout(Duration::from_secs(5))?;

        initialize_crawldb_schema(&conn)?;

        Ok(Self {
            root: root.to_path_buf(),
            conn: Mutex::new(conn),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn segments_dir(&self) -> PathBuf {
        self.root.join(SEGMENTS_DIR)
    }

    fn conn(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StorageError::Poisoned("crawl database"))
    }

    // ===== Records =====

    /// Looks up the record stored under `key`
    pub fn get(&self, key: &str) -> StorageResult<Option<FetchRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!("SELECT {} FROM crawldb WHERE key = ?1", RECORD_COLUMNS),
                params![key],
                |row| record_from_row(row, 0),
            )
            .optional()?;
        Ok(record)
    }

    /// Inserts records whose key is not yet known
    ///
    /// Returns how many were new.
    pub fn inject(&self, records: &[FetchRecord]) -> StorageResult<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(INSERT_IF_ABSENT_SQL)?;
            for record in records {
                inserted += execute_record(&mut stmt, record)?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Stores records as unfetched, replacing whatever the database held for their keys
    pub fn inject_forced(&self, records: &[FetchRecord]) -> StorageResult<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(UPSERT_SQL)?;
            for record in records {
                let mut forced = record.clone();
                forced.status = FetchStatus::Unfetched;
                execute_record(&mut stmt, &forced)?;
            }
        }
        tx.commit()?;
        Ok(records.len())
    }

    pub fn count_total(&self) -> StorageResult<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM crawldb", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn count_by_status(&self, status: FetchStatus) -> StorageResult<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM crawldb WHERE status = ?1",
            params![status.to_db_string()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Record counts for every status, in status order
    pub fn status_counts(&self) -> StorageResult<Vec<(FetchStatus, u64)>> {
        FetchStatus::all()
            .into_iter()
            .map(|status| Ok((status, self.count_by_status(status)?)))
            .collect()
    }

    /// Next page of records a round should attempt
    ///
    /// Yields unfetched and linked records, plus gone records that have been
    /// attempted fewer than `max_execute_count` times, ordered by insertion.
    ///
    /// # Arguments
    ///
    /// * `after_rowid` - Cursor returned with the last record of the previous page
    /// * `limit` - Maximum records to return
    /// * `max_execute_count` - Attempt ceiling for gone records
    pub fn pending_batch(
        &self,
        after_rowid: i64,
        limit: usize,
        max_execute_count: u32,
    ) -> StorageResult<Vec<(i64, FetchRecord)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT rowid, {} FROM crawldb
             WHERE rowid > ?1
               AND (status IN ('unfetched', 'linked')
                    OR (status = 'gone' AND execute_count < ?2))
             ORDER BY rowid
             LIMIT ?3",
            RECORD_COLUMNS
        ))?;

        let batch = stmt
            .query_map(
                params![after_rowid, max_execute_count, limit as i64],
                |row| Ok((row.get::<_, i64>(0)?, record_from_row(row, 1)?)),
            )?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(batch)
    }

    // ===== Segments =====

    /// Path for a new segment, named after the current time
    pub fn new_segment_path(&self) -> PathBuf {
        let dir = self.segments_dir();
        let stamp = Utc::now().format("%Y%m%d%H%M%S%3f").to_string();
        let mut path = dir.join(format!("{}.sqlite", stamp));
        let mut suffix = 1;
        while path.exists() {
            path = dir.join(format!("{}_{}.sqlite", stamp, suffix));
            suffix += 1;
        }
        path
    }

    /// All segment files, oldest first
    pub fn segments(&self) -> StorageResult<Vec<PathBuf>> {
        let dir = self.segments_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut segments = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_file() && path.extension().map_or(false, |ext| ext == "sqlite") {
                segments.push(path);
            }
        }
        segments.sort();
        Ok(segments)
    }

    /// Segments that still carry staging tables, oldest first
    pub fn unmerged_segments(&self) -> StorageResult<Vec<PathBuf>> {
        let mut unmerged = Vec::new();
        for segment in self.segments()? {
            if SegmentReader::open(&segment)?.has_staging()? {
                unmerged.push(segment);
            }
        }
        Ok(unmerged)
    }

    /// Folds a closed segment into the crawl database
    ///
    /// Fetch outcomes are upserted in write order, so the last outcome for a
    /// key wins. Discovered links are inserted as linked only when their key is
    /// unknown, which leaves fetched records untouched. Both happen in one
    /// transaction, the database is synced, and then the segment's staging
    /// tables are dropped. Merging a segment a second time changes nothing.
    pub fn merge(&self, segment: &Path) -> StorageResult<MergeStats> {
        self.merge_segment(segment, None)
    }

    /// Merges `segment` on behalf of the run holding `lock`
    ///
    /// The heartbeat is refreshed in the same transaction that applies the
    /// segment, so a run judging the lock stale either sees the merge
    /// committed or cannot take the lock over. Applies nothing and fails with
    /// [`StorageError::LockLost`] once `lock` no longer holds the database.
    pub fn merge_held(&self, segment: &Path, lock: &LockToken) -> StorageResult<MergeStats> {
        self.merge_segment(segment, Some(lock))
    }

    fn merge_segment(&self, segment: &Path, lock: Option<&LockToken>) -> StorageResult<MergeStats> {
        if let Some(lock) = lock {
            self.heartbeat(lock)?;
        }

        let reader = SegmentReader::open(segment)?;
        if !reader.has_staging()? {
            debug!("Segment {} already merged", segment.display());
            return Ok(MergeStats::default());
        }

        let mut linked = 0;
        let outcomes;
        {
            let mut conn = self.conn()?;
            let tx = conn.transaction()?;
            {
                let mut upsert = tx.prepare(UPSERT_SQL)?;
                outcomes = reader.visit_outcomes(|record| {
                    execute_record(&mut upsert, &record)?;
                    Ok(())
                })?;

                let mut insert = tx.prepare(INSERT_IF_ABSENT_SQL)?;
                reader.visit_links(|_, mut link| {
                    if !link.status.is_pending() {
                        link.status = FetchStatus::Linked;
                    }
                    linked += execute_record(&mut insert, &link)?;
                    Ok(())
                })?;
            }
            if let Some(lock) = lock {
                refresh_heartbeat(&tx, lock)?;
            }
            tx.commit()?;
            sync_locked(&conn)?;
        }

        reader.drop_staging()?;

        let stats = MergeStats { outcomes, linked };
        info!(
            "Merged segment {}: {} outcomes, {} new links",
            segment.display(),
            stats.outcomes,
            stats.linked
        );
        Ok(stats)
    }

    /// Flushes the write-ahead log into the database file
    pub fn sync(&self) -> StorageResult<()> {
        let conn = self.conn()?;
        sync_locked(&conn)
    }

    // ===== Lock =====

    pub fn lock_state(&self) -> StorageResult<LockState> {
        let conn = self.conn()?;
        read_lock(&conn)
    }

    pub fn is_locked(&self) -> StorageResult<bool> {
        Ok(self.lock_state()?.locked)
    }

    /// Takes the lock for a round writing to `segment`
    ///
    /// A lock left behind by a process whose heartbeat is older than
    /// `stale_after` is recovered first (see [`CrawlDb::recover`]).
    ///
    /// # Returns
    ///
    /// * `Ok((token, Some(stats)))` - A stale lock was recovered before locking
    /// * `Ok((token, None))` - The database was unlocked
    /// * `Err(StorageError::Locked)` - Another run holds a live lock
    pub fn acquire(
        &self,
        segment: &Path,
        stale_after: Duration,
    ) -> StorageResult<(LockToken, Option<MergeStats>)> {
        let recovered = self.recover(stale_after)?;
        let lock = self.lock(segment)?;
        Ok((lock, recovered))
    }

    /// Marks the database locked by this process for a round writing to `segment`
    ///
    /// Fails with [`StorageError::Locked`] if any lock is held, stale or not.
    pub fn lock(&self, segment: &Path) -> StorageResult<LockToken> {
        let segment_name = segment
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let token = LockToken::new(holder_name(), segment_name);

        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE crawl_lock SET state = 'locked', holder = ?1, segment = ?2, heartbeat_at = ?3
             WHERE id = 1 AND state = 'unlocked'",
            params![token.holder(), token.segment(), Utc::now().to_rfc3339()],
        )?;
        if changed == 0 {
            return Err(locked_error(&read_lock(&conn)?));
        }

        debug!("Locked crawl database for segment {}", token.segment());
        Ok(token)
    }

    /// Recovers from a run that died while holding the lock
    ///
    /// The stale lock is taken over first. Every segment still carrying
    /// staging tables is then merged, oldest first, running rounds are marked
    /// interrupted, and the lock is released.
    pub fn recover(&self, stale_after: Duration) -> StorageResult<Option<MergeStats>> {
        let Some((claim, previous)) = self.take_over(stale_after)? else {
            return Ok(None);
        };

        warn!(
            "Crawl database lock held by {} is stale, merging its segment {}",
            previous.holder.as_deref().unwrap_or("unknown"),
            previous.segment.as_deref().unwrap_or("(none)")
        );

        let mut total = MergeStats::default();
        for segment in self.unmerged_segments()? {
            let stats = self.merge_held(&segment, &claim)?;
            total.outcomes += stats.outcomes;
            total.linked += stats.linked;
        }

        {
            let conn = self.conn()?;
            conn.execute(
                "UPDATE rounds SET status = ?1, finished_at = ?2 WHERE status = ?3",
                params![
                    RoundStatus::Interrupted.to_db_string(),
                    Utc::now().to_rfc3339(),
                    RoundStatus::Running.to_db_string()
                ],
            )?;
        }

        self.unlock(&claim)?;
        Ok(Some(total))
    }

    /// Swaps a stale lock for one held by this process
    ///
    /// The swap only matches the lock row exactly as it was judged stale. A
    /// holder that refreshed its heartbeat in the meantime keeps the lock.
    fn take_over(&self, stale_after: Duration) -> StorageResult<Option<(LockToken, LockState)>> {
        let conn = self.conn()?;
        let (state, raw_heartbeat) = read_lock_row(&conn)?;
        if !state.locked {
            return Ok(None);
        }
        if !is_stale(&state, stale_after) {
            return Err(locked_error(&state));
        }

        let claim = LockToken::new(holder_name(), RECOVERY_SEGMENT.to_string());
        let changed = conn.execute(
            "UPDATE crawl_lock SET holder = ?1, segment = ?2, heartbeat_at = ?3
             WHERE id = 1 AND state = 'locked'
               AND holder IS ?4 AND segment IS ?5 AND heartbeat_at IS ?6",
            params![
                claim.holder(),
                claim.segment(),
                Utc::now().to_rfc3339(),
                state.holder,
                state.segment,
                raw_heartbeat
            ],
        )?;
        if changed == 0 {
            return Err(locked_error(&read_lock(&conn)?));
        }

        Ok(Some((claim, state)))
    }

    /// Refreshes the heartbeat of the lock `lock` holds
    ///
    /// Fails with [`StorageError::LockLost`] once another run took the lock over.
    pub fn heartbeat(&self, lock: &LockToken) -> StorageResult<()> {
        let conn = self.conn()?;
        refresh_heartbeat(&conn, lock)
    }

    /// Releases the lock `lock` holds
    ///
    /// Fails with [`StorageError::LockLost`], leaving the lock alone, once
    /// another run took it over.
    pub fn unlock(&self, lock: &LockToken) -> StorageResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE crawl_lock SET state = 'unlocked', holder = NULL, segment = NULL, heartbeat_at = NULL
             WHERE id = 1 AND state = 'locked' AND holder = ?1 AND segment = ?2",
            params![lock.holder(), lock.segment()],
        )?;
        if changed == 0 {
            return Err(lock_lost(lock));
        }

        debug!("Unlocked crawl database for segment {}", lock.segment());
        Ok(())
    }

    /// Forgets all crawl history: records, rounds and segments
    ///
    /// Refused while another run holds a live lock.
    pub fn clear(&self, stale_after: Duration) -> StorageResult<()> {
        let state = self.lock_state()?;
        if state.locked && !is_stale(&state, stale_after) {
            return Err(locked_error(&state));
        }

        {
            let mut conn = self.conn()?;
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM crawldb", [])?;
            tx.execute("DELETE FROM rounds", [])?;
            tx.execute(
                "UPDATE crawl_lock SET state = 'unlocked', holder = NULL, segment = NULL, heartbeat_at = NULL",
                [],
            )?;
            tx.commit()?;
        }

        for segment in self.segments()? {
            std::fs::remove_file(&segment)?;
        }

        info!("Cleared crawl history in {}", self.root.display());
        Ok(())
    }

    // ===== Rounds =====

    /// Records the start of a round and returns its id
    pub fn begin_round(&self, depth: u32, segment: &Path, config_hash: &str) -> StorageResult<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO rounds (depth, segment, started_at, config_hash, status) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                depth,
                segment.to_string_lossy(),
                Utc::now().to_rfc3339(),
                config_hash,
                RoundStatus::Running.to_db_string()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn finish_round(
        &self,
        id: i64,
        status: RoundStatus,
        summary: &RoundSummary,
    ) -> StorageResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE rounds SET status = ?1, finished_at = ?2, generated = ?3, fetched = ?4, failed = ?5, abort_reason = ?6
             WHERE id = ?7",
            params![
                status.to_db_string(),
                Utc::now().to_rfc3339(),
                summary.generated as i64,
                summary.fetched as i64,
                summary.failed as i64,
                summary.abort_reason,
                id
            ],
        )?;
        if changed == 0 {
            return Err(StorageError::RoundNotFound(id));
        }
        Ok(())
    }

    pub fn get_round(&self, id: i64) -> StorageResult<RoundRecord> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM rounds WHERE id = ?1", ROUND_COLUMNS),
            params![id],
            round_from_row,
        )
        .optional()?
        .ok_or(StorageError::RoundNotFound(id))
    }

    pub fn latest_round(&self) -> StorageResult<Option<RoundRecord>> {
        let conn = self.conn()?;
        let round = conn
            .query_row(
                &format!("SELECT {} FROM rounds ORDER BY id DESC LIMIT 1", ROUND_COLUMNS),
                [],
                round_from_row,
            )
            .optional()?;
        Ok(round)
    }

    /// Round history, oldest first
    pub fn rounds(&self) -> StorageResult<Vec<RoundRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM rounds ORDER BY id", ROUND_COLUMNS))?;
        let rounds = stmt
            .query_map([], round_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rounds)
    }
}

fn execute_record(stmt: &mut Statement<'_>, record: &FetchRecord) -> StorageResult<usize> {
    let enc = encode_record(record)?;
    Ok(stmt.execute(params![
        record.key(),
        record.url(),
        enc.status,
        enc.fetch_time,
        record.retry_count,
        record.execute_count,
        record.http_code,
        record.location,
        enc.metadata,
    ])?)
}

fn sync_locked(conn: &Connection) -> StorageResult<()> {
    conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
    Ok(())
}

fn refresh_heartbeat(conn: &Connection, lock: &LockToken) -> StorageResult<()> {
    let changed = conn.execute(
        "UPDATE crawl_lock SET heartbeat_at = ?1
         WHERE id = 1 AND state = 'locked' AND holder = ?2 AND segment = ?3",
        params![Utc::now().to_rfc3339(), lock.holder(), lock.segment()],
    )?;
    if changed == 0 {
        return Err(lock_lost(lock));
    }
    Ok(())
}

fn read_lock(conn: &Connection) -> StorageResult<LockState> {
    Ok(read_lock_row(conn)?.0)
}

/// Lock state plus the heartbeat exactly as stored
fn read_lock_row(conn: &Connection) -> StorageResult<(LockState, Option<String>)> {
    let (state, holder, segment, raw_heartbeat) = conn.query_row(
        "SELECT state, holder, segment, heartbeat_at FROM crawl_lock WHERE id = 1",
        [],
        |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        },
    )?;

    let heartbeat = raw_heartbeat
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc));

    let state = LockState {
        locked: state == "locked",
        holder,
        segment,
        heartbeat,
    };
    Ok((state, raw_heartbeat))
}

fn is_stale(state: &LockState, stale_after: Duration) -> bool {
    match state.heartbeat {
        Some(heartbeat) => (Utc::now() - heartbeat)
            .to_std()
            .map_or(false, |age| age >= stale_after),
        None => true,
    }
}

fn locked_error(state: &LockState) -> StorageError {
    StorageError::Locked {
        holder: state.holder.clone().unwrap_or_else(|| "unknown".to_string()),
        heartbeat: state
            .heartbeat
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string()),
    }
}

fn lock_lost(lock: &LockToken) -> StorageError {
    StorageError::LockLost {
        segment: lock.segment().to_string(),
    }
}

fn holder_name() -> String {
    format!("pid {}", std::process::id())
}

fn round_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RoundRecord> {
    Ok(RoundRecord {
        id: row.get(0)?,
        depth: row.get(1)?,
        segment: row.get(2)?,
        started_at: row.get(3)?,
        finished_at: row.get(4)?,
        config_hash: row.get(5)?,
        status: RoundStatus::from_db_string(&row.get::<_, String>(6)?)
            .unwrap_or(RoundStatus::Running),
        generated: row.get::<_, i64>(7)? as u64,
        fetched: row.get::<_, i64>(8)? as u64,
        failed: row.get::<_, i64>(9)? as u64,
        abort_reason: row.get(10)?,
    })
}
