//! Database schema definitions
//!
//! The crawl database and the per-round segments are separate SQLite files
//! with their own schemas.

/// SQL schema for the crawl database
pub const CRAWLDB_SCHEMA_SQL: &str = r#"
-- Latest record per key, shared by all rounds
CREATE TABLE IF NOT EXISTS crawldb (
    key TEXT PRIMARY KEY,
    url TEXT NOT NULL,
    status TEXT NOT NULL,
    fetch_time TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    execute_count INTEGER NOT NULL DEFAULT 0,
    http_code INTEGER,
    location TEXT,
    metadata TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_crawldb_status ON crawldb(status);

-- Advisory lock, exactly one row
CREATE TABLE IF NOT EXISTS crawl_lock (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    state TEXT NOT NULL,
    holder TEXT,
    segment TEXT,
    heartbeat_at TEXT
);

INSERT OR IGNORE INTO crawl_lock (id, state) VALUES (1, 'unlocked');

-- One row per round
CREATE TABLE IF NOT EXISTS rounds (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    depth INTEGER NOT NULL,
    segment TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    config_hash TEXT NOT NULL,
    status TEXT NOT NULL,
    generated INTEGER NOT NULL DEFAULT 0,
    fetched INTEGER NOT NULL DEFAULT 0,
    failed INTEGER NOT NULL DEFAULT 0,
    abort_reason TEXT
);
"#;

/// SQL schema for a segment
///
/// `fetch` and `parse_links` are staging tables consumed by the merge;
/// `content` and `parse_text` stay behind as the round's output.
pub const SEGMENT_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS fetch (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    key TEXT NOT NULL,
    url TEXT NOT NULL,
    status TEXT NOT NULL,
    fetch_time TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    execute_count INTEGER NOT NULL DEFAULT 0,
    http_code INTEGER,
    location TEXT,
    metadata TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS parse_links (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    parent_key TEXT NOT NULL,
    key TEXT NOT NULL,
    url TEXT NOT NULL,
    status TEXT NOT NULL,
    fetch_time TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    execute_count INTEGER NOT NULL DEFAULT 0,
    http_code INTEGER,
    location TEXT,
    metadata TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS content (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    key TEXT NOT NULL,
    url TEXT NOT NULL,
    content_type TEXT,
    body BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS parse_text (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    key TEXT NOT NULL,
    url TEXT NOT NULL,
    text TEXT,
    output TEXT
);
"#;

/// Names of the segment tables the merge consumes
pub const STAGING_TABLES: [&str; 2] = ["fetch", "parse_links"];

/// Initializes the crawl database schema
pub fn initialize_crawldb_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(CRAWLDB_SCHEMA_SQL)
}

/// Initializes a segment schema
pub fn initialize_segment_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SEGMENT_SCHEMA_SQL)
}

/// Returns true if `table` exists in the connected database
pub fn table_exists(conn: &rusqlite::Connection, table: &str) -> Result<bool, rusqlite::Error> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}
