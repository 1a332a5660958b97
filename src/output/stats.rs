//! Statistics generation from the crawl database
//!
//! This module provides functionality for extracting and displaying
//! crawl statistics from the storage layer.

use crate::record::FetchStatus;
use crate::storage::{CrawlDb, LockState, RoundRecord, StorageResult};
use std::collections::BTreeMap;

/// Crawl statistics summary
#[derive(Debug, Clone)]
pub struct CrawlStatistics {
    /// Total number of records in the crawl database
    pub total_records: u64,

    /// Count of records by status
    pub records_by_status: BTreeMap<FetchStatus, u64>,

    /// Records a next round would consider (unfetched or linked)
    pub pending: u64,

    /// Segments on disk, and how many of them still await a merge
    pub segments: usize,
    pub unmerged_segments: usize,

    /// Number of rounds in the history
    pub rounds: usize,

    pub last_round: Option<RoundRecord>,

    pub lock: LockState,
}

impl CrawlStatistics {
    pub fn count(&self, status: FetchStatus) -> u64 {
        self.records_by_status.get(&status).copied().unwrap_or(0)
    }

    /// Fetched and redirected records
    pub fn done(&self) -> u64 {
        self.count(FetchStatus::Fetched) + self.count(FetchStatus::Redirected)
    }
}

/// Loads statistics from the crawl database
///
/// # Arguments
///
/// * `db` - The crawl database to query
///
/// # Returns
///
/// * `Ok(CrawlStatistics)` - Successfully loaded statistics
/// * `Err(StorageError)` - Failed to query statistics
pub fn load_statistics(db: &CrawlDb) -> StorageResult<CrawlStatistics> {
    let records_by_status: BTreeMap<_, _> = db.status_counts()?.into_iter().collect();
    let pending = records_by_status
        .iter()
        .filter(|(status, _)| status.is_pending())
        .map(|(_, count)| count)
        .sum();

    let rounds = db.rounds()?;

    Ok(CrawlStatistics {
        total_records: db.count_total()?,
        records_by_status,
        pending,
        segments: db.segments()?.len(),
        unmerged_segments: db.unmerged_segments()?.len(),
        rounds: rounds.len(),
        last_round: rounds.last().cloned(),
        lock: db.lock_state()?,
    })
}

/// Prints statistics to stdout in a formatted manner
///
/// # Arguments
///
/// * `stats` - The statistics to display
pub fn print_statistics(stats: &CrawlStatistics) {
    println!("=== Crawl Statistics ===\n");

    println!("Overview:");
    println!("  Total records: {}", stats.total_records);
    println!("  Pending: {}", stats.pending);
    println!(
        "  Segments: {} ({} unmerged)",
        stats.segments, stats.unmerged_segments
    );
    println!("  Rounds: {}", stats.rounds);
    println!();

    println!("Records by Status:");
    for (status, count) in &stats.records_by_status {
        let percentage = if stats.total_records > 0 {
            (*count as f64 / stats.total_records as f64) * 100.0
        } else {
            0.0
        };
        println!("  {}: {} ({:.1}%)", status, count, percentage);
    }
    println!();

    if let Some(round) = &stats.last_round {
        println!("Last Round:");
        println!("  Id: {} (depth {})", round.id, round.depth);
        println!("  Status: {}", round.status.to_db_string());
        println!("  Started: {}", round.started_at);
        if let Some(finished) = &round.finished_at {
            println!("  Finished: {}", finished);
        }
        println!(
            "  Generated: {}, fetched: {}, failed: {}",
            round.generated, round.fetched, round.failed
        );
        if let Some(reason) = &round.abort_reason {
            println!("  Aborted: {}", reason);
        }
        println!();
    }

    if stats.lock.locked {
        println!(
            "Locked by {} (heartbeat {})",
            stats.lock.holder.as_deref().unwrap_or("unknown"),
            stats
                .lock
                .heartbeat
                .map(|h| h.to_rfc3339())
                .unwrap_or_else(|| "never".to_string())
        );
        println!();
    }

    let done = stats.done();
    let success_rate = if stats.total_records > 0 {
        (done as f64 / stats.total_records as f64) * 100.0
    } else {
        0.0
    };

    println!(
        "Success Rate: {:.1}% ({} / {} records fetched)",
        success_rate, done, stats.total_records
    );
}
