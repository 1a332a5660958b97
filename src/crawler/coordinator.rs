//! Run coordinator - supervision of a single round
//!
//! A round moves through four states:
//! - `Starting`: lock the crawl database, open the segment, start the feeder and workers
//! - `Running`: report progress, keep the lock alive and watch for hangs
//! - `Draining`: cancel, give workers a grace period, abort the stragglers
//! - `Stopped`: close the segment, merge it and release the lock
//!
//! A round whose lock was taken over by another run stops without merging or
//! unlocking. The segment and the round record belong to the new holder.

use crate::config::EngineConfig;
use crate::crawler::extract::Extractor;
use crate::crawler::feeder::QueueFeeder;
use crate::crawler::frontier::Frontier;
use crate::crawler::queue::FetchQueue;
use crate::crawler::retry::RetryPolicy;
use crate::crawler::transport::Transport;
use crate::crawler::worker::{PoolStats, RoundContext, WorkerPool, WorkerSettings};
use crate::storage::{
    CrawlDb, LockToken, MergeStats, RoundStatus, RoundSummary, SegmentWriter, StorageError,
};
use crate::Result;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Below this many queued records the watchdog logs what is left
const DUMP_QUEUE_BELOW: usize = 5;

/// Lifecycle of a round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Starting,
    Running,
    Draining,
    Stopped,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Why a round ended before its workers ran out of work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// No worker started a fetch for longer than the hang threshold
    Hung { idle: Duration },
    /// A stop was requested from outside
    Stopped,
    /// Another run judged the lock stale and took it over
    LockLost,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hung { idle } => write!(f, "hung: no fetch started for {}ms", idle.as_millis()),
            Self::Stopped => f.write_str("stop requested"),
            Self::LockLost => f.write_str("lock lost: taken over by another run"),
        }
    }
}

/// What one round did
#[derive(Debug, Clone)]
pub struct RunReport {
    pub round_id: i64,
    pub segment: PathBuf,
    /// Records handed to the fetch queue
    pub generated: u64,
    pub fetched: u64,
    pub failed: u64,
    pub links: u64,
    /// Outcomes merged from an earlier run that died holding the lock
    pub recovered: Option<MergeStats>,
    pub merged: MergeStats,
    pub abort: Option<AbortReason>,
    pub duration: Duration,
}

impl RunReport {
    pub fn is_aborted(&self) -> bool {
        self.abort.is_some()
    }
}

/// Everything started in `Starting` that later states tear down
struct Round {
    id: i64,
    segment: PathBuf,
    lock: LockToken,
    writer: Arc<SegmentWriter>,
    recovered: Option<MergeStats>,
}

/// Drives rounds against one crawl database
pub struct RunCoordinator<T, E> {
    config: EngineConfig,
    db: Arc<CrawlDb>,
    transport: Arc<T>,
    extractor: Arc<E>,
    stop: CancellationToken,
    state: RunState,
}

impl<T: Transport, E: Extractor> RunCoordinator<T, E> {
    pub fn new(config: EngineConfig, db: Arc<CrawlDb>, transport: Arc<T>, extractor: Arc<E>) -> Self {
        Self {
            config,
            db,
            transport,
            extractor,
            stop: CancellationToken::new(),
            state: RunState::Stopped,
        }
    }

    /// Uses `stop` as the external stop signal instead of a private token
    pub fn with_stop(mut self, stop: CancellationToken) -> Self {
        self.stop = stop;
        self
    }

    /// Token that ends the current round early when cancelled
    pub fn stop_handle(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn enter(&mut self, next: RunState) {
        tracing::info!("Round state: {} -> {}", self.state, next);
        self.state = next;
    }

    /// Runs one round over `frontier`
    ///
    /// # Arguments
    ///
    /// * `frontier` - Source of the records this round attempts
    /// * `depth` - Round number, recorded in the round history
    ///
    /// # Returns
    ///
    /// * `Ok(RunReport)` - The round ended, cleanly or aborted, and its segment was merged
    /// * `Err(HarvestError)` - The lock could not be taken or was lost, or the
    ///   segment could not be closed or merged
    pub async fn run<F: Frontier + 'static>(&mut self, frontier: F, depth: u32) -> Result<RunReport> {
        let started = Instant::now();
        self.enter(RunState::Starting);

        let round = match self.start_round(depth) {
            Ok(round) => round,
            Err(e) => {
                self.enter(RunState::Stopped);
                return Err(e);
            }
        };
        tracing::info!(
            "Round {} (depth {}) writing to {}",
            round.id,
            depth,
            round.segment.display()
        );

        let cancel = self.stop.child_token();
        let queue = Arc::new(FetchQueue::new());
        let feeder = QueueFeeder::new(
            frontier,
            Arc::clone(&queue),
            self.config.queue_target_size,
            cancel.clone(),
        )
        .with_throttle(self.config.spin_wait);
        let feeder_finished = feeder.finished_flag();
        let enqueued = feeder.enqueued_counter();
        let feeder_handle = feeder.spawn();

        let stats = Arc::new(PoolStats::new());
        let ctx = Arc::new(RoundContext {
            queue: Arc::clone(&queue),
            transport: Arc::clone(&self.transport),
            extractor: Arc::clone(&self.extractor),
            sink: round.writer.clone(),
            policy: RetryPolicy::from_engine(&self.config),
            settings: WorkerSettings::from_engine(&self.config),
            feeder_finished: Arc::clone(&feeder_finished),
            stats: Arc::clone(&stats),
            cancel: cancel.clone(),
        });
        let pool = WorkerPool::spawn(self.config.threads, ctx);

        self.enter(RunState::Running);
        let abort = self
            .watch(&round.lock, &pool, &queue, &stats, &feeder_finished)
            .await;
        if let Some(reason) = &abort {
            tracing::warn!("Aborting round {}: {}", round.id, reason);
        }

        self.enter(RunState::Draining);
        cancel.cancel();
        let aborted = pool.shutdown(self.config.grace_period).await;
        if aborted > 0 {
            tracing::warn!(
                "Aborted {} workers still running after {}ms",
                aborted,
                self.config.grace_period.as_millis()
            );
        }
        match tokio::time::timeout(self.config.grace_period, feeder_handle).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::error!("Feeder task failed: {}", e),
            Err(_) => tracing::warn!("Feeder did not stop within the grace period"),
        }
        let dropped = queue.clear();
        if dropped > 0 {
            tracing::debug!("{} queued records left for a later round", dropped);
        }

        self.enter(RunState::Stopped);
        let summary = RoundSummary {
            generated: enqueued.load(Ordering::Relaxed) as u64,
            fetched: stats.fetched(),
            failed: stats.failed(),
            abort_reason: abort.map(|reason| reason.to_string()),
        };
        let merged = self.finish(&round, &summary, abort)?;

        let report = RunReport {
            round_id: round.id,
            segment: round.segment,
            generated: summary.generated,
            fetched: summary.fetched,
            failed: summary.failed,
            links: stats.links(),
            recovered: round.recovered,
            merged,
            abort,
            duration: started.elapsed(),
        };
        tracing::info!(
            "Round {} finished in {:.2}s: {} generated, {} fetched, {} failed, {} links",
            report.round_id,
            report.duration.as_secs_f64(),
            report.generated,
            report.fetched,
            report.failed,
            report.links
        );
        Ok(report)
    }

    /// Takes the lock, opens the segment and records the round
    ///
    /// The lock is released again if anything after taking it fails.
    fn start_round(&self, depth: u32) -> Result<Round> {
        let segment = self.db.new_segment_path();
        let (lock, recovered) = self.db.acquire(&segment, self.config.stale_lock_after)?;
        if let Some(stats) = &recovered {
            tracing::info!(
                "Recovered {} outcomes and {} links from an interrupted run",
                stats.outcomes,
                stats.linked
            );
        }

        let opened = self.open_round(depth, &segment);

        match opened {
            Ok((writer, id)) => Ok(Round {
                id,
                segment,
                lock,
                writer,
                recovered,
            }),
            Err(e) => {
                if let Err(unlock_err) = self.db.unlock(&lock) {
                    tracing::error!("Failed to release crawl database lock: {}", unlock_err);
                }
                Err(e)
            }
        }
    }

    fn open_round(&self, depth: u32, segment: &Path) -> Result<(Arc<SegmentWriter>, i64)> {
        let writer = SegmentWriter::create(segment)?;
        let id = self
            .db
            .begin_round(depth, segment, &self.config.config_hash)?;
        Ok((Arc::new(writer), id))
    }

    /// Samples the pool until it finishes on its own, hangs, loses the lock,
    /// or a stop arrives
    async fn watch(
        &self,
        lock: &LockToken,
        pool: &WorkerPool,
        queue: &FetchQueue,
        stats: &PoolStats,
        feeder_finished: &AtomicBool,
    ) -> Option<AbortReason> {
        loop {
            if self.stop.is_cancelled() {
                return Some(AbortReason::Stopped);
            }
            if pool.is_finished() {
                return None;
            }

            tokio::select! {
                () = tokio::time::sleep(self.config.poll_interval) => {}
                () = self.stop.cancelled() => return Some(AbortReason::Stopped),
            }
            if pool.is_finished() {
                return None;
            }

            let queued = queue.len();
            tracing::info!(
                "Progress: {} active, {} spinning, {} queued, {} fetched, {} failed",
                stats.active(),
                stats.spinning(),
                queued,
                stats.fetched(),
                stats.failed()
            );

            match self.db.heartbeat(lock) {
                Ok(()) => {}
                Err(StorageError::LockLost { .. }) => return Some(AbortReason::LockLost),
                Err(e) => tracing::warn!("Failed to refresh lock heartbeat: {}", e),
            }

            if feeder_finished.load(Ordering::Acquire) && queued < DUMP_QUEUE_BELOW {
                queue.dump();
            }

            let idle = stats.idle_for();
            if idle > self.config.hang_threshold {
                return Some(AbortReason::Hung { idle });
            }
        }
    }

    /// Closes the segment, merges it and releases the lock
    ///
    /// A segment that fails to close or merge fails the round and leaves the
    /// lock held, so the next run recovers what reached disk once the
    /// heartbeat goes stale.
    fn finish(
        &self,
        round: &Round,
        summary: &RoundSummary,
        abort: Option<AbortReason>,
    ) -> Result<MergeStats> {
        if abort == Some(AbortReason::LockLost) {
            if let Err(e) = round.writer.close() {
                tracing::debug!("Segment of a taken-over round did not close: {}", e);
            }
            tracing::error!(
                "Round {} lost the crawl database lock, leaving {} to the new holder",
                round.id,
                round.segment.display()
            );
            return Err(lock_lost(&round.lock).into());
        }

        match round.writer.close() {
            Ok(counts) => tracing::debug!(
                "Segment closed: {} outcomes, {} links, {} content, {} text",
                counts.fetch,
                counts.links,
                counts.content,
                counts.text
            ),
            Err(e) => {
                tracing::error!("Failed to close {}: {}", round.segment.display(), e);
                self.fail_round(round, summary, format!("segment close failed: {}", e));
                return Err(e.into());
            }
        }

        let merged = match self.db.merge_held(&round.segment, &round.lock) {
            Ok(merged) => merged,
            Err(e @ StorageError::LockLost { .. }) => {
                tracing::error!("Round {} lost the crawl database lock before merging", round.id);
                return Err(e.into());
            }
            Err(e) => {
                tracing::error!("Failed to merge {}: {}", round.segment.display(), e);
                self.fail_round(round, summary, format!("merge failed: {}", e));
                return Err(e.into());
            }
        };

        let status = if summary.abort_reason.is_some() {
            RoundStatus::Aborted
        } else {
            RoundStatus::Completed
        };
        self.db.finish_round(round.id, status, summary)?;
        self.db.unlock(&round.lock)?;

        tracing::info!(
            "Merged {} outcomes and {} new links into the crawl database",
            merged.outcomes,
            merged.linked
        );
        Ok(merged)
    }

    fn fail_round(&self, round: &Round, summary: &RoundSummary, reason: String) {
        let failed = RoundSummary {
            abort_reason: Some(reason),
            ..summary.clone()
        };
        if let Err(e) = self.db.finish_round(round.id, RoundStatus::Failed, &failed) {
            tracing::error!("Failed to record round {}: {}", round.id, e);
        }
    }
}

fn lock_lost(lock: &LockToken) -> StorageError {
    StorageError::LockLost {
        segment: lock.segment().to_string(),
    }
}
