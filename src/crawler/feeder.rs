//! The queue feeder: moves records from a frontier into the fetch queue

use crate::crawler::frontier::Frontier;
use crate::crawler::queue::FetchQueue;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Sleep when the queue is already at its target size
pub const DEFAULT_THROTTLE: Duration = Duration::from_secs(1);

/// Longest stretch the throttle sleeps without checking for a stop
const PAUSE_SLICE: Duration = Duration::from_millis(10);

/// Keeps the fetch queue topped up to a target size
pub struct QueueFeeder<F> {
    frontier: F,
    queue: Arc<FetchQueue>,
    target: usize,
    throttle: Duration,
    cancel: CancellationToken,
    finished: Arc<AtomicBool>,
    enqueued: Arc<AtomicUsize>,
}

/// Sets the finished flag however the feeder loop exits
struct FinishedGuard(Arc<AtomicBool>);

impl Drop for FinishedGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

impl<F: Frontier + 'static> QueueFeeder<F> {
    pub fn new(
        frontier: F,
        queue: Arc<FetchQueue>,
        target: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            frontier,
            queue,
            target: target.max(1),
            throttle: DEFAULT_THROTTLE,
            cancel,
            finished: Arc::new(AtomicBool::new(false)),
            enqueued: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }

    /// Flag set once the feeder will add nothing more
    pub fn finished_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.finished)
    }

    /// Counter of records enqueued so far
    pub fn enqueued_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.enqueued)
    }

    /// Runs the feeder loop on the calling thread
    ///
    /// Returns when the frontier is exhausted, a stop is requested, or the
    /// frontier fails. Never enqueues more than the current deficit, so the
    /// queue stays at or below the target size.
    pub fn run(mut self) -> usize {
        let _finished = FinishedGuard(Arc::clone(&self.finished));

        'feed: while !self.cancel.is_cancelled() {
            let deficit = self.target.saturating_sub(self.queue.len());
            if deficit == 0 {
                self.pause();
                continue;
            }

            for _ in 0..deficit {
                if self.cancel.is_cancelled() {
                    break 'feed;
                }
                match self.frontier.next() {
                    Ok(Some(record)) => {
                        self.queue.add_record(record.for_fetch());
                        self.enqueued.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(None) => {
                        debug!("Frontier exhausted");
                        break 'feed;
                    }
                    Err(e) => {
                        error!("Frontier failed, feeding stops for this round: {}", e);
                        break 'feed;
                    }
                }
            }
        }

        let enqueued = self.enqueued.load(Ordering::Relaxed);
        info!("Feeder finished after {} records", enqueued);
        enqueued
    }

    /// Sleeps for the throttle, waking early once cancelled
    fn pause(&self) {
        let deadline = Instant::now() + self.throttle;
        while !self.cancel.is_cancelled() {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            std::thread::sleep(left.min(PAUSE_SLICE));
        }
    }

    /// Starts the feeder on tokio's blocking pool
    pub fn spawn(self) -> JoinHandle<usize> {
        tokio::task::spawn_blocking(move || self.run())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::frontier::ListFrontier;
    use crate::record::{FetchRecord, FetchStatus};
    use crate::HarvestError;

    struct Broken;

    impl Frontier for Broken {
        fn next(&mut self) -> crate::Result<Option<FetchRecord>> {
            Err(HarvestError::Frontier("boom".to_string()))
        }

        fn total_generated(&self) -> usize {
            0
        }
    }

    fn frontier(n: usize) -> ListFrontier {
        ListFrontier::from_urls((0..n).map(|i| format!("https://example.com/{}", i)))
    }

    #[test]
    fn test_feeds_until_exhausted() {
        let queue = Arc::new(FetchQueue::new());
        let feeder = QueueFeeder::new(frontier(5), Arc::clone(&queue), 100, CancellationToken::new());
        let finished = feeder.finished_flag();

        assert_eq!(feeder.run(), 5);
        assert!(finished.load(Ordering::Acquire));
        assert_eq!(queue.len(), 5);
    }

    #[test]
    fn test_queue_stays_bounded() {
        let queue = Arc::new(FetchQueue::new());
        let cancel = CancellationToken::new();
        let feeder = QueueFeeder::new(frontier(100), Arc::clone(&queue), 10, cancel.clone())
            .with_throttle(Duration::from_millis(5));
        let finished = feeder.finished_flag();

        let handle = std::thread::spawn(move || feeder.run());
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(queue.len(), 10);
        assert!(!finished.load(Ordering::Acquire));

        // Consumers free room, the feeder refills to the target and no further
        for _ in 0..4 {
            queue.take_record();
        }
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(queue.len(), 10);
        assert_eq!(queue.total_enqueued(), 14);

        cancel.cancel();
        assert_eq!(handle.join().unwrap(), 14);
        assert!(finished.load(Ordering::Acquire));
    }

    #[test]
    fn test_stop_interrupts_throttle() {
        let queue = Arc::new(FetchQueue::new());
        let cancel = CancellationToken::new();
        let feeder = QueueFeeder::new(frontier(10), Arc::clone(&queue), 2, cancel.clone())
            .with_throttle(Duration::from_secs(30));

        let handle = std::thread::spawn(move || feeder.run());
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(queue.len(), 2);

        let stopped = Instant::now();
        cancel.cancel();
        assert_eq!(handle.join().unwrap(), 2);
        assert!(stopped.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_regenerated_records_are_reset() {
        let mut gone = FetchRecord::new("https://example.com/gone");
        gone.complete(FetchStatus::Gone, None, 3).unwrap();

        let queue = Arc::new(FetchQueue::new());
        let feeder = QueueFeeder::new(
            ListFrontier::new(vec![gone]),
            Arc::clone(&queue),
            10,
            CancellationToken::new(),
        );
        feeder.run();

        let record = queue.take_record().unwrap();
        assert_eq!(record.status, FetchStatus::Unfetched);
        assert_eq!(record.execute_count, 1);
    }

    #[test]
    fn test_frontier_error_finishes_feeder() {
        let queue = Arc::new(FetchQueue::new());
        let feeder = QueueFeeder::new(Broken, Arc::clone(&queue), 10, CancellationToken::new());
        let finished = feeder.finished_flag();

        assert_eq!(feeder.run(), 0);
        assert!(finished.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_spawned_feeder() {
        let queue = Arc::new(FetchQueue::new());
        let feeder = QueueFeeder::new(frontier(3), Arc::clone(&queue), 10, CancellationToken::new());
        assert_eq!(feeder.spawn().await.unwrap(), 3);
        assert_eq!(queue.len(), 3);
    }
}
