//! The fetch worker pool
//!
//! Every worker runs the same loop: take a record from the queue, fetch it
//! under the retry policy, classify the response, run the matching
//! extraction hook and write everything to the round's segment. Workers exit
//! once the feeder has finished and the queue is empty, or when the round is
//! cancelled.

use crate::config::EngineConfig;
use crate::crawler::extract::{Extracted, Extractor, Page};
use crate::crawler::queue::FetchQueue;
use crate::crawler::retry::{fetch_with_retry, FetchAttempt, RetryPolicy};
use crate::crawler::transport::{Response, Transport};
use crate::record::{FetchRecord, FetchStatus, META_ETAG, META_LAST_MODIFIED};
use crate::storage::{ContentEntry, SegmentSink, TextEntry};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use url::Url;

/// Per-worker timing and output switches
#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    /// Back-off when the queue is empty but the feeder is still running
    pub spin_wait: Duration,
    /// Pause after each record
    pub politeness_delay: Duration,
    /// Write raw bodies to the segment
    pub store_content: bool,
}

impl WorkerSettings {
    pub fn from_engine(config: &EngineConfig) -> Self {
        Self {
            spin_wait: config.spin_wait,
            politeness_delay: config.politeness_delay,
            store_content: config.store_content,
        }
    }
}

/// Live counters of a round, read by the watchdog
#[derive(Debug)]
pub struct PoolStats {
    active: AtomicUsize,
    spinning: AtomicUsize,
    fetched: AtomicU64,
    failed: AtomicU64,
    links: AtomicU64,
    started: Instant,
    /// Milliseconds since `started` at which a worker last began a fetch
    last_activity_ms: AtomicU64,
}

impl Default for PoolStats {
    fn default() -> Self {
        Self {
            active: AtomicUsize::new(0),
            spinning: AtomicUsize::new(0),
            fetched: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            links: AtomicU64::new(0),
            started: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
        }
    }
}

impl PoolStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Workers still inside their loop
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Workers waiting on an empty queue
    pub fn spinning(&self) -> usize {
        self.spinning.load(Ordering::Acquire)
    }

    /// Records fetched or redirected
    pub fn fetched(&self) -> u64 {
        self.fetched.load(Ordering::Relaxed)
    }

    /// Records that ended up gone
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Links written to the segment
    pub fn links(&self) -> u64 {
        self.links.load(Ordering::Relaxed)
    }

    /// Marks the start of a fetch
    pub fn touch(&self) {
        let now = self.started.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(now, Ordering::Relaxed);
    }

    /// Time since a worker last started a fetch (or since the round began)
    pub fn idle_for(&self) -> Duration {
        let now = self.started.elapsed().as_millis() as u64;
        let last = self.last_activity_ms.load(Ordering::Relaxed);
        Duration::from_millis(now.saturating_sub(last))
    }
}

/// Holds a gauge up for as long as it lives
struct Gauge<'a>(&'a AtomicUsize);

impl<'a> Gauge<'a> {
    fn enter(gauge: &'a AtomicUsize) -> Self {
        gauge.fetch_add(1, Ordering::AcqRel);
        Self(gauge)
    }
}

impl Drop for Gauge<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Everything the workers of one round share
pub struct RoundContext<T, E> {
    pub queue: Arc<FetchQueue>,
    pub transport: Arc<T>,
    pub extractor: Arc<E>,
    pub sink: Arc<dyn SegmentSink>,
    pub policy: RetryPolicy,
    pub settings: WorkerSettings,
    /// Set by the feeder when it will add nothing more
    pub feeder_finished: Arc<AtomicBool>,
    pub stats: Arc<PoolStats>,
    pub cancel: CancellationToken,
}

/// Handles of the spawned workers
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `workers` identical workers on the tokio runtime
    pub fn spawn<T: Transport, E: Extractor>(workers: usize, ctx: Arc<RoundContext<T, E>>) -> Self {
        let handles = (0..workers)
            .map(|id| tokio::spawn(run_worker(id, Arc::clone(&ctx))))
            .collect();
        Self { handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Workers whose task has not completed
    pub fn live(&self) -> usize {
        self.handles.iter().filter(|h| !h.is_finished()).count()
    }

    pub fn is_finished(&self) -> bool {
        self.live() == 0
    }

    /// Aborts every worker still running and returns how many there were
    ///
    /// An aborted worker drops its in-flight fetch; the record is not written
    /// and stays pending in the crawl database.
    pub fn abort(&self) -> usize {
        let mut aborted = 0;
        for handle in self.handles.iter().filter(|h| !h.is_finished()) {
            handle.abort();
            aborted += 1;
        }
        aborted
    }

    /// Gives running workers `grace` to exit, then aborts the rest
    ///
    /// Returns how many workers had to be aborted.
    pub async fn shutdown(self, grace: Duration) -> usize {
        let deadline = Instant::now() + grace;
        while !self.is_finished() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let aborted = self.abort();
        self.join().await;
        aborted
    }

    /// Waits for every worker task to complete
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!("Worker panicked: {}", e);
                }
            }
        }
    }
}

async fn run_worker<T: Transport, E: Extractor>(id: usize, ctx: Arc<RoundContext<T, E>>) {
    let _active = Gauge::enter(&ctx.stats.active);
    debug!(worker = id, "Worker started");

    loop {
        if ctx.cancel.is_cancelled() {
            break;
        }

        // Read the flag before the queue: once it is set, no record can
        // arrive after an empty take.
        let feeder_finished = ctx.feeder_finished.load(Ordering::Acquire);
        let record = match ctx.queue.take_record() {
            Some(record) => record,
            None if feeder_finished => break,
            None => {
                let _spinning = Gauge::enter(&ctx.stats.spinning);
                tokio::select! {
                    () = tokio::time::sleep(ctx.settings.spin_wait) => {}
                    () = ctx.cancel.cancelled() => break,
                }
                continue;
            }
        };

        ctx.stats.touch();
        process_record(&ctx, record).await;

        if !ctx.settings.politeness_delay.is_zero() {
            tokio::select! {
                () = tokio::time::sleep(ctx.settings.politeness_delay) => {}
                () = ctx.cancel.cancelled() => break,
            }
        }
    }

    debug!(worker = id, "Worker stopped");
}

/// How a fetch attempt is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// 2xx or 3xx
    Fetched,
    /// 304 to a conditional request; the copy fetched earlier is still current
    NotModified,
    /// 404 or 410
    NotFound,
    /// Any other code, or no response at all
    Failed,
}

fn classify(response: Option<&Response>) -> Outcome {
    match response.map(|r| r.code) {
        Some(304) => Outcome::NotModified,
        Some(200..=399) => Outcome::Fetched,
        Some(404) | Some(410) => Outcome::NotFound,
        _ => Outcome::Failed,
    }
}

async fn process_record<T: Transport, E: Extractor>(
    ctx: &RoundContext<T, E>,
    mut record: FetchRecord,
) {
    let attempt =
        fetch_with_retry(&ctx.policy, ctx.transport.as_ref(), &record, &ctx.cancel).await;

    let (response, error, retries) = match attempt {
        FetchAttempt::Success { response, retries } => (Some(response), None, retries),
        FetchAttempt::Failed { error, retries } => (None, Some(error), retries),
        FetchAttempt::Cancelled => {
            debug!(url = %record.url(), "Fetch cancelled, left pending");
            return;
        }
    };

    let outcome = classify(response.as_ref());
    let status = match (outcome, &response) {
        (Outcome::Fetched, Some(r)) if is_redirect(&record, &r.final_url) => {
            FetchStatus::Redirected
        }
        (Outcome::Fetched | Outcome::NotModified, _) => FetchStatus::Fetched,
        _ => FetchStatus::Gone,
    };

    if let Err(e) = record.complete(status, response.as_ref().map(|r| r.code), retries) {
        error!("{}", e);
        return;
    }

    if let Some(response) = &response {
        if status == FetchStatus::Redirected {
            record.location = Some(response.final_url.clone());
        }
        for name in [META_LAST_MODIFIED, META_ETAG] {
            if let Some(value) = response.header(name) {
                record.metadata.insert(name.to_string(), value.to_string());
            }
        }
    }

    let page = Page {
        record: &record,
        response: response.as_ref(),
        error: error.as_ref(),
    };

    let extracted = match outcome {
        Outcome::Fetched => match ctx.extractor.on_fetched(&page) {
            Ok(extracted) => Some(extracted),
            Err(e) => {
                warn!(url = %record.url(), "Extraction failed: {}", e);
                None
            }
        },
        Outcome::NotModified => None,
        Outcome::NotFound => {
            if let Err(e) = ctx.extractor.on_not_found(&page) {
                warn!(url = %record.url(), "Not-found hook failed: {}", e);
            }
            None
        }
        Outcome::Failed => {
            if let Err(e) = ctx.extractor.on_failed(&page) {
                warn!(url = %record.url(), "Failure hook failed: {}", e);
            }
            None
        }
    };

    match (&error, status) {
        (Some(e), _) => warn!(url = %record.url(), retries, "Fetch failed: {}", e),
        (None, FetchStatus::Gone) => warn!("Gone: {}", record.brief()),
        _ => debug!("Fetched: {}", record.brief()),
    }

    let body = response.as_ref().filter(|_| outcome == Outcome::Fetched);
    write_outputs(ctx, &record, body, extracted);
}

/// Whether the response was served from somewhere other than the record URL
///
/// Compares parsed URLs without fragments, so spelling differences such as a
/// missing root slash do not count.
fn is_redirect(record: &FetchRecord, final_url: &str) -> bool {
    match (Url::parse(record.url()), Url::parse(final_url)) {
        (Ok(mut requested), Ok(mut served)) => {
            requested.set_fragment(None);
            served.set_fragment(None);
            requested != served
        }
        _ => record.url() != final_url,
    }
}

fn write_outputs<T, E>(
    ctx: &RoundContext<T, E>,
    record: &FetchRecord,
    response: Option<&Response>,
    extracted: Option<Extracted>,
) {
    if let Err(e) = ctx.sink.write_fetch(record) {
        error!(url = %record.url(), "Failed to write fetch outcome: {}", e);
        return;
    }
    if record.status.is_done() {
        ctx.stats.fetched.fetch_add(1, Ordering::Relaxed);
    } else {
        ctx.stats.failed.fetch_add(1, Ordering::Relaxed);
    }

    if ctx.settings.store_content && record.status.is_done() {
        if let Some(response) = response {
            let content = ContentEntry {
                key: record.key().to_string(),
                url: response.final_url.clone(),
                content_type: response.content_type.clone(),
                body: response.body.clone(),
            };
            if let Err(e) = ctx.sink.write_content(&content) {
                error!(url = %record.url(), "Failed to write content: {}", e);
            }
        }
    }

    let Some(extracted) = extracted else {
        return;
    };

    if !extracted.links.is_empty() {
        match ctx.sink.write_links(record.key(), &extracted.links) {
            Ok(()) => {
                ctx.stats
                    .links
                    .fetch_add(extracted.links.len() as u64, Ordering::Relaxed);
            }
            Err(e) => error!(url = %record.url(), "Failed to write links: {}", e),
        }
    }

    if extracted.text.is_some() || extracted.output.is_some() {
        let text = TextEntry {
            key: record.key().to_string(),
            url: record.url().to_string(),
            text: extracted.text,
            output: extracted.output,
        };
        if let Err(e) = ctx.sink.write_text(&text) {
            error!(url = %record.url(), "Failed to write text: {}", e);
        }
    }
}
