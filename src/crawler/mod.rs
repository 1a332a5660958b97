//! Crawler module: the fetch engine
//!
//! This module contains everything that runs a round, including:
//! - A frontier of records and the feeder that moves them into the fetch queue
//! - A pool of workers that fetch with bounded retries and call the extractor
//! - The run coordinator that supervises a round and merges its segment
//! - The multi-round [`Crawler`]

mod coordinator;
mod crawl;
mod extract;
mod feeder;
mod frontier;
mod queue;
mod retry;
mod transport;
mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use coordinator::{AbortReason, RunCoordinator, RunReport, RunState};
pub use crawl::{CrawlReport, Crawler};
pub use extract::{parse_html, ExtractError, Extracted, Extractor, HtmlLinkExtractor, Page, ParsedPage};
pub use feeder::{QueueFeeder, DEFAULT_THROTTLE};
pub use frontier::{CrawlDbFrontier, Frontier, ListFrontier};
pub use queue::FetchQueue;
pub use retry::{fetch_with_retry, FetchAttempt, RetryDecision, RetryPolicy};
pub use transport::{build_http_client, HttpTransport, Response, Transport, TransportError, MAX_REDIRECTS};
pub use worker::{PoolStats, RoundContext, WorkerPool, WorkerSettings};
