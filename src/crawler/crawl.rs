//! Multi-round crawling over a crawl database

use crate::config::{Config, EngineConfig};
use crate::crawler::coordinator::{RunCoordinator, RunReport};
use crate::crawler::extract::Extractor;
use crate::crawler::frontier::CrawlDbFrontier;
use crate::crawler::transport::Transport;
use crate::record::FetchRecord;
use crate::storage::CrawlDb;
use crate::url::normalize_url;
use crate::{ConfigError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Per-round reports of one crawl
#[derive(Debug, Clone, Default)]
pub struct CrawlReport {
    pub rounds: Vec<RunReport>,
}

impl CrawlReport {
    pub fn total_generated(&self) -> u64 {
        self.rounds.iter().map(|r| r.generated).sum()
    }

    pub fn total_fetched(&self) -> u64 {
        self.rounds.iter().map(|r| r.fetched).sum()
    }

    pub fn total_failed(&self) -> u64 {
        self.rounds.iter().map(|r| r.failed).sum()
    }

    pub fn total_links(&self) -> u64 {
        self.rounds.iter().map(|r| r.links).sum()
    }

    pub fn duration(&self) -> Duration {
        self.rounds.iter().map(|r| r.duration).sum()
    }
}

/// Breadth-first crawler: seeds the crawl database, then runs one round per depth
pub struct Crawler<T, E> {
    engine: EngineConfig,
    seeds: Vec<String>,
    forced_seeds: Vec<String>,
    resumable: bool,
    transport: Arc<T>,
    extractor: Arc<E>,
    stop: CancellationToken,
}

impl<T: Transport, E: Extractor> Crawler<T, E> {
    pub fn new(config: &Config, transport: T, extractor: E) -> Self {
        Self {
            engine: EngineConfig::from_config(config, ""),
            seeds: config.seeds.clone(),
            forced_seeds: config.forced_seeds.clone(),
            resumable: config.crawler.resumable,
            transport: Arc::new(transport),
            extractor: Arc::new(extractor),
            stop: CancellationToken::new(),
        }
    }

    /// Records `hash` with every round this crawler runs
    pub fn with_config_hash(mut self, hash: impl Into<String>) -> Self {
        self.engine.config_hash = hash.into();
        self
    }

    /// Overrides whether earlier crawl history is kept
    pub fn with_resumable(mut self, resumable: bool) -> Self {
        self.resumable = resumable;
        self
    }

    /// Replaces the engine settings derived from the configuration
    pub fn with_engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    pub fn engine(&self) -> &EngineConfig {
        &self.engine
    }

    /// Token that stops the running round and any further rounds
    pub fn stop_handle(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Runs up to `depth` rounds
    ///
    /// Seeds are checked before anything on disk is touched. A non-resumable
    /// crawl starts by clearing earlier history. Crawling ends early when a
    /// round generates nothing or a stop is requested.
    ///
    /// # Returns
    ///
    /// * `Ok(CrawlReport)` - Reports of the rounds that ran
    /// * `Err(HarvestError)` - Seeds were missing or invalid, or a round failed to start or merge
    pub async fn start(&self, depth: u32) -> Result<CrawlReport> {
        let seeds = normalize_seeds(&self.seeds)?;
        let forced = normalize_seeds(&self.forced_seeds)?;
        if !self.resumable && seeds.is_empty() && forced.is_empty() {
            return Err(ConfigError::NoSeeds.into());
        }

        let db = Arc::new(CrawlDb::open(&self.engine.crawl_path)?);
        if !self.resumable {
            db.clear(self.engine.stale_lock_after)?;
        }

        let injected = db.inject(&seeds)?;
        let forced_count = db.inject_forced(&forced)?;
        tracing::info!(
            "Injected {} new seeds and {} forced seeds into {}",
            injected,
            forced_count,
            db.root().display()
        );

        let mut coordinator = RunCoordinator::new(
            self.engine.clone(),
            Arc::clone(&db),
            Arc::clone(&self.transport),
            Arc::clone(&self.extractor),
        )
        .with_stop(self.stop.clone());

        let mut report = CrawlReport::default();
        for round in 1..=depth {
            if self.stop.is_cancelled() {
                tracing::info!("Stop requested, not starting round {}", round);
                break;
            }

            tracing::info!("Starting round {} of {}", round, depth);
            let frontier = CrawlDbFrontier::new(
                Arc::clone(&db),
                self.engine.top_n,
                self.engine.max_execute_count,
            );
            let run = coordinator.run(frontier, round).await?;
            let generated = run.generated;
            report.rounds.push(run);

            if generated == 0 {
                tracing::info!("Round {} generated nothing, crawl is complete", round);
                break;
            }
        }

        tracing::info!(
            "Crawl finished after {} rounds: {} fetched, {} failed",
            report.rounds.len(),
            report.total_fetched(),
            report.total_failed()
        );
        Ok(report)
    }
}

/// Normalizes seed URLs, keeping the first of any duplicates
fn normalize_seeds(seeds: &[String]) -> Result<Vec<FetchRecord>> {
    let mut records: Vec<FetchRecord> = Vec::with_capacity(seeds.len());
    for seed in seeds {
        let url = normalize_url(seed)?;
        if records.iter().all(|r| r.url() != url.as_str()) {
            records.push(FetchRecord::new(url.as_str()));
        }
    }
    Ok(records)
}
