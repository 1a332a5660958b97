use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure for Sumi-Harvest
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub crawler: CrawlerConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    pub user_agent: UserAgentConfig,
    pub output: OutputConfig,
    #[serde(default)]
    pub extract: ExtractConfig,
    /// URLs injected when they are not yet known to the crawl database
    #[serde(default)]
    pub seeds: Vec<String>,
    /// URLs injected as unfetched on every start, even if already fetched
    #[serde(default)]
    pub forced_seeds: Vec<String>,
}

/// Round and worker pool configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CrawlerConfig {
    /// Number of fetch workers per round
    pub threads: usize,

    /// Number of rounds (depth) to run
    pub depth: u32,

    /// Keep prior crawl history between starts
    pub resumable: bool,

    /// Maximum number of records generated per round
    pub top_n: Option<usize>,

    /// Fetch attempts a gone record may accumulate before it stops being regenerated
    pub max_execute_count: u32,

    /// Number of records the feeder keeps in the fetch queue
    pub queue_target_size: usize,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            threads: 50,
            depth: 1,
            resumable: false,
            top_n: None,
            max_execute_count: 1,
            queue_target_size: 1000,
        }
    }
}

/// Per-record fetch behaviour
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct FetchConfig {
    /// Retries after the first failed attempt
    pub max_retries: u32,

    /// Delay between attempts (milliseconds)
    pub retry_delay_ms: u64,

    /// Delay a worker observes after each record (milliseconds)
    pub politeness_delay_ms: u64,

    /// Whole-request timeout (milliseconds)
    pub timeout_ms: u64,

    /// Connect timeout (milliseconds)
    pub connect_timeout_ms: u64,

    /// Bodies are truncated beyond this many bytes
    pub max_body_bytes: usize,

    /// Write raw page bodies to the segment content stream
    pub store_content: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 0,
            politeness_delay_ms: 0,
            timeout_ms: 30_000,
            connect_timeout_ms: 10_000,
            max_body_bytes: 10 * 1024 * 1024,
            store_content: false,
        }
    }
}

/// Liveness supervision of a round
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct WatchdogConfig {
    /// How often the watchdog samples the pool (milliseconds)
    pub poll_interval_ms: u64,

    /// Back-off for workers finding an empty queue (milliseconds)
    pub spin_wait_ms: u64,

    /// Abort the round when no worker started a fetch for this long (milliseconds)
    pub hang_threshold_ms: u64,

    /// Time given to workers to exit after a stop before they are aborted (milliseconds)
    pub grace_period_ms: u64,

    /// A lock whose heartbeat is older than this belongs to a dead process (milliseconds)
    pub stale_lock_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            spin_wait_ms: 500,
            hang_threshold_ms: 300_000,
            grace_period_ms: 30_000,
            stale_lock_ms: 60_000,
        }
    }
}

/// User agent identification configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UserAgentConfig {
    /// Name of the crawler
    pub crawler_name: String,

    /// Version of the crawler
    pub crawler_version: String,

    /// URL with information about the crawler
    pub contact_url: String,

    /// Email address for crawler-related contact
    pub contact_email: String,
}

impl UserAgentConfig {
    /// Formats the header value: `Name/Version (+ContactURL; ContactEmail)`
    pub fn header_value(&self) -> String {
        format!(
            "{}/{} (+{}; {})",
            self.crawler_name, self.crawler_version, self.contact_url, self.contact_email
        )
    }
}

/// Output configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OutputConfig {
    /// Directory holding the crawl database and the segments
    pub crawl_path: String,
}

/// Settings for the bundled HTML extractor
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ExtractConfig {
    /// Only follow links on the host of the page they were found on
    pub same_host_only: bool,

    /// Write visible page text to the segment text stream
    pub store_text: bool,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            same_host_only: true,
            store_text: true,
        }
    }
}

/// Runtime settings handed to a run coordinator
///
/// Built from a [`Config`] once, then passed by value so that several crawls
/// with different settings can live in one process.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub crawl_path: PathBuf,
    pub threads: usize,
    pub queue_target_size: usize,
    pub top_n: Option<usize>,
    pub max_execute_count: u32,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub politeness_delay: Duration,
    pub store_content: bool,
    pub poll_interval: Duration,
    pub spin_wait: Duration,
    pub hang_threshold: Duration,
    pub grace_period: Duration,
    pub stale_lock_after: Duration,
    pub config_hash: String,
}

impl EngineConfig {
    /// Derives engine settings from a loaded configuration
    pub fn from_config(config: &Config, config_hash: &str) -> Self {
        Self {
            crawl_path: PathBuf::from(&config.output.crawl_path),
            threads: config.crawler.threads,
            queue_target_size: config.crawler.queue_target_size,
            top_n: config.crawler.top_n,
            max_execute_count: config.crawler.max_execute_count,
            max_retries: config.fetch.max_retries,
            retry_delay: Duration::from_millis(config.fetch.retry_delay_ms),
            politeness_delay: Duration::from_millis(config.fetch.politeness_delay_ms),
            store_content: config.fetch.store_content,
            poll_interval: Duration::from_millis(config.watchdog.poll_interval_ms),
            spin_wait: Duration::from_millis(config.watchdog.spin_wait_ms),
            hang_threshold: Duration::from_millis(config.watchdog.hang_threshold_ms),
            grace_period: Duration::from_millis(config.watchdog.grace_period_ms),
            stale_lock_after: Duration::from_millis(config.watchdog.stale_lock_ms),
            config_hash: config_hash.to_string(),
        }
    }

    /// Engine settings with library defaults rooted at `crawl_path`
    pub fn with_crawl_path(crawl_path: impl Into<PathBuf>) -> Self {
        let crawler = CrawlerConfig::default();
        let fetch = FetchConfig::default();
        let watchdog = WatchdogConfig::default();
        Self {
            crawl_path: crawl_path.into(),
            threads: crawler.threads,
            queue_target_size: crawler.queue_target_size,
            top_n: crawler.top_n,
            max_execute_count: crawler.max_execute_count,
            max_retries: fetch.max_retries,
            retry_delay: Duration::from_millis(fetch.retry_delay_ms),
            politeness_delay: Duration::from_millis(fetch.politeness_delay_ms),
            store_content: fetch.store_content,
            poll_interval: Duration::from_millis(watchdog.poll_interval_ms),
            spin_wait: Duration::from_millis(watchdog.spin_wait_ms),
            hang_threshold: Duration::from_millis(watchdog.hang_threshold_ms),
            grace_period: Duration::from_millis(watchdog.grace_period_ms),
            stale_lock_after: Duration::from_millis(watchdog.stale_lock_ms),
            config_hash: String::new(),
        }
    }
}
