//! Sumi-Harvest main entry point
//!
//! This is the command-line interface for the Sumi-Harvest fetch engine.

use anyhow::Context;
use clap::Parser;
use std::path::{Path, PathBuf};
use sumi_harvest::config::{load_config_with_hash, Config, EngineConfig};
use sumi_harvest::crawler::{CrawlReport, Crawler, HtmlLinkExtractor, HttpTransport};
use sumi_harvest::output::{load_statistics, print_statistics};
use sumi_harvest::storage::CrawlDb;
use tracing_subscriber::EnvFilter;

/// Sumi-Harvest: a resumable breadth-first fetch engine
///
/// Sumi-Harvest fetches a frontier of URLs round by round, follows the links
/// it finds and keeps a crawl database so that an interrupted crawl can be
/// resumed without losing finished work.
#[derive(Parser, Debug)]
#[command(name = "sumi-harvest")]
#[command(version = "1.0.0")]
#[command(about = "A resumable breadth-first fetch engine", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Keep earlier crawl history and continue from it
    #[arg(long, conflicts_with = "fresh")]
    resume: bool,

    /// Start a fresh crawl, discarding earlier history
    #[arg(long, conflicts_with = "resume")]
    fresh: bool,

    /// Number of rounds to run (overrides the config)
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    depth: Option<u32>,

    /// Number of fetch workers (overrides the config)
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..=1000))]
    threads: Option<u32>,

    /// Validate config and show the crawl plan without fetching anything
    #[arg(long, conflicts_with = "stats")]
    dry_run: bool,

    /// Show statistics from the crawl database and exit
    #[arg(long, conflicts_with = "dry_run")]
    stats: bool,
}

impl Cli {
    fn resumable(&self, config: &Config) -> bool {
        if self.fresh {
            false
        } else if self.resume {
            true
        } else {
            config.crawler.resumable
        }
    }

    fn depth(&self, config: &Config) -> u32 {
        self.depth.unwrap_or(config.crawler.depth)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    setup_logging(cli.verbose, cli.quiet);

    // Load and validate configuration
    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, config_hash) = load_config_with_hash(&cli.config)
        .with_context(|| format!("Failed to load configuration {}", cli.config.display()))?;
    tracing::info!("Configuration loaded successfully (hash: {})", config_hash);

    let mut engine = EngineConfig::from_config(&config, &config_hash);
    if let Some(threads) = cli.threads {
        engine.threads = threads as usize;
    }

    if cli.dry_run {
        handle_dry_run(&cli, &config, &engine);
    } else if cli.stats {
        handle_stats(&engine.crawl_path)?;
    } else {
        handle_crawl(&cli, &config, engine).await?;
    }

    Ok(())
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        // Only show errors
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("sumi_harvest=info,warn"),
            1 => EnvFilter::new("sumi_harvest=debug,info"),
            2 => EnvFilter::new("sumi_harvest=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Handles the --dry-run mode: shows the crawl plan
fn handle_dry_run(cli: &Cli, config: &Config, engine: &EngineConfig) {
    println!("=== Sumi-Harvest Dry Run ===\n");

    println!("Crawl:");
    println!("  Rounds: {}", cli.depth(config));
    println!("  Resumable: {}", cli.resumable(config));
    println!("  Workers: {}", engine.threads);
    println!("  Queue target size: {}", engine.queue_target_size);
    match engine.top_n {
        Some(n) => println!("  Records per round: at most {}", n),
        None => println!("  Records per round: unlimited"),
    }

    println!("\nFetch:");
    println!("  Retries: {} ({}ms apart)", engine.max_retries, engine.retry_delay.as_millis());
    println!("  Politeness delay: {}ms", engine.politeness_delay.as_millis());
    println!("  Timeout: {}ms", config.fetch.timeout_ms);
    println!("  Store content: {}", engine.store_content);

    println!("\nWatchdog:");
    println!("  Poll interval: {}ms", engine.poll_interval.as_millis());
    println!("  Hang threshold: {}ms", engine.hang_threshold.as_millis());
    println!("  Grace period: {}ms", engine.grace_period.as_millis());

    println!("\nUser Agent:");
    println!("  {}", config.user_agent.header_value());

    println!("\nOutput:");
    println!("  Crawl path: {}", engine.crawl_path.display());

    println!("\nSeeds ({}):", config.seeds.len());
    for seed in &config.seeds {
        println!("  * {}", seed);
    }
    if !config.forced_seeds.is_empty() {
        println!("\nForced Seeds ({}):", config.forced_seeds.len());
        for seed in &config.forced_seeds {
            println!("  * {}", seed);
        }
    }

    println!("\n✓ Configuration is valid");
}

/// Handles the --stats mode: shows statistics from the crawl database
fn handle_stats(crawl_path: &Path) -> anyhow::Result<()> {
    if !crawl_path.exists() {
        anyhow::bail!("No crawl database at {}", crawl_path.display());
    }

    println!("Crawl path: {}\n", crawl_path.display());
    let db = CrawlDb::open(crawl_path).context("Failed to open crawl database")?;
    let stats = load_statistics(&db)?;
    print_statistics(&stats);

    Ok(())
}

/// Handles the main crawl operation
async fn handle_crawl(cli: &Cli, config: &Config, engine: EngineConfig) -> anyhow::Result<()> {
    let resumable = cli.resumable(config);
    if resumable {
        tracing::info!("Starting crawl (continuing from earlier history)");
    } else {
        tracing::info!("Starting fresh crawl (discarding earlier history)");
    }
    tracing::info!(
        "Seeds: {}, forced seeds: {}",
        config.seeds.len(),
        config.forced_seeds.len()
    );

    let transport = HttpTransport::new(&config.user_agent, &config.fetch)
        .context("Failed to build HTTP client")?;
    let extractor = HtmlLinkExtractor::new(&config.extract);

    let crawler = Crawler::new(config, transport, extractor)
        .with_engine(engine)
        .with_resumable(resumable);

    let stop = crawler.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, stopping the crawl");
            stop.cancel();
        }
    });

    match crawler.start(cli.depth(config)).await {
        Ok(report) => {
            print_report(&report);
            Ok(())
        }
        Err(e) => {
            tracing::error!("Crawl failed: {}", e);
            Err(e.into())
        }
    }
}

fn print_report(report: &CrawlReport) {
    println!("=== Crawl Report ===\n");
    for (depth, round) in report.rounds.iter().enumerate() {
        let ending = match &round.abort {
            Some(reason) => format!("aborted ({})", reason),
            None => "completed".to_string(),
        };
        println!(
            "  Round {}: {} generated, {} fetched, {} failed, {} links, {:.1}s, {}",
            depth + 1,
            round.generated,
            round.fetched,
            round.failed,
            round.links,
            round.duration.as_secs_f64(),
            ending
        );
    }
    println!(
        "\nTotal: {} fetched, {} failed in {:.1}s",
        report.total_fetched(),
        report.total_failed(),
        report.duration().as_secs_f64()
    );
}
