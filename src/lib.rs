//! Sumi-Harvest: a resumable breadth-first fetch engine
//!
//! This crate drains a URL frontier through a pool of fetch workers, hands each
//! page to pluggable extraction logic, writes every outcome to a per-round
//! segment and merges that segment into a durable crawl database so repeated
//! rounds converge without re-fetching work that is already done.

pub mod config;
pub mod crawler;
pub mod output;
pub mod record;
pub mod storage;
pub mod url;

use thiserror::Error;

/// Main error type for Sumi-Harvest operations
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("URL error: {0}")]
    UrlError(#[from] UrlError),

    #[error("Invalid status transition for {url}: {from:?} -> {to:?}")]
    InvalidTransition {
        url: String,
        from: record::FetchStatus,
        to: record::FetchStatus,
    },

    #[error("Frontier error: {0}")]
    Frontier(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),

    #[error("No seeds configured: add at least one seed or forced seed")]
    NoSeeds,
}

/// URL-specific errors
#[derive(Debug, Error)]
pub enum UrlError {
    #[error("Failed to parse URL: {0}")]
    Parse(String),

    #[error("Invalid URL scheme: {0}")]
    InvalidScheme(String),

    #[error("Missing domain in URL")]
    MissingDomain,

    #[error("Malformed URL: {0}")]
    Malformed(String),
}

/// Result type alias for Sumi-Harvest operations
pub type Result<T> = std::result::Result<T, HarvestError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for URL operations
pub type UrlResult<T> = std::result::Result<T, UrlError>;

// Re-export commonly used types
pub use config::{Config, EngineConfig};
pub use crawler::{Crawler, Extractor, Frontier, Transport};
pub use record::{FetchRecord, FetchStatus};
pub use storage::CrawlDb;
pub use url::normalize_url;
