//! Output module for reporting on a crawl
//!
//! Statistics are read straight from the crawl database, so they can be
//! printed while no crawl is running.

pub mod stats;

pub use stats::{load_statistics, print_statistics, CrawlStatistics};
