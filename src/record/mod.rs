//! Fetch records: the unit of work and of result
//!
//! A [`FetchRecord`] is created by the queue feeder (a copy of a frontier
//! entry) or by extraction (a freshly discovered link), mutated only by the
//! worker that owns it during its fetch attempt, and persisted through a
//! segment into the crawl database.

mod status;

pub use status::FetchStatus;

use crate::HarvestError;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Metadata key carrying the `Last-Modified` header between rounds
pub const META_LAST_MODIFIED: &str = "last-modified";

/// Metadata key carrying the `ETag` header between rounds
pub const META_ETAG: &str = "etag";

/// One URL's crawl lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRecord {
    url: String,
    key: String,
    pub status: FetchStatus,
    /// `None` until a fetch attempt completes
    pub fetch_time: Option<DateTime<Utc>>,
    /// Transport retries spent on the latest attempt
    pub retry_count: u32,
    /// Fetch attempts across all rounds
    pub execute_count: u32,
    pub http_code: Option<u16>,
    /// Final URL when the server redirected
    pub location: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl FetchRecord {
    /// Creates an unfetched record keyed by its URL
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            key: url.clone(),
            url,
            status: FetchStatus::Unfetched,
            fetch_time: None,
            retry_count: 0,
            execute_count: 0,
            http_code: None,
            location: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Creates a record for a URL discovered on another page
    pub fn linked(url: impl Into<String>) -> Self {
        Self {
            status: FetchStatus::Linked,
            ..Self::new(url)
        }
    }

    /// Replaces the database key (defaults to the URL)
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// Adds a metadata entry
    pub fn with_meta(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(name.into(), value.into());
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn meta(&self, name: &str) -> Option<&str> {
        self.metadata.get(name).map(String::as_str)
    }

    /// Rebuilds a record from stored columns
    pub(crate) fn from_parts(url: String, key: String, status: FetchStatus) -> Self {
        Self {
            status,
            key,
            ..Self::new(url)
        }
    }

    /// The copy the feeder enqueues: same identity and metadata, ready for a new attempt
    ///
    /// Records regenerated from a terminal status (forced seeds, retried gone
    /// records) start over as unfetched.
    pub fn for_fetch(&self) -> Self {
        let mut copy = self.clone();
        if !copy.status.is_pending() {
            copy.status = FetchStatus::Unfetched;
        }
        copy.retry_count = 0;
        copy
    }

    /// Applies the outcome of this round's fetch attempt
    ///
    /// # Returns
    ///
    /// * `Ok(())` - The record now carries `status`
    /// * `Err(HarvestError::InvalidTransition)` - The record was not pending, or
    ///   `status` is not an outcome
    pub fn complete(
        &mut self,
        status: FetchStatus,
        http_code: Option<u16>,
        retry_count: u32,
    ) -> Result<(), HarvestError> {
        if !self.status.can_transition_to(status) {
            return Err(HarvestError::InvalidTransition {
                url: self.url.clone(),
                from: self.status,
                to: status,
            });
        }
        self.status = status;
        self.http_code = http_code;
        self.retry_count = retry_count;
        self.execute_count += 1;
        self.fetch_time = Some(Utc::now());
        Ok(())
    }

    /// Short one-line description for logs
    pub fn brief(&self) -> String {
        match self.http_code {
            Some(code) => format!("{} [{} {}]", self.url, self.status, code),
            None => format!("{} [{}]", self.url, self.status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_defaults_to_url() {
        let record = FetchRecord::new("https://example.com/a");
        assert_eq!(record.key(), "https://example.com/a");
        assert_eq!(record.status, FetchStatus::Unfetched);
        assert!(record.fetch_time.is_none());
    }

    #[test]
    fn test_explicit_key() {
        let record = FetchRecord::linked("https://example.com/a?page=2").with_key("listing-2");
        assert_eq!(record.key(), "listing-2");
        assert_eq!(record.status, FetchStatus::Linked);
    }

    #[test]
    fn test_complete_moves_forward_once() {
        let mut record = FetchRecord::new("https://example.com/");
        record.complete(FetchStatus::Fetched, Some(200), 1).unwrap();

        assert_eq!(record.status, FetchStatus::Fetched);
        assert_eq!(record.http_code, Some(200));
        assert_eq!(record.retry_count, 1);
        assert_eq!(record.execute_count, 1);
        assert!(record.fetch_time.is_some());

        let again = record.complete(FetchStatus::Gone, None, 0);
        assert!(matches!(again, Err(HarvestError::InvalidTransition { .. })));
        assert_eq!(record.status, FetchStatus::Fetched);
    }

    #[test]
    fn test_for_fetch_resets_terminal_status() {
        let mut record = FetchRecord::new("https://example.com/").with_meta(META_ETAG, "\"abc\"");
        record.complete(FetchStatus::Gone, None, 3).unwrap();

        let copy = record.for_fetch();
        assert_eq!(copy.status, FetchStatus::Unfetched);
        assert_eq!(copy.retry_count, 0);
        assert_eq!(copy.execute_count, 1);
        assert_eq!(copy.meta(META_ETAG), Some("\"abc\""));
    }

    #[test]
    fn test_for_fetch_keeps_linked() {
        let record = FetchRecord::linked("https://example.com/b");
        assert_eq!(record.for_fetch().status, FetchStatus::Linked);
    }
}
