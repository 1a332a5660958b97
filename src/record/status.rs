/// Fetch status definitions for tracking a URL across rounds
///
/// This module defines the states a record can be in inside the crawl database.
use std::fmt;

/// Represents where a record is in its crawl lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FetchStatus {
    // ===== Pending States =====
    /// Injected or regenerated, waiting for a fetch attempt
    Unfetched,

    /// Known only because another page referenced it
    Linked,

    // ===== Done States =====
    /// Fetched successfully
    Fetched,

    /// Fetched successfully, but the server answered from another URL
    Redirected,

    // ===== Terminal Failure =====
    /// Not found, or every attempt failed
    Gone,
}

impl FetchStatus {
    /// Returns true if the record still waits for a fetch attempt
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Unfetched | Self::Linked)
    }

    /// Returns true if the record was fetched; this status is sticky across merges
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Fetched | Self::Redirected)
    }

    /// Returns true if this is the outcome of a fetch attempt
    pub fn is_outcome(&self) -> bool {
        !self.is_pending()
    }

    /// Returns true if a record may move from `self` to `next` within one run
    ///
    /// Only pending records take a fetch outcome. Nothing moves backwards.
    pub fn can_transition_to(&self, next: FetchStatus) -> bool {
        self.is_pending() && next.is_outcome()
    }

    /// Converts the status to its database string representation
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Unfetched => "unfetched",
            Self::Linked => "linked",
            Self::Fetched => "fetched",
            Self::Redirected => "redirected",
            Self::Gone => "gone",
        }
    }

    /// Parses a status from its database string representation
    ///
    /// Returns None if the string doesn't match any known status.
    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "unfetched" => Some(Self::Unfetched),
            "linked" => Some(Self::Linked),
            "fetched" => Some(Self::Fetched),
            "redirected" => Some(Self::Redirected),
            "gone" => Some(Self::Gone),
            _ => None,
        }
    }

    /// Returns all statuses
    pub fn all() -> [Self; 5] {
        [
            Self::Unfetched,
            Self::Linked,
            Self::Fetched,
            Self::Redirected,
            Self::Gone,
        ]
    }
}

impl fmt::Display for FetchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_db_string())
    }
}
