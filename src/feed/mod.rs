//! Content sources: where candidate items come from.
//!
//! The engine only sees the [`ContentSource`] trait. [`HttpFeedSource`] is the
//! bundled implementation: it renders a per-account feed URL from a template,
//! fetches it with retry and size limits, and parses RSS/Atom/JSON Feed with
//! `feed-rs`.
//!
//! # Architecture
//!
//! - [`parser`] - Turns feed bytes into per-entry candidates
//! - [`fetcher`] - HTTP retrieval, status classification and the existence probe

mod fetcher;
mod parser;

use async_trait::async_trait;
use thiserror::Error;

use crate::storage::{Account, AccountProfile, Item};

pub use fetcher::HttpFeedSource;
pub use parser::{parse_feed, ParsedFeed};

/// Errors that abort a whole fetch.
///
/// These cover the full lifecycle of a fetch: network issues, HTTP errors,
/// and content that cannot be parsed at all.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with a non-success status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// The request or the whole fetch exceeded its timeout
    #[error("Request timed out")]
    Timeout,
    /// Server returned 429 Too Many Requests after max retries
    #[error("Rate limited after {0} retries")]
    RateLimited(u32),
    /// Response body exceeded the size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// The content provider has no such account
    #[error("Account not found: {0}")]
    NotFound(String),
    /// The content could not be parsed as a feed
    #[error("Parse error: {0}")]
    Parse(String),
}

/// Coarse classification of a [`FetchError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    /// Worth retrying on the next cycle
    Transient,
    /// The account does not exist upstream
    NotFound,
    /// The response arrived but could not be understood
    ParseFailure,
}

impl FetchError {
    pub fn kind(&self) -> FetchErrorKind {
        match self {
            FetchError::NotFound(_) | FetchError::HttpStatus(404) | FetchError::HttpStatus(410) => {
                FetchErrorKind::NotFound
            }
            FetchError::Parse(_) | FetchError::ResponseTooLarge => FetchErrorKind::ParseFailure,
            FetchError::Network(_)
            | FetchError::HttpStatus(_)
            | FetchError::Timeout
            | FetchError::RateLimited(_) => FetchErrorKind::Transient,
        }
    }
}

/// A single entry that could not be turned into an [`Item`].
///
/// Only that entry is skipped; the rest of the fetch is still usable.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Could not extract entry {position}: {reason}")]
pub struct ExtractError {
    /// Zero-based position in the fetched (newest-first) list
    pub position: usize,
    pub reason: String,
}

/// One fetched entry, either a usable item or the reason it was unusable.
pub type Candidate = Result<Item, ExtractError>;

/// Supplies candidate items for watched accounts.
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Lightweight existence check used when an account is added.
    ///
    /// Returns `FetchError::NotFound` (or an error whose kind is
    /// [`FetchErrorKind::NotFound`]) when the account does not exist.
    async fn probe(&self, name: &str) -> Result<AccountProfile, FetchError>;

    /// Fetch at most `max` candidates for `account`, newest first.
    async fn fetch_candidates(
        &self,
        account: &Account,
        max: usize,
    ) -> Result<Vec<Candidate>, FetchError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(FetchError::Timeout.kind(), FetchErrorKind::Transient);
        assert_eq!(FetchError::HttpStatus(503).kind(), FetchErrorKind::Transient);
        assert_eq!(FetchError::RateLimited(3).kind(), FetchErrorKind::Transient);
        assert_eq!(FetchError::HttpStatus(404).kind(), FetchErrorKind::NotFound);
        assert_eq!(
            FetchError::NotFound("ghost".into()).kind(),
            FetchErrorKind::NotFound
        );
        assert_eq!(
            FetchError::Parse("bad xml".into()).kind(),
            FetchErrorKind::ParseFailure
        );
    }
}
