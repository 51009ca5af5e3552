use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;

use super::parser::{parse_feed, ParsedFeed};
use super::{Candidate, ContentSource, FetchError};
use crate::storage::{Account, AccountProfile};

const MAX_RETRIES: u32 = 3;
const MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB
const NAME_PLACEHOLDER: &str = "{name}";

/// Fetches account feeds over HTTP.
///
/// `feed_url_template` and `profile_url_template` contain a `{name}`
/// placeholder that is replaced by the account name. Names are validated by
/// the registry before they reach this type, so no escaping is applied.
#[derive(Clone)]
pub struct HttpFeedSource {
    client: reqwest::Client,
    feed_url_template: String,
    profile_url_template: String,
    request_timeout: Duration,
    base_backoff: Duration,
}

impl HttpFeedSource {
    pub fn new(
        client: reqwest::Client,
        feed_url_template: impl Into<String>,
        profile_url_template: impl Into<String>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            client,
            feed_url_template: feed_url_template.into(),
            profile_url_template: profile_url_template.into(),
            request_timeout,
            base_backoff: Duration::from_secs(2),
        }
    }

    /// Override the first retry delay (doubles on each retry). Tests use a
    /// few milliseconds here.
    pub fn with_base_backoff(mut self, base_backoff: Duration) -> Self {
        self.base_backoff = base_backoff;
        self
    }

    fn feed_url(&self, name: &str) -> String {
        self.feed_url_template.replace(NAME_PLACEHOLDER, name)
    }

    fn profile_url(&self, name: &str) -> String {
        self.profile_url_template.replace(NAME_PLACEHOLDER, name)
    }

    async fn fetch_feed(&self, name: &str) -> Result<ParsedFeed, FetchError> {
        let url = self.feed_url(name);
        let bytes = self.fetch_bytes(&url).await?;
        parse_feed(&bytes).map_err(|e| FetchError::Parse(e.to_string()))
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let mut retry_count = 0;

        loop {
            let response = tokio::time::timeout(self.request_timeout, self.client.get(url).send())
                .await
                .map_err(|_| FetchError::Timeout)?
                .map_err(FetchError::Network)?;

            let status = response.status();

            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                if retry_count >= MAX_RETRIES {
                    return Err(FetchError::RateLimited(MAX_RETRIES));
                }
                let delay = self.base_backoff * 2u32.pow(retry_count);
                tracing::warn!(
                    url = %url,
                    retry = retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "Rate limited, backing off"
                );
                tokio::time::sleep(delay).await;
                retry_count += 1;
                continue;
            }

            if status.is_server_error() {
                if retry_count >= MAX_RETRIES {
                    return Err(FetchError::HttpStatus(status.as_u16()));
                }
                let delay = self.base_backoff * 2u32.pow(retry_count);
                tracing::warn!(
                    url = %url,
                    status = %status,
                    retry = retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "Server error, retrying after delay"
                );
                tokio::time::sleep(delay).await;
                retry_count += 1;
                continue;
            }

            // 4xx errors fail immediately
            if !status.is_success() {
                return Err(FetchError::HttpStatus(status.as_u16()));
            }

            return read_limited_bytes(response, MAX_FEED_SIZE).await;
        }
    }
}

#[async_trait]
impl ContentSource for HttpFeedSource {
    async fn probe(&self, name: &str) -> Result<AccountProfile, FetchError> {
        let parsed = match self.fetch_feed(name).await {
            Ok(parsed) => parsed,
            Err(FetchError::HttpStatus(404)) | Err(FetchError::HttpStatus(410)) => {
                return Err(FetchError::NotFound(name.to_string()));
            }
            Err(e) => return Err(e),
        };

        tracing::debug!(account = %name, entries = parsed.entries.len(), "Probe succeeded");
        Ok(AccountProfile {
            name: name.to_string(),
            profile_url: self.profile_url(name),
            icon_url: parsed.icon_url,
        })
    }

    async fn fetch_candidates(
        &self,
        account: &Account,
        max: usize,
    ) -> Result<Vec<Candidate>, FetchError> {
        let parsed = self.fetch_feed(&account.name).await?;

        let skipped = parsed.entries.iter().filter(|c| c.is_err()).count();
        if skipped > 0 {
            tracing::warn!(
                account = %account.name,
                skipped = skipped,
                "Entries without a usable identifier"
            );
        }

        let mut entries = parsed.entries;
        entries.truncate(max);
        Ok(entries)
    }
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    if let Some(len) = response.content_length() {
        if len as usize > limit {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::FetchErrorKind;
    use wiremock::matchers::{any, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const VALID_RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <item><guid>p2</guid><title>Second</title></item>
    <item><guid>p1</guid><title>First</title></item>
</channel></rss>"#;

    fn source(server: &MockServer) -> HttpFeedSource {
        HttpFeedSource::new(
            reqwest::Client::new(),
            format!("{}/feeds/{{name}}.xml", server.uri()),
            "https://example.com/u/{name}/",
            Duration::from_secs(5),
        )
        .with_base_backoff(Duration::from_millis(5))
    }

    fn account(name: &str) -> Account {
        Account {
            id: 1,
            name: name.to_string(),
            profile_url: format!("https://example.com/u/{name}/"),
            icon_url: None,
            date_added: 0,
            last_checked: None,
            last_error: None,
            consecutive_failures: 0,
        }
    }

    #[tokio::test]
    async fn test_probe_existing_account() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feeds/alice.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(VALID_RSS))
            .mount(&server)
            .await;

        let profile = source(&server).probe("alice").await.unwrap();
        assert_eq!(profile.name, "alice");
        assert_eq!(profile.profile_url, "https://example.com/u/alice/");
    }

    #[tokio::test]
    async fn test_probe_missing_account() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = source(&server).probe("ghost").await.unwrap_err();
        assert_eq!(err.kind(), FetchErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_fetch_truncates_to_max() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(VALID_RSS))
            .mount(&server)
            .await;

        let candidates = source(&server)
            .fetch_candidates(&account("alice"), 1)
            .await
            .unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].as_ref().unwrap().external_id, "p2");
    }

    #[tokio::test]
    async fn test_500_retries_then_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(4) // Initial request + 3 retries
            .mount(&server)
            .await;

        let err = source(&server)
            .fetch_candidates(&account("alice"), 5)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus(500)));
        assert_eq!(err.kind(), FetchErrorKind::Transient);
    }

    #[tokio::test]
    async fn test_503_retry_then_success() {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(200).set_body_string(VALID_RSS))
            .mount(&server)
            .await;

        let candidates = source(&server)
            .fetch_candidates(&account("alice"), 5)
            .await
            .unwrap();
        assert_eq!(candidates.len(), 2);
    }

    #[tokio::test]
    async fn test_rate_limited_after_retries() {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let err = source(&server)
            .fetch_candidates(&account("alice"), 5)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::RateLimited(3)));
    }

    #[tokio::test]
    async fn test_malformed_feed_parse_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<not valid xml"))
            .mount(&server)
            .await;

        let err = source(&server)
            .fetch_candidates(&account("alice"), 5)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FetchErrorKind::ParseFailure);
    }
}
