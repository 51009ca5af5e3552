//! Configuration file parser for ~/.config/postwatch/config.toml.
//!
//! The config file is optional: a missing file yields `Config::default()`.
//! Unknown keys are accepted by serde, though we log a warning when the file
//! contains potential typos. [`Config::validate`] runs before anything is
//! constructed from the values.
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// How the poll engine decides where to stop scanning a newest-first feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupPolicy {
    /// Stop at the first already-handled item; feeds are append-only
    #[default]
    StopAtFirstSeen,
    /// Check every fetched item; tolerates providers that reorder or backfill
    FullScan,
}

/// Where account feeds are fetched from.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Feed URL with a `{name}` placeholder. Required to watch or add.
    pub feed_url_template: Option<String>,
    /// Public profile URL with a `{name}` placeholder. Defaults to the feed URL.
    pub profile_url_template: Option<String>,
}

/// Where notifications are sent.
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Chat webhook URL. The POSTWATCH_WEBHOOK_URL env var takes precedence.
    pub webhook_url: Option<String>,
}

/// Mask the webhook URL in Debug output; it carries the channel credential.
impl std::fmt::Debug for SinkConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkConfig")
            .field("webhook_url", &self.webhook_url.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Top-level application configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Seconds between scheduler ticks.
    pub poll_interval_seconds: u64,

    /// Maximum candidates requested per account per cycle.
    pub fetch_count_per_cycle: usize,

    /// Accounts polled at the same time.
    pub max_concurrent_accounts: usize,

    /// Retries after the first failed delivery attempt.
    pub delivery_retry_limit: u32,

    /// Delay before the first delivery retry; doubles on each retry.
    pub delivery_backoff_ms: u64,

    /// Timeout for one whole fetch, including HTTP retries.
    pub fetch_timeout_seconds: u64,

    /// Timeout for one delivery attempt.
    pub delivery_timeout_seconds: u64,

    pub dedup_policy: DedupPolicy,

    /// Posts delivered right after an account is added; the rest of the
    /// current feed is marked handled silently.
    pub initial_backfill: usize,

    /// SQLite database path. Defaults to `<config dir>/postwatch.db`.
    pub database_path: Option<String>,

    pub source: SourceConfig,

    pub sink: SinkConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 300,
            fetch_count_per_cycle: 3,
            max_concurrent_accounts: 4,
            delivery_retry_limit: 3,
            delivery_backoff_ms: 1000,
            fetch_timeout_seconds: 60,
            delivery_timeout_seconds: 15,
            dedup_policy: DedupPolicy::default(),
            initial_backfill: 1,
            database_path: None,
            source: SourceConfig::default(),
            sink: SinkConfig::default(),
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Environment variable overriding `sink.webhook_url`.
    pub const WEBHOOK_ENV: &'static str = "POSTWATCH_WEBHOOK_URL";

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    /// - Out-of-range values → `Err(ConfigError::Invalid)`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        let config = Self::from_toml(&content)?;
        tracing::info!(
            path = %path.display(),
            interval = config.poll_interval_seconds,
            policy = ?config.dedup_policy,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Parse and validate TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            let known_keys = [
                "poll_interval_seconds",
                "fetch_count_per_cycle",
                "max_concurrent_accounts",
                "delivery_retry_limit",
                "delivery_backoff_ms",
                "fetch_timeout_seconds",
                "delivery_timeout_seconds",
                "dedup_policy",
                "initial_backfill",
                "database_path",
                "source",
                "sink",
            ];
            for key in raw.keys() {
                if !known_keys.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides (currently the webhook URL).
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(Self::WEBHOOK_ENV) {
            if !url.trim().is_empty() {
                self.sink.webhook_url = Some(url);
            }
        }
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_seconds == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_seconds must be at least 1".into(),
            ));
        }
        if self.fetch_count_per_cycle == 0 {
            return Err(ConfigError::Invalid(
                "fetch_count_per_cycle must be at least 1".into(),
            ));
        }
        if self.max_concurrent_accounts == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_accounts must be at least 1".into(),
            ));
        }
        if self.fetch_timeout_seconds == 0 || self.delivery_timeout_seconds == 0 {
            return Err(ConfigError::Invalid("timeouts must be at least 1 second".into()));
        }
        if self.delivery_retry_limit > 10 {
            return Err(ConfigError::Invalid(
                "delivery_retry_limit must be at most 10".into(),
            ));
        }
        if self.initial_backfill > self.fetch_count_per_cycle {
            return Err(ConfigError::Invalid(
                "initial_backfill cannot exceed fetch_count_per_cycle".into(),
            ));
        }
        for (key, template) in [
            ("source.feed_url_template", &self.source.feed_url_template),
            ("source.profile_url_template", &self.source.profile_url_template),
        ] {
            if let Some(template) = template {
                check_template(key, template)?;
            }
        }
        Ok(())
    }

    /// The feed template, or an error explaining it must be configured.
    pub fn feed_url_template(&self) -> Result<&str, ConfigError> {
        self.source
            .feed_url_template
            .as_deref()
            .ok_or_else(|| ConfigError::Invalid("source.feed_url_template is required".into()))
    }

    /// Timeout for a single HTTP request, shared by feed fetches and
    /// webhook posts. Never longer than a whole fetch may take.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_seconds)
    }

    /// Engine tuning derived from this configuration.
    pub fn engine(&self) -> EngineConfig {
        let fetch_timeout = Duration::from_secs(self.fetch_timeout_seconds);
        let delivery_timeout = Duration::from_secs(self.delivery_timeout_seconds);
        let delivery_backoff = Duration::from_millis(self.delivery_backoff_ms);

        // Worst case for one item: every attempt times out, plus the
        // doubling backoff between attempts
        let retries = self.delivery_retry_limit.min(16);
        let per_item = delivery_timeout
            .saturating_mul(retries + 1)
            .saturating_add(delivery_backoff.saturating_mul((1u32 << retries) - 1));
        let items = u32::try_from(self.fetch_count_per_cycle).unwrap_or(u32::MAX);
        let cycle_lease = fetch_timeout
            .saturating_add(per_item.saturating_mul(items))
            .saturating_add(LEASE_MARGIN);

        EngineConfig {
            poll_interval: Duration::from_secs(self.poll_interval_seconds),
            fetch_count: self.fetch_count_per_cycle,
            max_concurrent_accounts: self.max_concurrent_accounts,
            delivery_retry_limit: self.delivery_retry_limit,
            delivery_backoff,
            fetch_timeout,
            delivery_timeout,
            dedup_policy: self.dedup_policy,
            cycle_lease,
        }
    }
}

/// Slack on top of the computed cycle duration for bookkeeping writes.
const LEASE_MARGIN: Duration = Duration::from_secs(60);

fn check_template(key: &str, template: &str) -> Result<(), ConfigError> {
    if !template.contains("{name}") {
        return Err(ConfigError::Invalid(format!(
            "{key} must contain a {{name}} placeholder"
        )));
    }
    let sample = template.replace("{name}", "sample");
    let url = url::Url::parse(&sample)
        .map_err(|e| ConfigError::Invalid(format!("{key} is not a valid URL: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(ConfigError::Invalid(format!(
            "{key} uses unsupported scheme {scheme} (only http/https allowed)"
        ))),
    }
}

/// Typed engine settings, already validated.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub poll_interval: Duration,
    pub fetch_count: usize,
    pub max_concurrent_accounts: usize,
    pub delivery_retry_limit: u32,
    pub delivery_backoff: Duration,
    pub fetch_timeout: Duration,
    pub delivery_timeout: Duration,
    pub dedup_policy: DedupPolicy,
    /// How long a cycle's claim on an account lasts before another process
    /// may take it over. Covers the slowest possible cycle.
    pub cycle_lease: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Config::default().engine()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.poll_interval_seconds, 300);
        assert_eq!(config.fetch_count_per_cycle, 3);
        assert_eq!(config.max_concurrent_accounts, 4);
        assert_eq!(config.delivery_retry_limit, 3);
        assert_eq!(config.dedup_policy, DedupPolicy::StopAtFirstSeen);
        assert_eq!(config.initial_backfill, 1);
        assert!(config.sink.webhook_url.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_returns_default() {
        let path = Path::new("/tmp/postwatch_test_nonexistent_config.toml");
        let config = Config::load(path).unwrap();
        assert_eq!(config.poll_interval_seconds, 300);
    }

    #[test]
    fn test_empty_file_returns_default() {
        let dir = std::env::temp_dir().join("postwatch_config_test_empty");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "  \n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.fetch_count_per_cycle, 3);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_full_config() {
        let content = r#"
poll_interval_seconds = 60
fetch_count_per_cycle = 5
max_concurrent_accounts = 2
delivery_retry_limit = 1
delivery_backoff_ms = 250
dedup_policy = "full_scan"
initial_backfill = 0
database_path = "/var/lib/postwatch/state.db"

[source]
feed_url_template = "https://feeds.example.com/{name}.rss"
profile_url_template = "https://example.com/u/{name}/"

[sink]
webhook_url = "https://chat.example.com/api/webhooks/1/token"
"#;
        let config = Config::from_toml(content).unwrap();
        assert_eq!(config.poll_interval_seconds, 60);
        assert_eq!(config.fetch_count_per_cycle, 5);
        assert_eq!(config.dedup_policy, DedupPolicy::FullScan);
        assert_eq!(config.initial_backfill, 0);
        assert_eq!(
            config.feed_url_template().unwrap(),
            "https://feeds.example.com/{name}.rss"
        );
        assert_eq!(
            config.sink.webhook_url.as_deref(),
            Some("https://chat.example.com/api/webhooks/1/token")
        );

        let engine = config.engine();
        assert_eq!(engine.poll_interval, Duration::from_secs(60));
        assert_eq!(engine.delivery_backoff, Duration::from_millis(250));
    }

    #[test]
    fn test_request_timeout_follows_fetch_timeout() {
        let config = Config::from_toml("fetch_timeout_seconds = 7\n").unwrap();
        assert_eq!(config.request_timeout(), Duration::from_secs(7));
        assert_eq!(config.request_timeout(), config.engine().fetch_timeout);
        assert_eq!(Config::default().request_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_cycle_lease_outlasts_slowest_cycle() {
        let engine = Config::default().engine();
        // 60s fetch + 3 items * (4 attempts * 15s + 1s + 2s + 4s backoff) + 60s margin
        assert_eq!(engine.cycle_lease, Duration::from_secs(60 + 3 * 67 + 60));
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let err = Config::from_toml("this is not [valid toml").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().contains("Invalid TOML"));
    }

    #[test]
    fn test_unknown_keys_accepted() {
        let config = Config::from_toml("poll_interval_seconds = 10\ntotally_fake_key = 1\n").unwrap();
        assert_eq!(config.poll_interval_seconds, 10);
    }

    #[test]
    fn test_unknown_policy_rejected() {
        assert!(Config::from_toml("dedup_policy = \"sometimes\"\n").is_err());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let err = Config::from_toml("poll_interval_seconds = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        assert!(Config::from_toml("max_concurrent_accounts = 0\n").is_err());
    }

    #[test]
    fn test_backfill_larger_than_fetch_rejected() {
        let err = Config::from_toml("fetch_count_per_cycle = 2\ninitial_backfill = 3\n").unwrap_err();
        assert!(err.to_string().contains("initial_backfill"));
    }

    #[test]
    fn test_template_without_placeholder_rejected() {
        let err = Config::from_toml("[source]\nfeed_url_template = \"https://example.com/feed\"\n")
            .unwrap_err();
        assert!(err.to_string().contains("{name}"));
    }

    #[test]
    fn test_template_with_bad_scheme_rejected() {
        assert!(Config::from_toml("[source]\nfeed_url_template = \"file:///{name}\"\n").is_err());
    }

    #[test]
    fn test_missing_feed_template_reported() {
        assert!(Config::default().feed_url_template().is_err());
    }

    #[test]
    fn test_too_large_file_rejected() {
        let dir = std::env::temp_dir().join("postwatch_config_test_too_large");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "a".repeat(1_048_577)).unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::TooLarge(_)));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_debug_masks_webhook_url() {
        let mut config = Config::default();
        config.sink.webhook_url = Some("https://chat.example.com/hook/s3cret".to_string());

        let debug_output = format!("{:?}", config);
        assert!(!debug_output.contains("s3cret"));
        assert!(debug_output.contains("[REDACTED]"));
    }
}
