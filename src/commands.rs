//! Operator commands layered on the engine's registry.
//!
//! Every command reports its outcome through the sink as a status message,
//! the same channel new posts go to.

use std::path::Path;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::engine::{AccountGuard, AddOutcome, Engine, RegistryError, RemoveOutcome};
use crate::notify::StatusMessage;
use crate::storage::{Account, HistoryEntry};

/// Maximum size of an account list file (1 MB)
const MAX_LIST_FILE_SIZE: u64 = 1024 * 1024;

/// Handled items shown by `history` unless asked otherwise.
pub const DEFAULT_HISTORY_LIMIT: i64 = 10;

/// Add/remove/list, with status reporting.
pub struct Commands {
    engine: Engine,
    cancel: CancellationToken,
    backfill: usize,
}

impl Commands {
    pub fn new(engine: Engine, cancel: CancellationToken) -> Self {
        Self {
            engine,
            cancel,
            backfill: 1,
        }
    }

    /// Number of existing items delivered right after an account is added.
    pub fn with_backfill(mut self, backfill: usize) -> Self {
        self.backfill = backfill;
        self
    }

    /// Add one account, report the outcome, and prime it if it is new.
    ///
    /// The account's lock is held from the insert through priming, so a
    /// scheduler in this process cannot poll the account in between.
    pub async fn add(&self, name: &str) -> Result<AddOutcome, RegistryError> {
        let guard = self.engine.lock_account(name).await;
        let outcome = self.engine.add_account_held(&guard).await?;

        let status = match &outcome {
            AddOutcome::Created(account) => {
                StatusMessage::new(format!("Added account {}.", account.name)).with_account(account)
            }
            AddOutcome::AlreadyExists(account) => {
                StatusMessage::new(format!("Already watching {}.", account.name))
                    .with_account(account)
            }
            AddOutcome::NotAValidAccount(name) => {
                StatusMessage::new(format!("\"{name}\" is not a valid account."))
            }
        };
        self.report(&status).await;

        if let AddOutcome::Created(account) = &outcome {
            self.prime(&guard, account).await;
        }

        Ok(outcome)
    }

    /// Add every name in `names`, continuing past names that fail.
    ///
    /// Returns one result per name, in order.
    pub async fn add_many(&self, names: &[String]) -> Vec<Result<AddOutcome, RegistryError>> {
        let mut results = Vec::with_capacity(names.len());
        for name in names {
            if self.cancel.is_cancelled() {
                break;
            }
            let result = self.add(name).await;
            if let Err(e) = &result {
                tracing::warn!(name = %name, error = %e, "Failed to add account");
            }
            results.push(result);
        }
        results
    }

    pub async fn remove(&self, name: &str) -> Result<RemoveOutcome, RegistryError> {
        let outcome = self.engine.remove_account(name).await?;

        let status = match &outcome {
            RemoveOutcome::Removed(account) => {
                StatusMessage::new(format!("Removed account {}.", account.name))
                    .with_account(account)
            }
            RemoveOutcome::NotFound => StatusMessage::new(format!("Not watching \"{name}\".")),
        };
        self.report(&status).await;

        Ok(outcome)
    }

    pub async fn list(&self) -> Result<Vec<Account>, RegistryError> {
        let accounts = self.engine.list_accounts().await?;

        let status = if accounts.is_empty() {
            StatusMessage::new("Not following any accounts.")
        } else {
            accounts.iter().fold(
                StatusMessage::new("Watching the following accounts:"),
                |status, account| status.with_field(&account.name, &account.profile_url),
            )
        };
        self.report(&status).await;

        Ok(accounts)
    }

    /// Show the most recently handled items of one account, newest first.
    ///
    /// Returns `None` when the account is not watched.
    pub async fn history(
        &self,
        name: &str,
        limit: i64,
    ) -> Result<Option<Vec<HistoryEntry>>, RegistryError> {
        let Some(account) = self.engine.database().get_account(name).await? else {
            self.report(&StatusMessage::new(format!("Not watching \"{name}\".")))
                .await;
            return Ok(None);
        };

        let entries = self
            .engine
            .database()
            .recent_handled(account.id, limit.max(1))
            .await?;

        let status = if entries.is_empty() {
            StatusMessage::new(format!("Nothing handled for {} yet.", account.name))
                .with_account(&account)
        } else {
            entries.iter().fold(
                StatusMessage::new(format!("Recently handled for {}:", account.name))
                    .with_account(&account),
                |status, entry| {
                    let value = match &entry.url {
                        Some(url) => format!("{} ({url})", entry.disposition),
                        None => entry.disposition.clone(),
                    };
                    status.with_field(&entry.title, &value)
                },
            )
        };
        self.report(&status).await;

        Ok(Some(entries))
    }

    async fn prime(&self, guard: &AccountGuard, account: &Account) {
        match self
            .engine
            .prime_account_held(guard, self.backfill, &self.cancel)
            .await
        {
            Ok(report) => {
                tracing::debug!(
                    account = %account.name,
                    delivered = report.delivered,
                    primed = report.primed,
                    "Primed new account"
                );
            }
            Err(e) => {
                // The first regular cycle picks the account up instead
                tracing::warn!(account = %account.name, error = %e, "Failed to prime new account");
            }
        }
    }

    async fn report(&self, status: &StatusMessage) {
        if let Err(e) = self.engine.sink().report_status(status).await {
            tracing::warn!(title = %status.title, error = %e, "Failed to report status");
        }
    }
}

/// Read a JSON array of account names from `path`.
pub fn read_account_list(path: &Path) -> Result<Vec<String>> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("Failed to read account list: {}", path.display()))?;
    if metadata.len() > MAX_LIST_FILE_SIZE {
        anyhow::bail!(
            "Account list too large: {} bytes (max {} bytes)",
            metadata.len(),
            MAX_LIST_FILE_SIZE
        );
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read account list: {}", path.display()))?;
    let names: Vec<String> = serde_json::from_str(&content)
        .with_context(|| format!("Account list must be a JSON array of names: {}", path.display()))?;

    Ok(names
        .into_iter()
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::storage::Database;
    use crate::testing::{item, RecordingSink, ScriptedSource};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    async fn commands() -> (Commands, Arc<ScriptedSource>, Arc<RecordingSink>) {
        let db = Database::open(":memory:").await.unwrap();
        let source = Arc::new(ScriptedSource::new());
        let sink = Arc::new(RecordingSink::new());
        let engine = Engine::new(db, source.clone(), sink.clone(), EngineConfig::default());
        (Commands::new(engine, CancellationToken::new()), source, sink)
    }

    fn titles(sink: &RecordingSink) -> Vec<String> {
        sink.statuses().into_iter().map(|s| s.title).collect()
    }

    #[tokio::test]
    async fn test_add_reports_and_primes() {
        let (commands, source, sink) = commands().await;
        source.set_feed("alice", vec![item("p2"), item("p1")]);

        commands.add("alice").await.unwrap();
        commands.add("alice").await.unwrap();
        commands.add("ghost").await.unwrap();

        assert_eq!(
            titles(&sink),
            vec![
                "Added account alice.",
                "Already watching alice.",
                "\"ghost\" is not a valid account.",
            ]
        );
        // Only the newest existing post is delivered on add
        assert_eq!(sink.delivered_ids(), vec!["p2"]);
    }

    #[tokio::test]
    async fn test_remove_and_list_messages() {
        let (commands, source, sink) = commands().await;
        source.add_known("alice");

        commands.list().await.unwrap();
        commands.add("alice").await.unwrap();
        commands.list().await.unwrap();
        commands.remove("alice").await.unwrap();
        commands.remove("alice").await.unwrap();

        let statuses = sink.statuses();
        assert_eq!(statuses[0].title, "Not following any accounts.");
        assert_eq!(statuses[2].title, "Watching the following accounts:");
        assert_eq!(
            statuses[2].fields,
            vec![("alice".to_string(), "https://example.com/u/alice/".to_string())]
        );
        assert_eq!(statuses[3].title, "Removed account alice.");
        assert_eq!(statuses[4].title, "Not watching \"alice\".");
    }

    #[tokio::test]
    async fn test_history_lists_newest_first() {
        let (commands, source, sink) = commands().await;
        source.set_feed("alice", vec![item("p2"), item("p1")]);
        commands.add("alice").await.unwrap();

        let entries = commands.history("alice", DEFAULT_HISTORY_LIMIT).await.unwrap().unwrap();
        let missing = commands.history("bob", DEFAULT_HISTORY_LIMIT).await.unwrap();

        let dispositions: Vec<_> = entries.iter().map(|e| e.disposition.as_str()).collect();
        assert_eq!(entries.len(), 2);
        assert!(dispositions.contains(&"delivered"));
        assert!(dispositions.contains(&"primed"));
        assert!(missing.is_none());

        let statuses = sink.statuses();
        assert_eq!(statuses[1].title, "Recently handled for alice:");
        assert_eq!(statuses[1].fields.len(), 2);
        assert!(statuses[1]
            .fields
            .contains(&("Post p2".to_string(), "delivered (https://example.com/p/p2/)".to_string())));
        assert_eq!(statuses[2].title, "Not watching \"bob\".");
    }

    #[tokio::test]
    async fn test_history_respects_limit() {
        let (commands, source, sink) = commands().await;
        source.add_known("alice");
        commands.add("alice").await.unwrap();
        assert!(commands.history("alice", 5).await.unwrap().unwrap().is_empty());

        source.set_feed("alice", vec![item("p3"), item("p2"), item("p1")]);
        let account = commands.engine.database().get_account("alice").await.unwrap().unwrap();
        commands
            .engine
            .poll_account(&account, &CancellationToken::new())
            .await
            .unwrap();

        let entries = commands.history("alice", 1).await.unwrap().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(sink.statuses()[1].title, "Nothing handled for alice yet.");
    }

    #[tokio::test]
    async fn test_scheduler_cannot_poll_between_add_and_prime() {
        let db = Database::open(":memory:").await.unwrap();
        let source = Arc::new(ScriptedSource::new());
        // Slow sink: the scheduler tick below lands while the add is still
        // reporting its status
        let sink = Arc::new(RecordingSink::new().with_delay(std::time::Duration::from_millis(100)));
        let engine = Engine::new(db, source.clone(), sink.clone(), EngineConfig::default());
        source.set_feed("alice", vec![item("p3"), item("p2"), item("p1")]);

        let commands = Commands::new(engine.clone(), CancellationToken::new());
        let add = tokio::spawn(async move { commands.add("alice").await });
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;

        let scheduler = crate::engine::Scheduler::new(engine, CancellationToken::new());
        let summary = scheduler.tick().await;
        add.await.unwrap().unwrap();

        assert_eq!(summary.accounts, 1);
        // Priming delivered the newest post; the tick then found nothing new
        assert_eq!(sink.delivered_ids(), vec!["p3"]);
    }

    #[tokio::test]
    async fn test_add_many_continues_past_failures() {
        let (commands, source, _sink) = commands().await;
        source.add_known("alice");
        source.add_known("bob");
        source.fail_next_probe(crate::feed::FetchError::HttpStatus(503));

        let names = vec!["alice".to_string(), "bob".to_string()];
        let results = commands.add_many(&names).await;

        assert!(results[0].is_err());
        assert!(matches!(results[1], Ok(AddOutcome::Created(_))));
    }

    #[test]
    fn test_read_account_list() {
        let path = std::env::temp_dir().join(format!("postwatch_accounts_{}.json", std::process::id()));
        std::fs::write(&path, r#"["alice", " bob ", ""]"#).unwrap();

        let names = read_account_list(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(names, vec!["alice", "bob"]);
    }

    #[test]
    fn test_read_account_list_rejects_objects() {
        let path = std::env::temp_dir().join(format!("postwatch_bad_{}.json", std::process::id()));
        std::fs::write(&path, r#"{"alice": 1}"#).unwrap();

        let result = read_account_list(&path);
        std::fs::remove_file(&path).ok();

        assert!(result.is_err());
    }
}
