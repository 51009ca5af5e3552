use thiserror::Error;

use super::locks::AccountGuard;
use super::Engine;
use crate::feed::{FetchError, FetchErrorKind};
use crate::storage::{Account, AccountProfile, PersistenceError};
use crate::util::validate_account_name;

/// Result of adding an account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    Created(Account),
    /// The name was already watched; nothing changed
    AlreadyExists(Account),
    /// The name is malformed or the provider has no such account
    NotAValidAccount(String),
}

/// Result of removing an account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed(Account),
    NotFound,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    /// The existence probe failed for a reason other than "no such account"
    #[error("Could not check account: {0}")]
    Probe(#[source] FetchError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl Engine {
    /// Start watching `name`.
    ///
    /// The name is probed with the content source first. Adding a name that
    /// is already watched reports `AlreadyExists` and never creates a second
    /// row, including when several adds of one name race.
    ///
    /// A created account stays leased to this engine until its first cycle
    /// here finishes (or the lease runs out), so other processes leave it
    /// alone while it is being primed.
    pub async fn add_account(&self, name: &str) -> Result<AddOutcome, RegistryError> {
        if let Err(e) = validate_account_name(name) {
            tracing::debug!(name = %name, error = %e, "Rejected account name");
            return Ok(AddOutcome::NotAValidAccount(name.to_string()));
        }

        let guard = self.locks.lock(name).await;
        self.add_account_held(&guard).await
    }

    /// [`add_account`](Self::add_account) for a caller that already holds
    /// the account's lock.
    pub async fn add_account_held(&self, guard: &AccountGuard) -> Result<AddOutcome, RegistryError> {
        let name = guard.name();
        if let Err(e) = validate_account_name(name) {
            tracing::debug!(name = %name, error = %e, "Rejected account name");
            return Ok(AddOutcome::NotAValidAccount(name.to_string()));
        }

        if let Some(existing) = self.db.get_account(name).await? {
            return Ok(AddOutcome::AlreadyExists(existing));
        }

        let probe = tokio::time::timeout(self.config.fetch_timeout, self.source.probe(name));
        let profile = match probe.await {
            Ok(Ok(profile)) => profile,
            Ok(Err(e)) if e.kind() == FetchErrorKind::NotFound => {
                tracing::info!(name = %name, "Account does not exist upstream");
                return Ok(AddOutcome::NotAValidAccount(name.to_string()));
            }
            Ok(Err(e)) => return Err(RegistryError::Probe(e)),
            Err(_) => return Err(RegistryError::Probe(FetchError::Timeout)),
        };

        let profile = AccountProfile {
            name: name.to_string(),
            ..profile
        };

        match self
            .db
            .insert_claimed_account(&profile, &self.owner, self.config.cycle_lease)
            .await?
        {
            Some(account) => {
                tracing::info!(account = %account.name, url = %account.profile_url, "Account added");
                Ok(AddOutcome::Created(account))
            }
            // Inserted by another process between the check and the insert
            None => match self.db.get_account(name).await? {
                Some(existing) => Ok(AddOutcome::AlreadyExists(existing)),
                None => Err(PersistenceError::Conflict(format!(
                    "account {name} vanished during insert"
                ))
                .into()),
            },
        }
    }

    /// Stop watching `name` and drop its dedup state in one transaction.
    ///
    /// Waits for a running cycle of that account to finish first.
    pub async fn remove_account(&self, name: &str) -> Result<RemoveOutcome, RegistryError> {
        let _guard = self.locks.lock(name).await;

        match self.db.delete_account(name).await? {
            Some(account) => {
                self.states.forget(name);
                tracing::info!(account = %name, "Account removed");
                Ok(RemoveOutcome::Removed(account))
            }
            None => Ok(RemoveOutcome::NotFound),
        }
    }

    /// All watched accounts, ordered by name.
    pub async fn list_accounts(&self) -> Result<Vec<Account>, RegistryError> {
        Ok(self.db.list_accounts().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::storage::Database;
    use crate::testing::{RecordingSink, ScriptedSource};
    use std::sync::Arc;

    async fn engine() -> (Engine, Arc<ScriptedSource>) {
        let db = Database::open(":memory:").await.unwrap();
        let source = Arc::new(ScriptedSource::new());
        let engine = Engine::new(
            db,
            source.clone(),
            Arc::new(RecordingSink::new()),
            EngineConfig::default(),
        );
        (engine, source)
    }

    #[tokio::test]
    async fn test_add_then_already_exists() {
        let (engine, source) = engine().await;
        source.add_known("alice");

        let first = engine.add_account("alice").await.unwrap();
        let second = engine.add_account("alice").await.unwrap();

        assert!(matches!(first, AddOutcome::Created(ref a) if a.name == "alice"));
        assert!(matches!(second, AddOutcome::AlreadyExists(_)));
        assert_eq!(engine.list_accounts().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_account_is_not_valid() {
        let (engine, _source) = engine().await;

        let outcome = engine.add_account("ghost").await.unwrap();

        assert_eq!(outcome, AddOutcome::NotAValidAccount("ghost".into()));
        assert!(engine.list_accounts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_name_is_not_probed() {
        let (engine, source) = engine().await;
        source.fail_next_probe(FetchError::HttpStatus(500));

        let outcome = engine.add_account("../etc").await.unwrap();

        assert_eq!(outcome, AddOutcome::NotAValidAccount("../etc".into()));
    }

    #[tokio::test]
    async fn test_probe_outage_is_an_error() {
        let (engine, source) = engine().await;
        source.add_known("alice");
        source.fail_next_probe(FetchError::HttpStatus(503));

        let result = engine.add_account("alice").await;

        assert!(matches!(result, Err(RegistryError::Probe(FetchError::HttpStatus(503)))));
        assert!(engine.list_accounts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_new_account_is_leased_to_the_adding_engine() {
        let (engine, source) = engine().await;
        source.add_known("alice");

        let AddOutcome::Created(account) = engine.add_account("alice").await.unwrap() else {
            panic!("expected Created");
        };

        let ttl = std::time::Duration::from_secs(60);
        let db = engine.database();
        assert!(db.claim_account(account.id, "elsewhere", ttl).await.unwrap().is_none());
        assert!(db.claim_account(account.id, engine.owner(), ttl).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_remove_twice() {
        let (engine, source) = engine().await;
        source.add_known("alice");
        engine.add_account("alice").await.unwrap();

        let first = engine.remove_account("alice").await.unwrap();
        let second = engine.remove_account("alice").await.unwrap();

        assert!(matches!(first, RemoveOutcome::Removed(ref a) if a.name == "alice"));
        assert_eq!(second, RemoveOutcome::NotFound);
    }
}
