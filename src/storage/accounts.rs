use chrono::Utc;
use std::time::Duration;

use super::schema::Database;
use super::types::{Account, AccountProfile, PersistenceError};

const ACCOUNT_COLUMNS: &str = "id, name, profile_url, icon_url, date_added, last_checked, last_error, consecutive_failures";

impl Database {
    // ========================================================================
    // Account Registry
    // ========================================================================

    /// Insert a new account with an empty WatchState.
    ///
    /// Returns `None` when an account with the same name already exists; the
    /// existing row is left untouched. The UNIQUE constraint on `name` makes
    /// this safe against concurrent inserts from other connections.
    pub async fn insert_account(
        &self,
        profile: &AccountProfile,
    ) -> Result<Option<Account>, PersistenceError> {
        self.insert_account_row(profile, None).await
    }

    /// Insert a new account already leased to `owner` for `ttl`.
    ///
    /// No other owner can run a cycle for the account until `owner` releases
    /// it or the lease runs out, which closes the window between adding an
    /// account and priming it.
    pub async fn insert_claimed_account(
        &self,
        profile: &AccountProfile,
        owner: &str,
        ttl: Duration,
    ) -> Result<Option<Account>, PersistenceError> {
        self.insert_account_row(profile, Some((owner, ttl))).await
    }

    async fn insert_account_row(
        &self,
        profile: &AccountProfile,
        lease: Option<(&str, Duration)>,
    ) -> Result<Option<Account>, PersistenceError> {
        let now = Utc::now();
        let (owner, expires) = match lease {
            Some((owner, ttl)) => (Some(owner), Some(lease_deadline(ttl))),
            None => (None, None),
        };
        let inserted: Option<Account> = sqlx::query_as(&format!(
            r#"
            INSERT INTO accounts (name, profile_url, icon_url, date_added, lease_owner, lease_expires)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(name) DO NOTHING
            RETURNING {ACCOUNT_COLUMNS}
            "#
        ))
        .bind(&profile.name)
        .bind(&profile.profile_url)
        .bind(&profile.icon_url)
        .bind(now.timestamp())
        .bind(owner)
        .bind(expires)
        .fetch_optional(&self.pool)
        .await?;

        Ok(inserted)
    }

    /// Look up an account by its exact (case-sensitive) name.
    pub async fn get_account(&self, name: &str) -> Result<Option<Account>, PersistenceError> {
        let account = sqlx::query_as(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE name = ?"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(account)
    }

    /// All accounts ordered by name.
    pub async fn list_accounts(&self) -> Result<Vec<Account>, PersistenceError> {
        let accounts = sqlx::query_as(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts ORDER BY name"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(accounts)
    }

    /// Delete an account together with its entire WatchState.
    ///
    /// Both deletes run in one transaction: either the account and all of its
    /// handled ids disappear, or nothing changes. Returns the removed account,
    /// or `None` if no account had that name.
    pub async fn delete_account(&self, name: &str) -> Result<Option<Account>, PersistenceError> {
        let mut tx = self.begin_write().await?;

        let account: Option<Account> = sqlx::query_as(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE name = ?"
        ))
        .bind(name)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(account) = account else {
            tx.rollback().await?;
            return Ok(None);
        };

        let handled = sqlx::query("DELETE FROM handled_items WHERE account_id = ?")
            .bind(account.id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        sqlx::query("DELETE FROM accounts WHERE id = ?")
            .bind(account.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::debug!(account = %account.name, handled = handled, "Deleted account and watch state");
        Ok(Some(account))
    }

    /// Record the outcome of a cycle on the account row.
    ///
    /// `None` clears the error and resets the failure counter; `Some` stores
    /// the message and increments it. Returns the new failure count.
    pub async fn record_cycle_result(
        &self,
        account_id: i64,
        error: Option<&str>,
    ) -> Result<i64, PersistenceError> {
        let now = Utc::now().timestamp();
        let failures: Option<(i64,)> = match error {
            None => {
                sqlx::query_as(
                    r#"
                    UPDATE accounts
                    SET last_checked = ?, last_error = NULL, consecutive_failures = 0
                    WHERE id = ?
                    RETURNING consecutive_failures
                    "#,
                )
                .bind(now)
                .bind(account_id)
                .fetch_optional(&self.pool)
                .await?
            }
            Some(message) => {
                sqlx::query_as(
                    r#"
                    UPDATE accounts
                    SET last_checked = ?, last_error = ?, consecutive_failures = consecutive_failures + 1
                    WHERE id = ?
                    RETURNING consecutive_failures
                    "#,
                )
                .bind(now)
                .bind(message)
                .bind(account_id)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        // Account removed while its cycle was running: nothing to record.
        Ok(failures.map(|(count,)| count).unwrap_or(0))
    }

    // ========================================================================
    // Cycle Leases
    // ========================================================================

    /// Claim the account for one cycle.
    ///
    /// Succeeds when the account is unclaimed, its lease has expired, or
    /// `owner` already holds it; the lease is then (re)set to expire after
    /// `ttl`. Returns the fresh account row, or `None` when another owner
    /// holds a live lease or the account no longer exists.
    ///
    /// The check and the write are one UPDATE, so two processes racing for
    /// the same account cannot both win.
    pub async fn claim_account(
        &self,
        account_id: i64,
        owner: &str,
        ttl: Duration,
    ) -> Result<Option<Account>, PersistenceError> {
        let now = Utc::now().timestamp_millis();
        let claimed = sqlx::query_as(&format!(
            r#"
            UPDATE accounts
            SET lease_owner = ?, lease_expires = ?
            WHERE id = ?
              AND (lease_owner IS NULL OR lease_owner = ? OR lease_expires <= ?)
            RETURNING {ACCOUNT_COLUMNS}
            "#
        ))
        .bind(owner)
        .bind(lease_deadline(ttl))
        .bind(account_id)
        .bind(owner)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(claimed)
    }

    /// Give up `owner`'s lease on the account. A lease held by someone else
    /// is left alone.
    pub async fn release_account(&self, account_id: i64, owner: &str) -> Result<(), PersistenceError> {
        sqlx::query(
            "UPDATE accounts SET lease_owner = NULL, lease_expires = NULL WHERE id = ? AND lease_owner = ?",
        )
        .bind(account_id)
        .bind(owner)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Unix milliseconds `ttl` from now.
fn lease_deadline(ttl: Duration) -> i64 {
    let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    Utc::now().timestamp_millis().saturating_add(ttl_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(name: &str) -> AccountProfile {
        AccountProfile {
            name: name.to_string(),
            profile_url: format!("https://example.com/u/{name}/"),
            icon_url: None,
        }
    }

    #[tokio::test]
    async fn test_insert_twice_keeps_one_row() {
        let db = Database::open(":memory:").await.unwrap();

        let first = db.insert_account(&profile("alice")).await.unwrap();
        let second = db.insert_account(&profile("alice")).await.unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(db.list_accounts().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_names_are_case_sensitive() {
        let db = Database::open(":memory:").await.unwrap();

        db.insert_account(&profile("Alice")).await.unwrap();
        db.insert_account(&profile("alice")).await.unwrap();

        let names: Vec<_> = db
            .list_accounts()
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.name)
            .collect();
        assert_eq!(names, vec!["Alice", "alice"]);
    }

    #[tokio::test]
    async fn test_list_is_ordered_by_name() {
        let db = Database::open(":memory:").await.unwrap();
        for name in ["carol", "alice", "bob"] {
            db.insert_account(&profile(name)).await.unwrap();
        }

        let names: Vec<_> = db
            .list_accounts()
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.name)
            .collect();
        assert_eq!(names, vec!["alice", "bob", "carol"]);
    }

    #[tokio::test]
    async fn test_delete_missing_account() {
        let db = Database::open(":memory:").await.unwrap();
        assert!(db.delete_account("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_excludes_other_owners_until_released() {
        let db = Database::open(":memory:").await.unwrap();
        let account = db.insert_account(&profile("alice")).await.unwrap().unwrap();
        let ttl = Duration::from_secs(60);

        assert!(db.claim_account(account.id, "a", ttl).await.unwrap().is_some());
        assert!(db.claim_account(account.id, "b", ttl).await.unwrap().is_none());
        // Re-claiming your own lease extends it
        assert!(db.claim_account(account.id, "a", ttl).await.unwrap().is_some());

        // Releasing someone else's lease does nothing
        db.release_account(account.id, "b").await.unwrap();
        assert!(db.claim_account(account.id, "b", ttl).await.unwrap().is_none());

        db.release_account(account.id, "a").await.unwrap();
        assert!(db.claim_account(account.id, "b", ttl).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let db = Database::open(":memory:").await.unwrap();
        let account = db
            .insert_claimed_account(&profile("alice"), "a", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();

        let taken = db
            .claim_account(account.id, "b", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(taken.map(|a| a.name), Some("alice".to_string()));
    }

    #[tokio::test]
    async fn test_inserted_claim_blocks_other_owners() {
        let db = Database::open(":memory:").await.unwrap();
        let account = db
            .insert_claimed_account(&profile("alice"), "a", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        assert!(db
            .claim_account(account.id, "b", Duration::from_secs(60))
            .await
            .unwrap()
            .is_none());
        assert!(db
            .claim_account(account.id, "a", Duration::from_secs(60))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_claim_missing_account() {
        let db = Database::open(":memory:").await.unwrap();
        assert!(db
            .claim_account(42, "a", Duration::from_secs(60))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_record_cycle_result_counts_failures() {
        let db = Database::open(":memory:").await.unwrap();
        let account = db.insert_account(&profile("alice")).await.unwrap().unwrap();

        assert_eq!(db.record_cycle_result(account.id, Some("timeout")).await.unwrap(), 1);
        assert_eq!(db.record_cycle_result(account.id, Some("timeout")).await.unwrap(), 2);

        let stored = db.get_account("alice").await.unwrap().unwrap();
        assert_eq!(stored.last_error.as_deref(), Some("timeout"));
        assert!(stored.last_checked.is_some());

        assert_eq!(db.record_cycle_result(account.id, None).await.unwrap(), 0);
        let stored = db.get_account("alice").await.unwrap().unwrap();
        assert_eq!(stored.last_error, None);
        assert_eq!(stored.consecutive_failures, 0);
    }
}
