use chrono::Utc;
use sqlx::QueryBuilder;
use std::collections::HashSet;

use super::schema::Database;
use super::types::{HandledItem, HistoryEntry, PersistenceError};

impl Database {
    // ========================================================================
    // Dedup Store (WatchState)
    // ========================================================================

    /// The set of external ids already handled for an account.
    pub async fn handled_ids(&self, account_id: i64) -> Result<HashSet<String>, PersistenceError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT external_id FROM handled_items WHERE account_id = ?")
                .bind(account_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Number of handled ids stored for an account.
    pub async fn handled_count(&self, account_id: i64) -> Result<i64, PersistenceError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM handled_items WHERE account_id = ?")
                .bind(account_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Most recently handled items for an account, newest first.
    pub async fn recent_handled(
        &self,
        account_id: i64,
        limit: i64,
    ) -> Result<Vec<HistoryEntry>, PersistenceError> {
        let rows = sqlx::query_as(
            r#"
            SELECT external_id, title, url, disposition, handled_at
            FROM handled_items
            WHERE account_id = ?
            ORDER BY handled_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(account_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Commit one cycle's handled items in a single transaction.
    ///
    /// Ids already present are ignored, so committing the same batch twice is
    /// harmless. If the account was removed while the cycle ran, the whole
    /// batch is rejected with `PersistenceError::Conflict` so no orphaned
    /// WatchState rows are written. Returns the number of new rows.
    pub async fn commit_handled(
        &self,
        account_id: i64,
        items: &[HandledItem],
    ) -> Result<u64, PersistenceError> {
        if items.is_empty() {
            return Ok(0);
        }

        const BATCH_SIZE: usize = 100;
        let now = Utc::now().timestamp();
        let mut tx = self.begin_write().await?;

        let exists: Option<(i64,)> = sqlx::query_as("SELECT id FROM accounts WHERE id = ?")
            .bind(account_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            tx.rollback().await?;
            return Err(PersistenceError::Conflict(format!(
                "account {account_id} was removed before its cycle committed"
            )));
        }

        let mut inserted = 0;
        for chunk in items.chunks(BATCH_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
                "INSERT INTO handled_items (account_id, external_id, title, url, published_at, disposition, handled_at) ",
            );

            builder.push_values(chunk, |mut b, item| {
                b.push_bind(account_id)
                    .push_bind(&item.external_id)
                    .push_bind(&item.title)
                    .push_bind(&item.url)
                    .push_bind(item.published_at)
                    .push_bind(item.disposition.as_str())
                    .push_bind(now);
            });

            builder.push(" ON CONFLICT(account_id, external_id) DO NOTHING");

            inserted += builder.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        Ok(inserted)
    }
}
