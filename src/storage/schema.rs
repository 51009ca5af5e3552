use anyhow::Result;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Sqlite, SqlitePool, Transaction,
};
use std::str::FromStr;
use std::time::Duration;

use super::types::PersistenceError;

// ============================================================================
// Database
// ============================================================================

/// Handle to the SQLite store holding the account registry and every
/// account's WatchState. Cheap to clone; all clones share one pool.
#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
}

impl Database {
    /// Open a database connection and run migrations
    ///
    /// # Errors
    ///
    /// Returns `PersistenceError::InstanceLocked` if another process has the
    /// database locked (SQLITE_BUSY, SQLITE_LOCKED, SQLITE_CANTOPEN).
    /// Returns `PersistenceError::Migration` if the schema could not be created.
    pub async fn open(path: &str) -> Result<Self, PersistenceError> {
        let url = format!("sqlite:{}?mode=rwc", path);

        // Restrict the database file to the owner before the pool creates it
        #[cfg(unix)]
        if path != ":memory:" {
            use std::os::unix::fs::OpenOptionsExt;
            use std::os::unix::fs::PermissionsExt;
            let db_path = std::path::Path::new(path);
            if db_path.exists() {
                let perms = std::fs::Permissions::from_mode(0o600);
                if let Err(e) = std::fs::set_permissions(path, perms) {
                    tracing::warn!(path = %path, error = %e, "Failed to set database file permissions");
                }
            } else if let Some(parent) = db_path.parent() {
                if parent.as_os_str().is_empty() || parent.exists() {
                    let _file = std::fs::OpenOptions::new()
                        .write(true)
                        .create_new(true)
                        .mode(0o600)
                        .open(db_path)
                        .ok(); // If creation fails, SQLite will report the error at connect_with.
                }
            }
        }

        // busy_timeout=5000: SQLite waits up to 5 seconds for locks before returning SQLITE_BUSY.
        // Using pragma() ensures all connections in the pool inherit this setting.
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(PersistenceError::from_open)?
            .foreign_keys(true)
            .pragma("busy_timeout", "5000");

        // In-memory databases use shared cache, where table locks ignore
        // busy_timeout; a single connection keeps writers serialized.
        // The connection is never recycled, since dropping it drops the data.
        let pool_options = if path == ":memory:" {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(PersistenceError::from_open)?;
        let db = Self { pool };
        db.migrate().await.map_err(|e| {
            let error_string = e.to_string().to_lowercase();
            if error_string.contains("database is locked")
                || error_string.contains("database table is locked")
            {
                PersistenceError::InstanceLocked
            } else {
                PersistenceError::Migration(e.to_string())
            }
        })?;
        tracing::debug!(path = %path, "Database opened");
        Ok(db)
    }

    /// Close every pooled connection. Subsequent queries fail with
    /// `PersistenceError::Io`.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Run database migrations atomically within a transaction.
    ///
    /// All migrations use `IF NOT EXISTS`, so re-running on an existing
    /// database is a no-op. The write lock is taken up front so two
    /// processes opening a fresh file wait on busy_timeout instead of
    /// failing on the upgrade from a read lock.
    async fn migrate(&self) -> Result<()> {
        let mut tx = self.begin_write().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id INTEGER PRIMARY KEY,
                name TEXT UNIQUE NOT NULL,
                profile_url TEXT NOT NULL,
                icon_url TEXT,
                date_added INTEGER NOT NULL,
                last_checked INTEGER,
                last_error TEXT,
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                lease_owner TEXT,
                lease_expires INTEGER
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Lease columns for databases created before cross-process claims
        // (ignore errors if they exist)
        for column in ["lease_owner TEXT", "lease_expires INTEGER"] {
            sqlx::query(&format!("ALTER TABLE accounts ADD COLUMN {column}"))
                .execute(&mut *tx)
                .await
                .ok();
        }

        // WatchState: one row per handled external id. Removal deletes these
        // rows explicitly in the same transaction as the account row; the
        // cascade is a backstop only.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS handled_items (
                id INTEGER PRIMARY KEY,
                account_id INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
                external_id TEXT NOT NULL,
                title TEXT NOT NULL,
                url TEXT,
                published_at INTEGER,
                disposition TEXT NOT NULL,
                handled_at INTEGER NOT NULL,
                UNIQUE(account_id, external_id)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_handled_items_account ON handled_items(account_id)",
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(())
    }

    /// Begin a transaction that holds SQLite's write lock from the start.
    ///
    /// A deferred transaction that reads first and then writes cannot be
    /// retried by the busy handler when another connection wrote in the
    /// meantime; SQLite fails it with SQLITE_BUSY at once. `BEGIN IMMEDIATE`
    /// waits for the lock (up to busy_timeout) before the first read.
    pub(crate) async fn begin_write(
        &self,
    ) -> Result<Transaction<'static, Sqlite>, sqlx::Error> {
        self.pool.begin_with("BEGIN IMMEDIATE").await
    }
}
