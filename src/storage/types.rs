use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised by the persistence layer.
///
/// `Conflict` covers lock contention and writes that raced a concurrent
/// removal; `Io` covers everything else sqlx reports. Neither is fatal: the
/// caller drops the pending write and the next cycle retries from the
/// committed baseline.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Another process holds the database file
    #[error("Another instance of postwatch appears to be running. Please close it and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// The write lost a race (lock contention, account removed mid-cycle)
    #[error("Write conflict: {0}")]
    Conflict(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Io(#[source] sqlx::Error),
}

fn is_lock_error(err: &sqlx::Error) -> bool {
    // SQLITE_BUSY (5): database is locked
    // SQLITE_LOCKED (6): database table is locked
    let error_string = err.to_string().to_lowercase();
    error_string.contains("database is locked")
        || error_string.contains("database table is locked")
        || error_string.contains("sqlite_busy")
        || error_string.contains("sqlite_locked")
}

impl PersistenceError {
    /// Classify an error raised while opening the database.
    ///
    /// SQLITE_CANTOPEN (14) is folded into `InstanceLocked` here because an
    /// exclusive lock held elsewhere surfaces that way on some platforms.
    pub(crate) fn from_open(err: sqlx::Error) -> Self {
        if is_lock_error(&err) || err.to_string().to_lowercase().contains("unable to open database file") {
            return PersistenceError::InstanceLocked;
        }
        PersistenceError::Io(err)
    }
}

impl From<sqlx::Error> for PersistenceError {
    fn from(err: sqlx::Error) -> Self {
        if is_lock_error(&err) {
            return PersistenceError::Conflict(err.to_string());
        }
        PersistenceError::Io(err)
    }
}

// ============================================================================
// Data Structures
// ============================================================================

/// A watched account as stored in the registry.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Account {
    pub id: i64,
    pub name: String,
    pub profile_url: String,
    pub icon_url: Option<String>,
    /// Unix seconds
    pub date_added: i64,
    /// Unix seconds of the last completed cycle, successful or not
    pub last_checked: Option<i64>,
    pub last_error: Option<String>,
    pub consecutive_failures: i64,
}

/// What the content source knows about an account before it is registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountProfile {
    pub name: String,
    pub profile_url: String,
    pub icon_url: Option<String>,
}

/// One candidate item extracted from an account's content.
///
/// `external_id` is stable per account (a URL or an opaque id).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub external_id: String,
    pub title: String,
    pub description: Option<String>,
    pub url: Option<String>,
    pub image_url: Option<String>,
    /// Unix seconds
    pub published_at: Option<i64>,
}

/// Why an id ended up in an account's handled set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The sink confirmed delivery
    Delivered,
    /// The sink rejected the item permanently; recorded so it is never retried
    Undeliverable,
    /// Present when the account was added and deliberately not delivered
    Primed,
}

impl Disposition {
    pub fn as_str(self) -> &'static str {
        match self {
            Disposition::Delivered => "delivered",
            Disposition::Undeliverable => "undeliverable",
            Disposition::Primed => "primed",
        }
    }
}

/// A row in an account's WatchState.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandledItem {
    pub external_id: String,
    pub title: String,
    pub url: Option<String>,
    pub published_at: Option<i64>,
    pub disposition: Disposition,
}

/// A handled item as read back for display.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct HistoryEntry {
    pub external_id: String,
    pub title: String,
    pub url: Option<String>,
    /// One of [`Disposition::as_str`]
    pub disposition: String,
    /// Unix seconds
    pub handled_at: i64,
}

impl HandledItem {
    pub fn from_item(item: &Item, disposition: Disposition) -> Self {
        Self {
            external_id: item.external_id.clone(),
            title: item.title.clone(),
            url: item.url.clone(),
            published_at: item.published_at,
            disposition,
        }
    }
}
