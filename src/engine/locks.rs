use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Proof that the holder has exclusive use of one account in this process.
///
/// Registry and cycle operations ending in `_held` take a guard instead of
/// locking themselves, so a caller can chain several of them (add, then
/// prime) without another cycle slipping in between.
pub struct AccountGuard {
    name: String,
    _guard: OwnedMutexGuard<()>,
}

impl AccountGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Name-keyed async locks.
///
/// Every mutation of one account (add, remove, a poll cycle) holds that
/// account's lock, so they run one at a time per account while different
/// accounts proceed in parallel. Entries are never dropped; the table grows
/// with the number of distinct names seen by this process.
#[derive(Clone, Default)]
pub struct AccountLocks {
    inner: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl AccountLocks {
    /// Wait for and take the lock for `name`.
    pub async fn lock(&self, name: &str) -> AccountGuard {
        let guard = self.entry(name).lock_owned().await;
        AccountGuard {
            name: name.to_string(),
            _guard: guard,
        }
    }

    /// Take the lock for `name` only if nobody holds it.
    pub fn try_lock(&self, name: &str) -> Option<AccountGuard> {
        let guard = self.entry(name).try_lock_owned().ok()?;
        Some(AccountGuard {
            name: name.to_string(),
            _guard: guard,
        })
    }

    fn entry(&self, name: &str) -> Arc<AsyncMutex<()>> {
        let mut table = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(table.entry(name.to_string()).or_default())
    }
}
