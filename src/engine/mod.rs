//! The watch-and-deduplicate engine.
//!
//! An [`Engine`] owns the injected collaborators (content source,
//! notification sink, database) and exposes the three things the rest of the
//! program needs:
//!
//! - registry operations (`add_account`, `remove_account`, `list_accounts`)
//! - one poll cycle for one account (`poll_account`)
//! - a [`Scheduler`] that runs cycles for every account on an interval
//!
//! # Cycle pipeline
//!
//! ```text
//! fetch (ContentSource, newest first, bounded)
//!   └─► select unseen (dedup against WatchState, oldest first)
//!         └─► deliver each (NotificationSink, retry + backoff + timeout)
//!               └─► commit confirmed ids (one transaction)
//! ```
//!
//! Nothing is written until delivery has been attempted, and only confirmed
//! (or permanently rejected) items are written.
//!
//! # Exclusion
//!
//! Within a process, [`AccountLocks`] serializes everything done to one
//! account. Across processes sharing a database file, each cycle first
//! claims a lease on the account row; an account leased by another engine
//! is skipped with [`CycleError::Busy`]. A new account is inserted already
//! leased to the engine that added it, so its priming cycle runs before any
//! other process can poll it.

mod dedup;
mod delivery;
mod locks;
mod poll;
mod registry;
mod scheduler;
mod state;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::feed::ContentSource;
use crate::notify::NotificationSink;
use crate::storage::Database;

pub use dedup::{select_unseen, Selection};
pub use delivery::{DeliveryOutcome, DeliveryTracker};
pub use locks::{AccountGuard, AccountLocks};
pub use poll::{CycleError, CycleReport, StopReason};
pub use registry::{AddOutcome, RegistryError, RemoveOutcome};
pub use scheduler::{Scheduler, TickSummary};
pub use state::{CycleState, CycleStates};

/// The engine instance. Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct Engine {
    db: Database,
    source: Arc<dyn ContentSource>,
    sink: Arc<dyn NotificationSink>,
    config: Arc<EngineConfig>,
    locks: AccountLocks,
    states: CycleStates,
    /// Identifies this engine's leases in the database
    owner: Arc<str>,
}

impl Engine {
    pub fn new(
        db: Database,
        source: Arc<dyn ContentSource>,
        sink: Arc<dyn NotificationSink>,
        config: EngineConfig,
    ) -> Self {
        Self {
            db,
            source,
            sink,
            config: Arc::new(config),
            locks: AccountLocks::default(),
            states: CycleStates::default(),
            owner: next_owner_id().into(),
        }
    }

    /// Take this process's lock for `name`, for use with the `_held`
    /// operations.
    pub async fn lock_account(&self, name: &str) -> AccountGuard {
        self.locks.lock(name).await
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn sink(&self) -> &Arc<dyn NotificationSink> {
        &self.sink
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Per-account cycle states as last observed.
    pub fn states(&self) -> &CycleStates {
        &self.states
    }

    /// The lease owner id this engine writes to claimed accounts.
    pub fn owner(&self) -> &str {
        &self.owner
    }
}

fn next_owner_id() -> String {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    format!(
        "{}-{}-{}",
        std::process::id(),
        chrono::Utc::now().timestamp_millis(),
        NEXT.fetch_add(1, Ordering::Relaxed)
    )
}
