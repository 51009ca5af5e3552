use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::dedup::select_unseen;
use super::delivery::{DeliveryOutcome, DeliveryTracker};
use super::locks::AccountGuard;
use super::state::CycleState;
use super::Engine;
use crate::feed::FetchError;
use crate::notify::DeliveryError;
use crate::storage::{Account, Disposition, PersistenceError};

/// Errors that end a cycle before anything could be committed.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("Account {0} is not watched")]
    NotWatched(String),
    #[error("Cycle cancelled before fetching")]
    Cancelled,
    /// Another process holds the account's lease and is cycling it
    #[error("Account {0} is being polled by another instance")]
    Busy(String),
}

/// Why a cycle stopped delivering before the end of its list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// An item could not be delivered within the retry budget. Newer items
    /// wait for the next cycle so delivery order is kept.
    DeliveryFailed(DeliveryError),
    /// Shutdown was requested.
    Cancelled,
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub account: String,
    /// Candidates returned by the source, unusable ones included
    pub fetched: usize,
    /// Candidates that could not be extracted
    pub skipped: usize,
    pub delivered: usize,
    pub undeliverable: usize,
    pub primed: usize,
    /// Rows written to the dedup store
    pub committed: u64,
    pub stopped: Option<StopReason>,
}

#[derive(Debug, Clone, Copy)]
enum CycleMode {
    Regular,
    /// Deliver only the newest `backfill` unseen items, mark the rest handled.
    Prime { backfill: usize },
}

impl Engine {
    /// Run one fetch → dedup → deliver → commit cycle for `account`.
    ///
    /// Holds the account's lock for the whole cycle. The account row is
    /// re-read under the lock, so a cycle for an account removed in the
    /// meantime ends with [`CycleError::NotWatched`] and writes nothing.
    pub async fn poll_account(
        &self,
        account: &Account,
        cancel: &CancellationToken,
    ) -> Result<CycleReport, CycleError> {
        let guard = self.locks.lock(&account.name).await;
        self.cycle_held(&guard, CycleMode::Regular, cancel).await
    }

    /// Bring a newly added account up to date without flooding the sink.
    ///
    /// Of the unseen items currently available, the newest `backfill` are
    /// delivered (oldest first) and the rest are marked handled as primed.
    pub async fn prime_account(
        &self,
        name: &str,
        backfill: usize,
        cancel: &CancellationToken,
    ) -> Result<CycleReport, CycleError> {
        let guard = self.locks.lock(name).await;
        self.prime_account_held(&guard, backfill, cancel).await
    }

    /// [`prime_account`](Self::prime_account) for a caller that already
    /// holds the account's lock.
    pub async fn prime_account_held(
        &self,
        guard: &AccountGuard,
        backfill: usize,
        cancel: &CancellationToken,
    ) -> Result<CycleReport, CycleError> {
        self.cycle_held(guard, CycleMode::Prime { backfill }, cancel)
            .await
    }

    /// Claim the account's lease, run the cycle, release the lease.
    async fn cycle_held(
        &self,
        guard: &AccountGuard,
        mode: CycleMode,
        cancel: &CancellationToken,
    ) -> Result<CycleReport, CycleError> {
        let name = guard.name();
        let account = self
            .db
            .get_account(name)
            .await?
            .ok_or_else(|| CycleError::NotWatched(name.to_string()))?;

        if cancel.is_cancelled() {
            return Err(CycleError::Cancelled);
        }

        let Some(account) = self
            .db
            .claim_account(account.id, &self.owner, self.config.cycle_lease)
            .await?
        else {
            tracing::debug!(account = %name, "Account is leased by another instance, skipping");
            return Err(CycleError::Busy(name.to_string()));
        };

        let result = self.run_cycle(&account, mode, cancel).await;
        self.finish_cycle(&account, &result).await;

        if let Err(e) = self.db.release_account(account.id, &self.owner).await {
            // The lease runs out on its own
            tracing::warn!(account = %name, error = %e, "Failed to release account lease");
        }
        result
    }

    /// The cycle body. The caller holds the account's lock and lease.
    async fn run_cycle(
        &self,
        account: &Account,
        mode: CycleMode,
        cancel: &CancellationToken,
    ) -> Result<CycleReport, CycleError> {
        self.states.set(&account.name, CycleState::Fetching);
        let fetch = self
            .source
            .fetch_candidates(account, self.config.fetch_count);
        let candidates = match tokio::time::timeout(self.config.fetch_timeout, fetch).await {
            Ok(result) => result?,
            Err(_) => return Err(CycleError::Fetch(FetchError::Timeout)),
        };

        let mut report = CycleReport {
            account: account.name.clone(),
            fetched: candidates.len(),
            ..CycleReport::default()
        };

        let handled = self.db.handled_ids(account.id).await?;
        let selection = select_unseen(candidates, &handled, self.config.dedup_policy);
        report.skipped = selection.skipped.len();
        for skipped in &selection.skipped {
            tracing::warn!(account = %account.name, error = %skipped, "Skipping entry");
        }

        let mut unseen = selection.unseen;
        let older = match mode {
            CycleMode::Regular => Vec::new(),
            CycleMode::Prime { backfill } => {
                let keep_from = unseen.len().saturating_sub(backfill);
                let newest = unseen.split_off(keep_from);
                std::mem::replace(&mut unseen, newest)
            }
        };

        tracing::debug!(
            account = %account.name,
            fetched = report.fetched,
            already_handled = selection.already_handled,
            unseen = unseen.len(),
            primed = older.len(),
            "Selected items"
        );

        self.states.set(&account.name, CycleState::Delivering);
        let mut tracker =
            DeliveryTracker::new(Arc::clone(&self.sink), &self.config, cancel.clone());
        for item in &older {
            tracker.mark(item, Disposition::Primed);
        }

        for item in &unseen {
            if cancel.is_cancelled() {
                report.stopped = Some(StopReason::Cancelled);
                break;
            }
            match tracker.deliver(account, item).await {
                DeliveryOutcome::Delivered | DeliveryOutcome::Undeliverable(_) => {}
                DeliveryOutcome::Failed(e) => {
                    report.stopped = Some(StopReason::DeliveryFailed(e));
                    break;
                }
                DeliveryOutcome::Cancelled => {
                    report.stopped = Some(StopReason::Cancelled);
                    break;
                }
            }
        }

        let pending = tracker.into_pending();
        for handled in &pending {
            match handled.disposition {
                Disposition::Delivered => report.delivered += 1,
                Disposition::Undeliverable => report.undeliverable += 1,
                Disposition::Primed => report.primed += 1,
            }
        }
        report.committed = self.db.commit_handled(account.id, &pending).await?;

        Ok(report)
    }

    /// Record the outcome on the account row and settle the cycle state.
    async fn finish_cycle(&self, account: &Account, result: &Result<CycleReport, CycleError>) {
        let error = match result {
            Ok(report) => match &report.stopped {
                Some(StopReason::DeliveryFailed(e)) => Some(e.to_string()),
                _ => None,
            },
            Err(CycleError::Cancelled) => {
                self.states.set(&account.name, CycleState::Idle);
                return;
            }
            Err(e) => Some(e.to_string()),
        };

        match self.db.record_cycle_result(account.id, error.as_deref()).await {
            Ok(failures) if failures > 0 => {
                tracing::warn!(
                    account = %account.name,
                    consecutive_failures = failures,
                    error = error.as_deref().unwrap_or_default(),
                    "Cycle failed"
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(account = %account.name, error = %e, "Failed to record cycle result");
            }
        }

        let state = if result.is_ok() {
            CycleState::Idle
        } else {
            CycleState::Failed
        };
        self.states.set(&account.name, state);
    }
}
