use futures::stream::{self, StreamExt};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::poll::{CycleError, CycleReport, StopReason};
use super::Engine;
use crate::storage::Account;

/// Totals for one scheduler tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub accounts: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub delivered: usize,
}

/// Polls every watched account on a fixed interval.
///
/// Each tick lists the accounts and runs at most `max_concurrent_accounts`
/// cycles at a time. The next tick starts only after every cycle of the
/// current one has finished, so one account's cycles never overlap.
pub struct Scheduler {
    engine: Engine,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(engine: Engine, cancel: CancellationToken) -> Self {
        Self { engine, cancel }
    }

    /// Run ticks until the cancellation token fires.
    ///
    /// The first tick runs immediately. A tick that outlasts the interval
    /// delays the following one instead of triggering a burst.
    pub async fn run(&self) {
        let period = self.engine.config().poll_interval;
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(interval_secs = period.as_secs(), "Scheduler started");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let summary = self.tick().await;
            if summary.accounts > 0 {
                tracing::info!(
                    accounts = summary.accounts,
                    succeeded = summary.succeeded,
                    failed = summary.failed,
                    delivered = summary.delivered,
                    "Tick complete"
                );
            }
        }

        tracing::info!("Scheduler stopped");
    }

    /// Poll every account once.
    pub async fn tick(&self) -> TickSummary {
        let accounts = match self.engine.list_accounts().await {
            Ok(accounts) => accounts,
            Err(e) => {
                tracing::error!(error = %e, "Failed to list accounts");
                return TickSummary::default();
            }
        };

        let limit = self.engine.config().max_concurrent_accounts.max(1);
        // Futures are lazy, so building them up front still runs at most
        // `limit` at a time
        let cycles: Vec<_> = accounts.iter().map(|account| self.poll_one(account)).collect();
        let results: Vec<_> = stream::iter(cycles)
            .buffer_unordered(limit)
            .collect()
            .await;

        let mut summary = TickSummary {
            accounts: accounts.len(),
            ..TickSummary::default()
        };

        for (account, result) in results {
            match result {
                Ok(report) => {
                    summary.succeeded += 1;
                    summary.delivered += report.delivered;
                    if let Some(StopReason::DeliveryFailed(e)) = &report.stopped {
                        tracing::warn!(
                            account = %account.name,
                            delivered = report.delivered,
                            error = %e,
                            "Delivery stopped early, remaining items wait for the next cycle"
                        );
                    }
                }
                // None of these count as a failed cycle
                Err(CycleError::Cancelled)
                | Err(CycleError::NotWatched(_))
                | Err(CycleError::Busy(_)) => {}
                Err(e) => {
                    summary.failed += 1;
                    tracing::warn!(account = %account.name, error = %e, "Cycle failed");
                }
            }
        }

        summary
    }

    // Named async fn so the tick future stays `Send` and `run`/`tick` can
    // be spawned.
    async fn poll_one<'a>(
        &'a self,
        account: &'a Account,
    ) -> (&'a Account, Result<CycleReport, CycleError>) {
        let result = self.engine.poll_account(account, &self.cancel).await;
        (account, result)
    }
}
