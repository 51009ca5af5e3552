use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::notify::{DeliveryError, NotificationSink, PostNotification};
use crate::storage::{Account, Disposition, HandledItem, Item};

/// Result of delivering one item, retries included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The sink confirmed receipt
    Delivered,
    /// The sink rejected the item for good; it is marked handled anyway
    Undeliverable(DeliveryError),
    /// Transient failures outlasted the retry budget; not marked handled
    Failed(DeliveryError),
    /// Shutdown was requested while waiting to retry
    Cancelled,
}

/// Delivers items one at a time and remembers which ones may be committed.
///
/// Only `Delivered`, `Undeliverable` and explicitly marked items end up in
/// [`pending`](Self::pending). The caller commits that list once, after the
/// last delivery of the cycle.
pub struct DeliveryTracker {
    sink: Arc<dyn NotificationSink>,
    retry_limit: u32,
    backoff: Duration,
    timeout: Duration,
    cancel: CancellationToken,
    pending: Vec<HandledItem>,
}

impl DeliveryTracker {
    pub fn new(
        sink: Arc<dyn NotificationSink>,
        config: &EngineConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            sink,
            retry_limit: config.delivery_retry_limit,
            backoff: config.delivery_backoff,
            timeout: config.delivery_timeout,
            cancel,
            pending: Vec::new(),
        }
    }

    /// Deliver `item`, retrying transient failures with exponential backoff.
    ///
    /// Each attempt gets its own timeout; an attempt that runs out of time
    /// counts as a transient failure.
    pub async fn deliver(&mut self, account: &Account, item: &Item) -> DeliveryOutcome {
        let post = PostNotification::new(account, item);
        let mut attempt: u32 = 0;

        loop {
            let result = match tokio::time::timeout(self.timeout, self.sink.deliver(&post)).await {
                Ok(result) => result,
                Err(_) => Err(DeliveryError::Transient(format!(
                    "no confirmation within {}s",
                    self.timeout.as_secs_f32()
                ))),
            };

            match result {
                Ok(()) => {
                    tracing::debug!(
                        account = %account.name,
                        item = %item.external_id,
                        attempt,
                        "Delivered"
                    );
                    self.mark(item, Disposition::Delivered);
                    return DeliveryOutcome::Delivered;
                }
                Err(e @ DeliveryError::Permanent(_)) => {
                    tracing::warn!(
                        account = %account.name,
                        item = %item.external_id,
                        error = %e,
                        "Sink rejected item, marking it handled without delivery"
                    );
                    self.mark(item, Disposition::Undeliverable);
                    return DeliveryOutcome::Undeliverable(e);
                }
                Err(e) if attempt >= self.retry_limit => {
                    tracing::warn!(
                        account = %account.name,
                        item = %item.external_id,
                        attempts = attempt + 1,
                        error = %e,
                        "Delivery failed, giving up for this cycle"
                    );
                    return DeliveryOutcome::Failed(e);
                }
                Err(e) => {
                    // Exponential backoff: base, 2x base, 4x base, ...
                    let delay = self.backoff.saturating_mul(1u32 << attempt.min(16));
                    tracing::debug!(
                        account = %account.name,
                        item = %item.external_id,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Delivery failed, retrying"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return DeliveryOutcome::Cancelled,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Record `item` as handled without delivering it.
    pub fn mark(&mut self, item: &Item, disposition: Disposition) {
        self.pending.push(HandledItem::from_item(item, disposition));
    }

    /// Items that may be committed, in the order they were handled.
    pub fn pending(&self) -> &[HandledItem] {
        &self.pending
    }

    pub fn into_pending(self) -> Vec<HandledItem> {
        self.pending
    }
}
