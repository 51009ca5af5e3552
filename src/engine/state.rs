use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Where an account's cycle currently is.
///
/// `Idle → Fetching → Delivering → Idle`, or `→ Failed` when the cycle ends
/// in error. `Failed` is kept until the account's next cycle starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CycleState {
    #[default]
    Idle,
    Fetching,
    Delivering,
    Failed,
}

/// Shared table of per-account cycle states.
#[derive(Clone, Default)]
pub struct CycleStates {
    inner: Arc<RwLock<HashMap<String, CycleState>>>,
}

impl CycleStates {
    pub(crate) fn set(&self, account: &str, state: CycleState) {
        let previous = self
            .inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(account.to_string(), state)
            .unwrap_or_default();
        if previous != state {
            tracing::trace!(account = %account, from = ?previous, to = ?state, "Cycle state");
        }
    }

    pub(crate) fn forget(&self, account: &str) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(account);
    }

    /// State of one account; accounts never polled are `Idle`.
    pub fn get(&self, account: &str) -> CycleState {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(account)
            .copied()
            .unwrap_or_default()
    }

    /// Accounts not currently idle.
    pub fn busy(&self) -> Vec<(String, CycleState)> {
        let mut busy: Vec<_> = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, s)| matches!(s, CycleState::Fetching | CycleState::Delivering))
            .map(|(name, s)| (name.clone(), *s))
            .collect();
        busy.sort_by(|a, b| a.0.cmp(&b.0));
        busy
    }
}
