use crate::{Action, Policy};
use arc_swap::ArcSwapOption;
use std::sync::Arc;
use tracing::info;

/// Holds the active egress policy.
///
/// The store starts out empty, which allows everything. Readers load the current policy
/// without locking and always observe a complete policy; updates swap in a new one.
#[derive(Debug, Default)]
pub struct PolicyStore {
    current: ArcSwapOption<Policy>,
}

// === impl PolicyStore ===

impl PolicyStore {
    pub fn new(policy: Option<Policy>) -> Self {
        Self {
            current: ArcSwapOption::from_pointee(policy),
        }
    }

    /// Replaces the active policy. `None` restores allow-all.
    pub fn update(&self, policy: Option<Policy>) {
        match &policy {
            Some(p) => info!(
                default_action = %p.default_action,
                rules = p.rules.len(),
                "Egress policy updated"
            ),
            None => info!("Egress policy cleared; allowing all"),
        }
        self.current.store(policy.map(Arc::new));
    }

    /// Returns the active policy, or `None` when everything is allowed.
    pub fn current(&self) -> Option<Arc<Policy>> {
        self.current.load_full()
    }

    pub fn evaluate(&self, domain: &str) -> Action {
        match &*self.current.load() {
            Some(policy) => policy.evaluate(domain),
            None => Action::Allow,
        }
    }
}
