use crate::state::{mutate_state, NodeId};

const MAX_CONCURRENT_SYNCS: usize = 10;

#[derive(Debug, PartialEq, Eq)]
pub enum GuardError {
    AlreadyProcessing,
    TooManyConcurrentRequests,
}

/// Guards a block from executing twice for the same node and from being
/// executed [MAX_CONCURRENT_SYNCS] or more times in parallel.
#[must_use]
pub struct SyncGuard {
    node_id: NodeId,
}

impl SyncGuard {
    /// Attempts to create a new guard for the current block. Fails if a
    /// synchronization cycle for this node is already in flight, or if there
    /// are at least [MAX_CONCURRENT_SYNCS] pending cycles.
    pub fn new(node_id: NodeId) -> Result<Self, GuardError> {
        mutate_state(|s| {
            if s.pending_sync_nodes.contains(&node_id) {
                return Err(GuardError::AlreadyProcessing);
            }
            if s.pending_sync_nodes.len() >= MAX_CONCURRENT_SYNCS {
                return Err(GuardError::TooManyConcurrentRequests);
            }
            s.pending_sync_nodes.insert(node_id);
            Ok(Self { node_id })
        })
    }
}

impl Drop for SyncGuard {
    fn drop(&mut self) {
        mutate_state(|s| s.pending_sync_nodes.remove(&self.node_id));
    }
}

#[must_use]
pub struct TimerLogicGuard(());

impl TimerLogicGuard {
    pub fn new() -> Option<Self> {
        mutate_state(|s| {
            if s.is_timer_running {
                return None;
            }
            s.is_timer_running = true;
            Some(TimerLogicGuard(()))
        })
    }
}

impl Drop for TimerLogicGuard {
    fn drop(&mut self) {
        mutate_state(|s| {
            s.is_timer_running = false;
        });
    }
}

#[must_use]
pub struct BillingLogicGuard(());

impl BillingLogicGuard {
    pub fn new() -> Option<Self> {
        mutate_state(|s| {
            if s.is_billing_running {
                return None;
            }
            s.is_billing_running = true;
            Some(BillingLogicGuard(()))
        })
    }
}

impl Drop for BillingLogicGuard {
    fn drop(&mut self) {
        mutate_state(|s| {
            s.is_billing_running = false;
        });
    }
}
