//! Stable-memory persistence across canister upgrades. The whole state is
//! CBOR-encoded into a dedicated virtual memory in `pre_upgrade` and read
//! back in `post_upgrade`.

use crate::state::VectorState;
use ic_stable_structures::{
    memory_manager::{MemoryId, MemoryManager, VirtualMemory},
    reader::{BufferedReader, Reader},
    writer::{BufferedWriter, Writer},
    DefaultMemoryImpl,
};
use std::cell::RefCell;

const STATE_MEMORY_ID: MemoryId = MemoryId::new(0);

const BUFFER_SIZE: usize = 1024 * 1024;

type VMem = VirtualMemory<DefaultMemoryImpl>;

thread_local! {
    static MEMORY_MANAGER: RefCell<MemoryManager<DefaultMemoryImpl>> = RefCell::new(
        MemoryManager::init(DefaultMemoryImpl::default())
    );
}

fn state_memory() -> VMem {
    MEMORY_MANAGER.with(|m| m.borrow().get(STATE_MEMORY_ID))
}

pub fn save_state(state: &VectorState) {
    let mut memory = state_memory();
    let writer = BufferedWriter::new(BUFFER_SIZE, Writer::new(&mut memory, 0));
    ciborium::ser::into_writer(state, writer).expect("failed to encode the canister state");
}

/// # Panics
///
/// Panics if the stable memory does not hold an encoded state, e.g. when the
/// canister never ran `pre_upgrade`.
pub fn load_state() -> VectorState {
    let memory = state_memory();
    let reader = BufferedReader::new(BUFFER_SIZE, Reader::new(&memory, 0));
    ciborium::de::from_reader(reader).expect("failed to decode the canister state")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::VectorState;
    use crate::test_fixtures::{test_config, test_node};

    #[test]
    fn state_roundtrips_through_stable_memory() {
        let mut state = VectorState::new(test_config());
        let mut node = test_node(3);
        node.neuron.cache.neuron_id = Some(42);
        node.neuron.internals.refresh_idx = Some(196608);
        state.nodes.insert(3, node);
        state.next_node_id = 4;
        let ledger = state.config.icp_ledger_canister_id;
        state.credit(ledger, crate::test_fixtures::test_account(1, None), 777);

        save_state(&state);
        let restored = load_state();

        assert_eq!(restored.config, state.config);
        assert_eq!(restored.nodes, state.nodes);
        assert_eq!(restored.next_node_id, 4);
        assert_eq!(restored.balances, state.balances);
        // Transient bookkeeping is not persisted.
        assert!(restored.pending_sync_nodes.is_empty());
        assert!(!restored.is_timer_running);
    }
}
