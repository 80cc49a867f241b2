//------------ Persistence ---------------------------------------------------

use std::collections::HashMap;

use crate::types::errors::ShuffleStoreError;
use crate::types::{Assignment, NodeState};

/// The storage seam of a shuffler: node state for the strike tree, plus the
/// index↔value mapping in both directions.
///
/// A shuffler owns its persistence manager for its whole lifetime. Using the
/// same manager in more than one live shuffler, or across shufflers
/// constructed with different `(size, cyclic)` parameters, is an error; no
/// header record is written to detect it.
///
/// Recoverability across interrupted processes requires every save and
/// delete to be durable before the call returns.
pub trait PersistenceManager {
    /// Save node state. Keys range over `(1, 2^(B+2))` where `B+1` is the
    /// bit length of the shuffler's root. Upserts.
    fn save_node_state(
        &mut self,
        key: u64,
        state: NodeState,
    ) -> Result<(), ShuffleStoreError>;

    /// Restore node state. `None` means the node was never saved (or has
    /// been deleted) and must be constructed with zero state.
    fn restore_node_state(
        &self,
        key: u64,
    ) -> Result<Option<NodeState>, ShuffleStoreError>;

    /// Delete node state. The state for `key` is known to be present.
    fn delete_node_state(
        &mut self,
        key: u64,
    ) -> Result<(), ShuffleStoreError>;

    /// Store an index/assignment pair in both directions. Upserts.
    fn save_index_value(
        &mut self,
        index: u64,
        value: Assignment,
    ) -> Result<(), ShuffleStoreError>;

    /// Remove an index/assignment pair from both directions. The caller
    /// guarantees the pair is correct; both halves are passed so neither
    /// direction needs a lookup first.
    fn delete_index_value(
        &mut self,
        index: u64,
        value: Assignment,
    ) -> Result<(), ShuffleStoreError>;

    /// The assignment stored for `index`, if any.
    fn value_at(
        &self,
        index: u64,
    ) -> Result<Option<Assignment>, ShuffleStoreError>;

    /// The index an assignment is stored under, if any.
    fn index_of(
        &self,
        value: Assignment,
    ) -> Result<Option<u64>, ShuffleStoreError>;
}

//------------ MemoryPersistence ---------------------------------------------

/// Persistence manager that keeps all state in process memory. This is the
/// default manager; state lives exactly as long as the manager does.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    node_states: HashMap<u64, NodeState>,
    index_to_value: HashMap<u64, Assignment>,
    value_to_index: HashMap<Assignment, u64>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistenceManager for MemoryPersistence {
    fn save_node_state(
        &mut self,
        key: u64,
        state: NodeState,
    ) -> Result<(), ShuffleStoreError> {
        self.node_states.insert(key, state);
        Ok(())
    }

    fn restore_node_state(
        &self,
        key: u64,
    ) -> Result<Option<NodeState>, ShuffleStoreError> {
        Ok(self.node_states.get(&key).copied())
    }

    fn delete_node_state(
        &mut self,
        key: u64,
    ) -> Result<(), ShuffleStoreError> {
        debug_assert!(self.node_states.contains_key(&key));
        self.node_states.remove(&key);
        Ok(())
    }

    fn save_index_value(
        &mut self,
        index: u64,
        value: Assignment,
    ) -> Result<(), ShuffleStoreError> {
        self.index_to_value.insert(index, value);
        self.value_to_index.insert(value, index);
        Ok(())
    }

    fn delete_index_value(
        &mut self,
        index: u64,
        value: Assignment,
    ) -> Result<(), ShuffleStoreError> {
        self.value_to_index.remove(&value);
        self.index_to_value.remove(&index);
        Ok(())
    }

    fn value_at(
        &self,
        index: u64,
    ) -> Result<Option<Assignment>, ShuffleStoreError> {
        Ok(self.index_to_value.get(&index).copied())
    }

    fn index_of(
        &self,
        value: Assignment,
    ) -> Result<Option<u64>, ShuffleStoreError> {
        Ok(self.value_to_index.get(&value).copied())
    }
}
