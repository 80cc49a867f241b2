//------------ LsmPersistence ------------------------------------------------

use std::path::Path;

use lsm_tree::AbstractTree;
use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, NativeEndian, Unaligned,
    U64,
};

use crate::persist::PersistenceManager;
use crate::types::errors::ShuffleStoreError;
use crate::types::{Assignment, NodeState};

// One LSM tree holds all three record kinds, told apart by a keyspace tag
// in the first key byte. Keys within a keyspace have one fixed width, so a
// prefix scan for a full key is an exact-match point lookup.
const NODE_STATE_SPACE: u8 = 1;
const INDEX_VALUE_SPACE: u8 = 2;
const VALUE_INDEX_SPACE: u8 = 3;

const ASSIGNMENT_CLOSED: u8 = 1;
const ASSIGNMENT_OPEN_END: u8 = 2;

#[derive(Copy, Clone, Debug, KnownLayout, Immutable, IntoBytes, Unaligned)]
#[repr(C)]
struct NodeKey {
    space: u8,
    key: U64<NativeEndian>,
}

impl From<u64> for NodeKey {
    fn from(key: u64) -> Self {
        Self {
            space: NODE_STATE_SPACE,
            key: key.into(),
        }
    }
}

#[derive(Copy, Clone, Debug, KnownLayout, Immutable, IntoBytes, Unaligned)]
#[repr(C)]
struct IndexKey {
    space: u8,
    index: U64<NativeEndian>,
}

impl From<u64> for IndexKey {
    fn from(index: u64) -> Self {
        Self {
            space: INDEX_VALUE_SPACE,
            index: index.into(),
        }
    }
}

#[derive(Copy, Clone, Debug, KnownLayout, Immutable, IntoBytes, Unaligned)]
#[repr(C)]
struct ValueKey {
    space: u8,
    value: AssignmentRecord,
}

impl From<Assignment> for ValueKey {
    fn from(value: Assignment) -> Self {
        Self {
            space: VALUE_INDEX_SPACE,
            value: value.into(),
        }
    }
}

#[derive(
    Copy, Clone, Debug, KnownLayout, Immutable, FromBytes, IntoBytes,
    Unaligned,
)]
#[repr(C)]
struct NodeStateRecord {
    struck_count: U64<NativeEndian>,
    struck_bitmap: U64<NativeEndian>,
}

impl From<NodeState> for NodeStateRecord {
    fn from(state: NodeState) -> Self {
        Self {
            struck_count: state.struck_count.into(),
            struck_bitmap: state.struck_bitmap.into(),
        }
    }
}

impl From<NodeStateRecord> for NodeState {
    fn from(record: NodeStateRecord) -> Self {
        NodeState::new(record.struck_count.into(), record.struck_bitmap.into())
    }
}

#[derive(
    Copy, Clone, Debug, KnownLayout, Immutable, FromBytes, IntoBytes,
    Unaligned,
)]
#[repr(C)]
struct AssignmentRecord {
    kind: u8,
    entry: U64<NativeEndian>,
}

impl From<Assignment> for AssignmentRecord {
    fn from(value: Assignment) -> Self {
        match value {
            Assignment::Closed(entry) => Self {
                kind: ASSIGNMENT_CLOSED,
                entry: entry.into(),
            },
            Assignment::OpenEnd(entry) => Self {
                kind: ASSIGNMENT_OPEN_END,
                entry: entry.into(),
            },
        }
    }
}

impl TryFrom<AssignmentRecord> for Assignment {
    type Error = ShuffleStoreError;

    fn try_from(record: AssignmentRecord) -> Result<Self, Self::Error> {
        match record.kind {
            ASSIGNMENT_CLOSED => {
                Ok(Assignment::Closed(record.entry.into()))
            }
            ASSIGNMENT_OPEN_END => {
                Ok(Assignment::OpenEnd(record.entry.into()))
            }
            _ => Err(ShuffleStoreError::PersistFailed),
        }
    }
}

/// Persistence manager over an on-disk LSM tree.
///
/// Writes land in the tree's active memtable; call
/// [`LsmPersistence::flush_to_disk`] to make the accumulated state durable
/// before dropping the manager. Complete any in-flight `value_at` first.
pub struct LsmPersistence {
    tree: lsm_tree::Tree,
}

impl LsmPersistence {
    pub fn new(persist_path: &Path) -> Result<Self, ShuffleStoreError> {
        if let Ok(tree) = lsm_tree::Config::new(persist_path).open() {
            Ok(LsmPersistence { tree })
        } else {
            Err(ShuffleStoreError::PersistFailed)
        }
    }

    pub fn flush_to_disk(&self) -> Result<(), lsm_tree::Error> {
        let segment = self.tree.flush_active_memtable(0);

        if let Ok(Some(segment)) = segment {
            self.tree.register_segments(&[segment])?;
            self.tree.compact(
                std::sync::Arc::new(lsm_tree::compaction::Leveled::default()),
                0,
            )?;
        };

        Ok(())
    }

    fn insert(&self, key: &[u8], value: &[u8]) {
        self.tree.insert::<&[u8], &[u8]>(key, value, 0);
    }

    fn remove(&self, key: &[u8]) {
        self.tree.remove_weak(key, 0);
    }

    // Keys within a keyspace all have the same width, so the first record
    // under a full-key prefix is the exact match or nothing.
    fn read(
        &self,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>, ShuffleStoreError> {
        match self.tree.prefix(key, None, None).next() {
            Some(Ok(kv)) => Ok(Some(kv.1.to_vec())),
            Some(Err(_)) => Err(ShuffleStoreError::PersistFailed),
            None => Ok(None),
        }
    }
}

impl PersistenceManager for LsmPersistence {
    fn save_node_state(
        &mut self,
        key: u64,
        state: NodeState,
    ) -> Result<(), ShuffleStoreError> {
        self.insert(
            NodeKey::from(key).as_bytes(),
            NodeStateRecord::from(state).as_bytes(),
        );
        Ok(())
    }

    fn restore_node_state(
        &self,
        key: u64,
    ) -> Result<Option<NodeState>, ShuffleStoreError> {
        self.read(NodeKey::from(key).as_bytes())?
            .map(|bytes| {
                NodeStateRecord::read_from_bytes(&bytes)
                    .map(NodeState::from)
                    .map_err(|_| ShuffleStoreError::PersistFailed)
            })
            .transpose()
    }

    fn delete_node_state(
        &mut self,
        key: u64,
    ) -> Result<(), ShuffleStoreError> {
        self.remove(NodeKey::from(key).as_bytes());
        Ok(())
    }

    fn save_index_value(
        &mut self,
        index: u64,
        value: Assignment,
    ) -> Result<(), ShuffleStoreError> {
        self.insert(
            IndexKey::from(index).as_bytes(),
            AssignmentRecord::from(value).as_bytes(),
        );
        self.insert(
            ValueKey::from(value).as_bytes(),
            U64::<NativeEndian>::from(index).as_bytes(),
        );
        Ok(())
    }

    fn delete_index_value(
        &mut self,
        index: u64,
        value: Assignment,
    ) -> Result<(), ShuffleStoreError> {
        self.remove(ValueKey::from(value).as_bytes());
        self.remove(IndexKey::from(index).as_bytes());
        Ok(())
    }

    fn value_at(
        &self,
        index: u64,
    ) -> Result<Option<Assignment>, ShuffleStoreError> {
        self.read(IndexKey::from(index).as_bytes())?
            .map(|bytes| {
                AssignmentRecord::read_from_bytes(&bytes)
                    .map_err(|_| ShuffleStoreError::PersistFailed)
                    .and_then(Assignment::try_from)
            })
            .transpose()
    }

    fn index_of(
        &self,
        value: Assignment,
    ) -> Result<Option<u64>, ShuffleStoreError> {
        self.read(ValueKey::from(value).as_bytes())?
            .map(|bytes| {
                U64::<NativeEndian>::read_from_bytes(&bytes)
                    .map(u64::from)
                    .map_err(|_| ShuffleStoreError::PersistFailed)
            })
            .transpose()
    }
}
