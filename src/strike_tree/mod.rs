//------------ StrikeTree ----------------------------------------------------

// The strike tree is the data structure behind lazy generation: a binary
// tree over the index range [0, size) that knows, for every subrange, how
// many entries have already been struck. Only the paths that strikes have
// actually walked exist, either in memory or in the persistence manager, so
// the cost of the tree is proportional to the number of entries generated
// and not to the size of the range.
//
// Keys assign every possible node a distinct persistence identity derived
// from nothing but the tree shape: the root takes all-bits-set for the root
// bit length, a right child takes its parent's key minus 2^(bit_number + 1)
// and a left child its parent's key minus one. Rebuilding a tree over the
// same store therefore re-hydrates exactly the nodes that were persisted,
// wherever a descent happens to touch them.

mod node;

use log::{debug, trace};

use crate::bit_manager::BitManager;
use crate::persist::PersistenceManager;
use crate::types::errors::ShuffleStoreError;

use node::{Node, TERMINAL_BIT_NUMBER, TERMINAL_SIZE_BITMASK};

/// Smallest key any live node can carry: the terminal at the bottom of the
/// right spine, which every used tree materializes.
const MINIMUM_NODE_KEY: u64 = TERMINAL_SIZE_BITMASK << 1 | 1;

pub(crate) struct StrikeTree {
    bits: BitManager,
    root: Node,
}

impl StrikeTree {
    /// Build the tree for `size` entries, re-hydrating a persisted root if
    /// the store has one.
    pub(crate) fn new<P: PersistenceManager>(
        store: &P,
        size: u64,
    ) -> Result<Self, ShuffleStoreError> {
        Self::build(store, size, true)
    }

    fn build<P: PersistenceManager>(
        store: &P,
        size: u64,
        restore: bool,
    ) -> Result<Self, ShuffleStoreError> {
        let bit_length = Self::size_bit_length(size);
        let bits = BitManager::new(bit_length + 1);
        let root = Node::new(store, bits.all_bits(), bit_length - 1, restore)?;

        debug!(
            "strike tree root: key {} bit number {} struck count {}",
            root.key(),
            root.bit_number(),
            root.struck_count
        );

        Ok(StrikeTree { bits, root })
    }

    // Bit length of size-1, rounded up so the root always covers at least
    // one full terminal. An exact power of two therefore still fits: its
    // highest index is size-1.
    fn size_bit_length(size: u64) -> u8 {
        let bit_length = (u64::BITS - (size - 1).leading_zeros()) as u8;
        bit_length.max(TERMINAL_BIT_NUMBER + 1)
    }

    /// Number of entries struck (or currently reserved) across the whole
    /// range.
    pub(crate) fn struck_count(&self) -> u64 {
        self.root.struck_count
    }

    /// Select and strike the k-th unstruck entry; returns its index.
    pub(crate) fn strike<P: PersistenceManager>(
        &mut self,
        store: &mut P,
        k: u64,
    ) -> Result<u64, ShuffleStoreError> {
        trace!("strike incremental index {}", k);
        self.root.strike(&self.bits, store, k)
    }

    /// Strike a specific index, pinning it against random selection.
    pub(crate) fn reserve<P: PersistenceManager>(
        &mut self,
        store: &mut P,
        index: u64,
    ) -> Result<(), ShuffleStoreError> {
        trace!("reserve index {}", index);
        self.root.reserve(&self.bits, store, index)
    }

    /// Release an index pinned with [`StrikeTree::reserve`].
    pub(crate) fn unreserve<P: PersistenceManager>(
        &mut self,
        store: &mut P,
        index: u64,
    ) -> Result<(), ShuffleStoreError> {
        trace!("unreserve index {}", index);
        self.root.unreserve(&self.bits, store, index)
    }

    /// Adapt the tree to a new size. The root survives whenever the
    /// required bit length is unchanged; otherwise a fresh root is built
    /// and, if the old root carried strikes, the right spine from the new
    /// root down to the old root's level is stamped with the old root's
    /// struck count so the old tree hangs off the new right chain with its
    /// counts consistent.
    pub(crate) fn resize<P: PersistenceManager>(
        &mut self,
        store: &mut P,
        size: u64,
    ) -> Result<(), ShuffleStoreError> {
        let bit_length = Self::size_bit_length(size);
        if bit_length == self.root.bit_number() + 1 {
            return Ok(());
        }

        debug!("rebuilding strike tree root for size {}", size);

        let mut tree = Self::build(store, size, false)?;
        let struck_count = self.root.struck_count;

        // Shrinking is only permitted on an unused tree, so a non-zero
        // count here means growth: the old root sits somewhere down the
        // new right spine.
        if struck_count != 0 {
            stamp_right_spine(
                &mut tree.root,
                &tree.bits,
                store,
                struck_count,
            )?;
        }

        *self = tree;

        Ok(())
    }

    /// Walk the whole materialized tree and verify every structural
    /// invariant, including agreement between in-memory and persisted
    /// state and the global key range. `size` and `cyclic` must be the
    /// owning shuffler's construction parameters.
    pub(crate) fn validate<P: PersistenceManager>(
        &mut self,
        store: &P,
        size: u64,
        cyclic: bool,
    ) -> Result<(), ShuffleStoreError> {
        let mut keys = Vec::new();

        self.root
            .validate(&self.bits, store, size, cyclic, &mut keys)?;

        keys.sort_unstable();

        let mut previous_key = None;
        for &key in &keys {
            if previous_key == Some(key) {
                return Err(ShuffleStoreError::InvariantViolation(
                    format!("duplicate key {}", key),
                ));
            }
            previous_key = Some(key);
        }

        if let (Some(&minimum_key), Some(&maximum_key)) =
            (keys.first(), keys.last())
        {
            if minimum_key < MINIMUM_NODE_KEY {
                return Err(ShuffleStoreError::InvariantViolation(
                    format!("invalid minimum key {}", minimum_key),
                ));
            }

            // A full-width tree has no representable limit; every u64 key
            // is in range then.
            if let Some(key_limit) =
                1u64.checked_shl(u32::from(self.bits.bit_count()))
            {
                if maximum_key >= key_limit {
                    return Err(ShuffleStoreError::InvariantViolation(
                        format!("invalid maximum key {}", maximum_key),
                    ));
                }
            }
        }

        Ok(())
    }
}

// Stamp the right spine of a freshly grown tree with the old root's struck
// count, persisting every stamped node. The walk re-hydrates children as it
// goes and stops at the first node that already carries a count: the old
// root. The stamped nodes' left subtrees stay unmaterialized with zero
// strikes, which keeps the count-sum invariant intact.
fn stamp_right_spine<P: PersistenceManager>(
    node: &mut Node,
    bits: &BitManager,
    store: &mut P,
    struck_count: u64,
) -> Result<(), ShuffleStoreError> {
    node.set_struck_count(struck_count);
    node.save_state(store)?;

    // The spine above the old root is never terminal, so there is always
    // a right child.
    let right = node.right_child(bits, store)?;
    if right.struck_count == 0 {
        stamp_right_spine(right, bits, store, struck_count)?;
    }

    Ok(())
}
