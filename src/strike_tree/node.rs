use crate::bit_manager::BitManager;
use crate::persist::PersistenceManager;
use crate::types::errors::ShuffleStoreError;
use crate::types::NodeState;

//------------ Node ----------------------------------------------------------

// A node owns the index subrange [base, base + 2^(bit_number + 1)) of the
// global index space and counts how many entries in that subrange have been
// struck. Terminal nodes (bit number 5) track their 64 entries in a bitmap;
// internal nodes split the subrange over a right child (bit clear) and a
// left child (bit set). Nodes do not know their own base: the struck index
// is assembled bit by bit on the way back up the descent.
//
// Children are created on first use. A child of a node that has struck
// entries may itself have persisted state from an earlier process lifetime,
// so creation re-hydrates through the persistence manager in that case. The
// key arithmetic (right child at key - 2^(bit_number + 1), left child at
// key - 1) keeps all live keys distinct, which makes re-hydration follow
// the same shape every time.

/// Bit number at which a node becomes terminal: the node then covers one
/// 64-bit bitmap worth of entries.
pub(super) const TERMINAL_BIT_NUMBER: u8 = 5;

/// Bitmask selecting the within-terminal part of a global index.
pub(super) const TERMINAL_SIZE_BITMASK: u64 = 63;

const BIT_COUNT_BITMASK_2: u64 = 0x5555_5555_5555_5555;
const BIT_COUNT_BITMASK_4: u64 = 0x3333_3333_3333_3333;
const BIT_COUNT_BITMASK_8: u64 = 0x0F0F_0F0F_0F0F_0F0F;

pub(crate) struct Node {
    key: u64,
    bit_number: u8,
    terminal: bool,
    pub(super) struck_count: u64,
    struck_bitmap: u64,
    right: Option<Box<Node>>,
    left: Option<Box<Node>>,
}

impl Node {
    /// Construct a node, re-hydrating persisted state when `restore` is
    /// requested. A restore miss yields zero state.
    pub(super) fn new<P: PersistenceManager>(
        store: &P,
        key: u64,
        bit_number: u8,
        restore: bool,
    ) -> Result<Self, ShuffleStoreError> {
        let state = if restore {
            store.restore_node_state(key)?
        } else {
            None
        };
        let (struck_count, struck_bitmap) =
            state.map_or((0, 0), |s| (s.struck_count, s.struck_bitmap));

        Ok(Node {
            key,
            bit_number,
            terminal: bit_number == TERMINAL_BIT_NUMBER,
            struck_count,
            struck_bitmap,
            right: None,
            left: None,
        })
    }

    pub(super) fn key(&self) -> u64 {
        self.key
    }

    pub(super) fn bit_number(&self) -> u8 {
        self.bit_number
    }

    pub(super) fn set_struck_count(&mut self, struck_count: u64) {
        self.struck_count = struck_count;
    }

    /// Write this node's state through the persistence manager: saved while
    /// any entry is struck, deleted once the count returns to zero.
    pub(super) fn save_state<P: PersistenceManager>(
        &self,
        store: &mut P,
    ) -> Result<(), ShuffleStoreError> {
        if self.struck_count != 0 {
            store.save_node_state(
                self.key,
                NodeState::new(self.struck_count, self.struck_bitmap),
            )
        } else {
            store.delete_node_state(self.key)
        }
    }

    /// The right child, created (and possibly re-hydrated) on first use.
    pub(super) fn right_child<P: PersistenceManager>(
        &mut self,
        bits: &BitManager,
        store: &P,
    ) -> Result<&mut Node, ShuffleStoreError> {
        let child = match self.right.take() {
            Some(node) => node,
            None => Box::new(Node::new(
                store,
                self.key - bits.bit(self.bit_number + 1),
                self.bit_number - 1,
                self.struck_count != 0,
            )?),
        };
        Ok(self.right.insert(child))
    }

    /// The left child, created (and possibly re-hydrated) on first use.
    fn left_child<P: PersistenceManager>(
        &mut self,
        store: &P,
    ) -> Result<&mut Node, ShuffleStoreError> {
        let child = match self.left.take() {
            Some(node) => node,
            None => Box::new(Node::new(
                store,
                self.key - 1,
                self.bit_number - 1,
                self.struck_count != 0,
            )?),
        };
        Ok(self.left.insert(child))
    }

    /// Strike the entry with incremental index `k`: the k-th entry of this
    /// node's subrange that has not been struck yet. Returns the struck
    /// entry's offset within the subrange. Counts along the descent path
    /// are updated and persisted top-down.
    pub(super) fn strike<P: PersistenceManager>(
        &mut self,
        bits: &BitManager,
        store: &mut P,
        k: u64,
    ) -> Result<u64, ShuffleStoreError> {
        self.struck_count += 1;

        if self.terminal {
            let index = select_unstruck_bit(self.struck_bitmap, k);
            self.struck_bitmap |= 1 << index;
            self.save_state(store)?;
            return Ok(index);
        }

        self.save_state(store)?;

        let bit_number = self.bit_number;

        // Normalize the incremental index to the right child by adding the
        // number of struck entries in the right child. The target is in the
        // right child's range exactly when this node's bit stays clear.
        let right_struck_count =
            self.right_child(bits, store)?.struck_count;
        let right_normalized_index = k + right_struck_count;

        if bits.is_clear(right_normalized_index, bit_number) {
            self.right_child(bits, store)?.strike(bits, store, k)
        } else {
            // The target is in the left child's range: clearing the bit
            // gives the left incremental index, setting it on the result
            // accounts for the right child's range.
            let index = self.left_child(store)?.strike(
                bits,
                store,
                bits.clear(right_normalized_index, bit_number),
            )?;
            Ok(bits.set(index, bit_number))
        }
    }

    /// Strike a specific entry, identified by its offset within this node's
    /// subrange. Used to pin the start of an open loop during cyclic
    /// generation.
    pub(super) fn reserve<P: PersistenceManager>(
        &mut self,
        bits: &BitManager,
        store: &mut P,
        index: u64,
    ) -> Result<(), ShuffleStoreError> {
        self.struck_count += 1;

        if self.terminal {
            self.struck_bitmap |= 1 << (index & TERMINAL_SIZE_BITMASK);
            return self.save_state(store);
        }

        self.save_state(store)?;

        if bits.is_clear(index, self.bit_number) {
            self.right_child(bits, store)?.reserve(bits, store, index)
        } else {
            self.left_child(store)?.reserve(bits, store, index)
        }
    }

    /// Undo a reservation made with [`Node::reserve`]. Node state is
    /// deleted from persistence wherever the count returns to zero.
    pub(super) fn unreserve<P: PersistenceManager>(
        &mut self,
        bits: &BitManager,
        store: &mut P,
        index: u64,
    ) -> Result<(), ShuffleStoreError> {
        self.struck_count -= 1;

        if self.terminal {
            self.struck_bitmap &= !(1 << (index & TERMINAL_SIZE_BITMASK));
            return self.save_state(store);
        }

        self.save_state(store)?;

        if bits.is_clear(index, self.bit_number) {
            self.right_child(bits, store)?.unreserve(bits, store, index)
        } else {
            self.left_child(store)?.unreserve(bits, store, index)
        }
    }

    /// Check every invariant of this node and, where struck entries exist,
    /// of its subtree. `size` is the number of entries this node's subrange
    /// actually holds; it determines the canonical right/left partition.
    pub(super) fn validate<P: PersistenceManager>(
        &mut self,
        bits: &BitManager,
        store: &P,
        size: u64,
        cyclic: bool,
        keys: &mut Vec<u64>,
    ) -> Result<(), ShuffleStoreError> {
        keys.push(self.key);

        let persisted = store.restore_node_state(self.key)?;
        if self.struck_count == 0 {
            if persisted.is_some() {
                return Err(self.violation(
                    "state persisted for node with zero struck count",
                ));
            }
        } else if persisted
            != Some(NodeState::new(self.struck_count, self.struck_bitmap))
        {
            return Err(self.violation(format!(
                "persisted state {:?} doesn't match struck count {} and \
                 bitmap {:#x}",
                persisted, self.struck_count, self.struck_bitmap
            )));
        }

        if !self.terminal {
            if self.struck_count == 0 {
                // A non-cyclic shuffler only ever materializes children on
                // the way to a strike, so a count of zero means none exist.
                // Cyclic generation also walks reserve/unreserve paths.
                if !cyclic && (self.right.is_some() || self.left.is_some())
                {
                    return Err(self.violation(
                        "unexpected right and/or left nodes at node with \
                         zero struck count",
                    ));
                }
            } else {
                let bit = bits.bit(self.bit_number);

                let (right_size, left_size) =
                    if bits.is_set(size, self.bit_number + 1) {
                        // Size is the maximum possible and splits evenly.
                        (bit, bit)
                    } else if bits.is_set(size, self.bit_number) {
                        // Size fills the right child; the remainder goes
                        // left.
                        (bit, bits.clear(size, self.bit_number))
                    } else {
                        // Size doesn't fill the right child; no left child
                        // is ever created.
                        (size, 0)
                    };

                let right_left_struck_count = if right_size != size {
                    let right_count =
                        self.right_child(bits, store)?.struck_count;
                    let left_count = self.left_child(store)?.struck_count;
                    right_count + left_count
                } else {
                    if self.left.is_some()
                        || store
                            .restore_node_state(self.key - 1)?
                            .is_some()
                    {
                        return Err(self.violation(
                            "unexpected left node where size fits the \
                             right child",
                        ));
                    }
                    self.right_child(bits, store)?.struck_count
                };

                if self.struck_count != right_left_struck_count {
                    return Err(self.violation(format!(
                        "struck count {} doesn't match sum of right and \
                         left struck counts {}",
                        self.struck_count, right_left_struck_count
                    )));
                }

                self.right_child(bits, store)?.validate(
                    bits, store, right_size, cyclic, keys,
                )?;
                if right_size != size {
                    self.left_child(store)?.validate(
                        bits, store, left_size, cyclic, keys,
                    )?;
                }
            }

            if self.struck_bitmap != 0 {
                return Err(self.violation(
                    "non-zero struck bitmap at non-terminal node",
                ));
            }
        } else {
            if self.right.is_some() || self.left.is_some() {
                return Err(self.violation(
                    "unexpected right and/or left nodes at terminal node",
                ));
            }

            let struck_bit_count = u64::from(self.struck_bitmap.count_ones());
            if struck_bit_count != self.struck_count {
                return Err(self.violation(format!(
                    "struck bit count {} doesn't match struck count {}",
                    struck_bit_count, self.struck_count
                )));
            }
        }

        Ok(())
    }

    fn violation(
        &self,
        detail: impl std::fmt::Display,
    ) -> ShuffleStoreError {
        ShuffleStoreError::InvariantViolation(format!(
            "{} at node {}",
            detail, self.key
        ))
    }
}

//------------ select_unstruck_bit -------------------------------------------

/// Find the bit number of the (k+1)-th zero bit of `struck_bitmap`, i.e.
/// the zero bit with exactly `k` zero bits below it.
///
/// This is the unrolled popcount pyramid and binary search of Figure 5-2 of
/// Hacker's Delight, 2nd edition (Henry S. Warren, Jr.), run over the
/// inverted bitmap. Each `bit_count_N` word holds the population counts of
/// all its N-bit blocks in parallel; the search then narrows from the
/// 32-bit half down to a single bit, subtracting the count of the right
/// half whenever the target lies in the left half.
fn select_unstruck_bit(struck_bitmap: u64, k: u64) -> u64 {
    let bit_count_1 = !struck_bitmap;
    let bit_count_2 =
        bit_count_1 - (bit_count_1 >> 0x01 & BIT_COUNT_BITMASK_2);
    let bit_count_4 = (bit_count_2 & BIT_COUNT_BITMASK_4)
        + (bit_count_2 >> 0x02 & BIT_COUNT_BITMASK_4);
    let bit_count_8 = (bit_count_4 + (bit_count_4 >> 0x04)) & BIT_COUNT_BITMASK_8;
    let bit_count_16 = bit_count_8 + (bit_count_8 >> 0x08);
    let bit_count_32 = bit_count_16 + (bit_count_16 >> 0x10);

    let mut remaining = k;
    let mut index: u64;
    let mut right_bit_count: u64;

    // 32-bit count; the mask limits the count to 0-32.
    right_bit_count = bit_count_32 & 0x3F;
    if right_bit_count <= remaining {
        remaining -= right_bit_count;
        index = 0x20;
    } else {
        index = 0x00;
    }

    // 16-bit count; the mask limits the count to 0-16.
    right_bit_count = bit_count_16 >> index & 0x1F;
    if right_bit_count <= remaining {
        remaining -= right_bit_count;
        index |= 0x10;
    }

    // 8-bit count; the mask limits the count to 0-8.
    right_bit_count = bit_count_8 >> index & 0x0F;
    if right_bit_count <= remaining {
        remaining -= right_bit_count;
        index |= 0x08;
    }

    // 4-bit count; the mask limits the count to 0-4.
    right_bit_count = bit_count_4 >> index & 0x07;
    if right_bit_count <= remaining {
        remaining -= right_bit_count;
        index |= 0x04;
    }

    // 2-bit count; the mask limits the count to 0-2.
    right_bit_count = bit_count_2 >> index & 0x03;
    if right_bit_count <= remaining {
        remaining -= right_bit_count;
        index |= 0x02;
    }

    // 1-bit count.
    right_bit_count = bit_count_1 >> index & 0x01;
    if right_bit_count <= remaining {
        index |= 0x01;
    }

    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::MemoryPersistence;

    fn select_unstruck_bit_naive(struck_bitmap: u64, k: u64) -> u64 {
        let mut remaining = k;
        for bit in 0..64 {
            if struck_bitmap & (1 << bit) == 0 {
                if remaining == 0 {
                    return bit;
                }
                remaining -= 1;
            }
        }
        unreachable!("k exceeds the number of unstruck bits");
    }

    #[test]
    fn select_matches_naive_scan() {
        let bitmaps = [
            0,
            1,
            u64::MAX >> 1,
            0xAAAA_AAAA_AAAA_AAAA,
            0x5555_5555_5555_5555,
            0xDEAD_BEEF_CAFE_F00D,
            0xFFFF_FFFF_0000_0000,
            0x0000_0000_FFFF_FFFF,
            u64::MAX - (1 << 63),
            u64::MAX - 1,
        ];

        for bitmap in bitmaps {
            let unstruck = u64::from((!bitmap).count_ones());
            for k in 0..unstruck {
                assert_eq!(
                    select_unstruck_bit(bitmap, k),
                    select_unstruck_bit_naive(bitmap, k),
                    "bitmap {:#x} k {}",
                    bitmap,
                    k
                );
            }
        }
    }

    #[test]
    fn terminal_strike_exhausts_all_entries(
    ) -> Result<(), ShuffleStoreError> {
        let bits = BitManager::new(7);
        let mut store = MemoryPersistence::new();
        let mut node = Node::new(&store, 127, TERMINAL_BIT_NUMBER, false)?;

        // Striking the lowest unstruck entry every time must walk the
        // bitmap in order.
        for expected in 0..64 {
            assert_eq!(node.strike(&bits, &mut store, 0)?, expected);
        }
        assert_eq!(node.struck_count, 64);
        assert_eq!(node.struck_bitmap, u64::MAX);

        Ok(())
    }

    #[test]
    fn reserve_then_unreserve_restores_zero_state(
    ) -> Result<(), ShuffleStoreError> {
        let bits = BitManager::new(7);
        let mut store = MemoryPersistence::new();
        let mut node = Node::new(&store, 127, TERMINAL_BIT_NUMBER, false)?;

        node.reserve(&bits, &mut store, 42)?;
        assert_eq!(node.struck_count, 1);
        assert!(store.restore_node_state(127)?.is_some());

        node.unreserve(&bits, &mut store, 42)?;
        assert_eq!(node.struck_count, 0);
        assert_eq!(node.struck_bitmap, 0);
        assert!(store.restore_node_state(127)?.is_none());

        Ok(())
    }
}
