//------------ Shuffler ------------------------------------------------------

use log::{debug, trace};
use rand::rngs::ThreadRng;
use rand::Rng;

use crate::persist::{MemoryPersistence, PersistenceManager};
use crate::strike_tree::StrikeTree;
use crate::types::errors::ShuffleStoreError;
use crate::types::{Assignment, Counters};

/// Largest supported range size. The node keying scheme needs one key bit
/// more than the range's bit length, so a u64 key space tops out here.
const MAX_SIZE: u64 = 1 << 63;

/// A lazily materialized random permutation of `[0, size)`.
///
/// The association between an index and its value is drawn the first time
/// `value_at` is called for the index, by striking a uniformly selected
/// entry from the not-yet-assigned remainder of the range (a lazy
/// Fisher-Yates shuffle). Work and storage are proportional to the number
/// of entries actually queried, so very large ranges are fine as long as
/// only part of them is ever touched.
///
/// A cyclic shuffler additionally guarantees that the finished assignment
/// is one single cycle (the Sattolo variant): starting from index 0 and
/// repeatedly following `value_at` visits every entry exactly once before
/// returning to 0. While the permutation is under construction the
/// shuffler tracks the open loops this creates and never lets a loop close
/// early.
///
/// All state lives behind a [`PersistenceManager`], so a permutation can be
/// materialized incrementally across process lifetimes by handing the same
/// manager to a sequence of shufflers constructed with the same parameters.
///
/// A shuffler is single-threaded; callers serialize access. Checkpointing
/// a durable store in the middle of a cyclic `value_at` can leave one
/// extra reservation in the tree; complete the call before checkpointing.
pub struct Shuffler<P: PersistenceManager = MemoryPersistence> {
    size: u64,
    cyclic: bool,
    rng: ThreadRng,
    store: P,
    tree: StrikeTree,
    remaining_size: u64,
    counters: Counters,
}

impl Shuffler<MemoryPersistence> {
    /// Construct a shuffler over a fresh in-memory store.
    pub fn new(
        size: u64,
        cyclic: bool,
    ) -> Result<Self, ShuffleStoreError> {
        Self::with_persistence(size, cyclic, MemoryPersistence::new())
    }
}

impl<P: PersistenceManager> Shuffler<P> {
    /// Construct a shuffler over the given persistence manager, picking up
    /// whatever state the manager already holds. `size` and `cyclic` must
    /// match the parameters the manager's state was created with.
    pub fn with_persistence(
        size: u64,
        cyclic: bool,
        store: P,
    ) -> Result<Self, ShuffleStoreError> {
        if size == 0 || size > MAX_SIZE {
            return Err(ShuffleStoreError::InvalidSize);
        }

        let tree = StrikeTree::new(&store, size)?;
        let remaining_size =
            size.checked_sub(tree.struck_count()).ok_or_else(|| {
                ShuffleStoreError::InvariantViolation(format!(
                    "root struck count {} exceeds size {}",
                    tree.struck_count(),
                    size
                ))
            })?;

        debug!(
            "shuffler over [0, {}) cyclic {} with {} remaining",
            size, cyclic, remaining_size
        );

        Ok(Shuffler {
            size,
            cyclic,
            rng: rand::rng(),
            store,
            tree,
            remaining_size,
            counters: Counters::default(),
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn cyclic(&self) -> bool {
        self.cyclic
    }

    /// Number of entries that have not been assigned a value yet.
    pub fn remaining(&self) -> u64 {
        self.remaining_size
    }

    pub fn counters(&self) -> Counters {
        self.counters
    }

    pub fn persistence(&self) -> &P {
        &self.store
    }

    /// Release the persistence manager, so a later shuffler with the same
    /// parameters can continue from the accumulated state.
    pub fn into_persistence(self) -> P {
        self.store
    }

    /// The value at `index`, drawing and recording one if this is the
    /// first query for the index.
    pub fn value_at(
        &mut self,
        index: u64,
    ) -> Result<u64, ShuffleStoreError> {
        if index >= self.size {
            return Err(ShuffleStoreError::IndexOutOfRange);
        }

        let value = match self.store.value_at(index)? {
            Some(Assignment::Closed(value)) => {
                self.counters.inc_restored_count();
                value
            }
            Some(Assignment::OpenEnd(_)) if !self.cyclic => {
                // Open-loop records are only ever written by cyclic
                // shufflers; this store was built with other parameters.
                return Err(ShuffleStoreError::ValueOutOfRange);
            }
            None if !self.cyclic => {
                let value = self.next_value()?;
                self.store
                    .save_index_value(index, Assignment::Closed(value))?;
                self.counters.inc_generated_count();
                trace!("generated {} -> {}", index, value);
                value
            }
            stored => {
                // Cyclic generation: the index either starts a new loop
                // or is the end of an existing one, in which case the
                // stored marker names that loop's start.
                let (loop_start, marker) = match stored {
                    Some(marker @ Assignment::OpenEnd(loop_start)) => {
                        self.store.delete_index_value(index, marker)?;
                        (loop_start, marker)
                    }
                    _ => (index, Assignment::OpenEnd(index)),
                };

                let value = self.close_or_extend_loop(loop_start, marker)?;
                self.store
                    .save_index_value(index, Assignment::Closed(value))?;
                self.counters.inc_generated_count();
                trace!("generated {} -> {} (loop start {})", index, value, loop_start);
                value
            }
        };

        if value >= self.size {
            return Err(ShuffleStoreError::ValueOutOfRange);
        }

        Ok(value)
    }

    /// The index `value` was assigned to, if that assignment has been made.
    /// Never generates.
    pub fn index_of(
        &self,
        value: u64,
    ) -> Result<Option<u64>, ShuffleStoreError> {
        self.store.index_of(Assignment::Closed(value))
    }

    /// Change the size of the range. Growing is always possible until a
    /// cyclic shuffler has closed its cycle; shrinking only while nothing
    /// has been struck. Previously assigned pairs stay valid across
    /// growth.
    pub fn resize(
        &mut self,
        new_size: u64,
    ) -> Result<(), ShuffleStoreError> {
        if new_size == self.size {
            return Ok(());
        }
        if new_size == 0 || new_size > MAX_SIZE {
            return Err(ShuffleStoreError::InvalidSize);
        }
        if new_size < self.size && self.tree.struck_count() != 0 {
            return Err(ShuffleStoreError::ShrinkInUse);
        }
        if self.cyclic && self.remaining_size == 0 {
            return Err(ShuffleStoreError::ResizeClosed);
        }

        debug!("resizing shuffler from {} to {}", self.size, new_size);

        self.size = new_size;
        self.tree.resize(&mut self.store, new_size)?;
        self.remaining_size = self.size - self.tree.struck_count();

        Ok(())
    }

    /// Verify the whole tree and the cached remaining size. Intended for
    /// tests; any violation means the store is corrupted.
    pub fn validate_state(&mut self) -> Result<(), ShuffleStoreError> {
        if Some(self.remaining_size)
            != self.size.checked_sub(self.tree.struck_count())
        {
            return Err(ShuffleStoreError::InvariantViolation(format!(
                "remaining size {} doesn't equal size {} minus root \
                 struck count {}",
                self.remaining_size,
                self.size,
                self.tree.struck_count()
            )));
        }

        self.tree.validate(&self.store, self.size, self.cyclic)
    }

    /// Iterate over the permutation's values. A non-cyclic shuffler yields
    /// `value_at(0), value_at(1), …, value_at(size - 1)`; a cyclic one
    /// follows the cycle from index 0 and ends when the cycle closes.
    pub fn iter(&mut self) -> ShufflerIter<'_, P> {
        ShufflerIter {
            shuffler: self,
            next_index: 0,
        }
    }

    fn next_value(&mut self) -> Result<u64, ShuffleStoreError> {
        let k = self.rng.random_range(0..self.remaining_size);
        let value = self.tree.strike(&mut self.store, k)?;
        self.remaining_size -= 1;
        Ok(value)
    }

    // Reserve the loop's start so the draw cannot close this loop on
    // itself, draw a successor, move the open-end marker to wherever the
    // loop's new end lands, then release the reservation. Once the
    // reservation exhausts the range, the final hop closes the cycle
    // instead of drawing.
    fn close_or_extend_loop(
        &mut self,
        loop_start: u64,
        marker: Assignment,
    ) -> Result<u64, ShuffleStoreError> {
        self.tree.reserve(&mut self.store, loop_start)?;
        self.remaining_size -= 1;
        self.counters.inc_reserved_count();

        if self.remaining_size == 0 {
            return Ok(loop_start);
        }

        let reserve_remaining_size = self.remaining_size;
        let value = self.next_value()?;

        // If the drawn value starts another open loop, that whole loop is
        // spliced in and the marker moves to its end; otherwise the value
        // itself becomes the open end.
        let loop_end = self
            .store
            .index_of(Assignment::OpenEnd(value))?
            .unwrap_or(value);

        self.store.save_index_value(loop_end, marker)?;

        self.tree.unreserve(&mut self.store, loop_start)?;
        self.remaining_size = reserve_remaining_size;

        Ok(value)
    }
}

//------------ ShufflerIter --------------------------------------------------

/// Lazy iterator over a shuffler's values; see [`Shuffler::iter`]. The
/// iterator is fused after yielding an error.
pub struct ShufflerIter<'a, P: PersistenceManager> {
    shuffler: &'a mut Shuffler<P>,
    next_index: u64,
}

impl<P: PersistenceManager> Iterator for ShufflerIter<'_, P> {
    type Item = Result<u64, ShuffleStoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_index == self.shuffler.size {
            return None;
        }

        let value = match self.shuffler.value_at(self.next_index) {
            Ok(value) => value,
            Err(err) => {
                self.next_index = self.shuffler.size;
                return Some(Err(err));
            }
        };

        if !self.shuffler.cyclic {
            self.next_index += 1;
        } else if value != 0 {
            // The cyclic iteration moves to the index the cycle points at.
            self.next_index = value;
        } else {
            // The cycle has closed.
            self.next_index = self.shuffler.size;
        }

        Some(Ok(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_index() -> Result<(), ShuffleStoreError> {
        let mut shuffler = Shuffler::new(10, false)?;

        assert_eq!(
            shuffler.value_at(10),
            Err(ShuffleStoreError::IndexOutOfRange)
        );
        assert_eq!(
            shuffler.value_at(u64::MAX),
            Err(ShuffleStoreError::IndexOutOfRange)
        );

        Ok(())
    }

    #[test]
    fn rejects_zero_size() {
        assert_eq!(
            Shuffler::new(0, false).err(),
            Some(ShuffleStoreError::InvalidSize)
        );
        assert_eq!(
            Shuffler::new(0, true).err(),
            Some(ShuffleStoreError::InvalidSize)
        );
    }

    #[test]
    fn single_entry_maps_to_itself() -> Result<(), ShuffleStoreError> {
        let mut shuffler = Shuffler::new(1, false)?;
        assert_eq!(shuffler.value_at(0)?, 0);

        // The only single-cycle permutation of one entry is the identity.
        let mut shuffler = Shuffler::new(1, true)?;
        assert_eq!(shuffler.value_at(0)?, 0);
        shuffler.validate_state()?;

        Ok(())
    }

    #[test]
    fn cyclic_never_self_loops() -> Result<(), ShuffleStoreError> {
        // With two entries the only single cycle is the swap; with small
        // sizes in general a self-loop would be the most likely failure.
        for _ in 0..50 {
            let mut shuffler = Shuffler::new(2, true)?;
            assert_eq!(shuffler.value_at(0)?, 1);
            assert_eq!(shuffler.value_at(1)?, 0);
        }

        for size in 3..12u64 {
            for _ in 0..20 {
                let mut shuffler = Shuffler::new(size, true)?;
                for index in 0..size {
                    assert_ne!(shuffler.value_at(index)?, index);
                }
                shuffler.validate_state()?;
            }
        }

        Ok(())
    }

    #[test]
    fn shrink_rules() -> Result<(), ShuffleStoreError> {
        let mut shuffler = Shuffler::new(100, false)?;

        // Untouched shufflers may shrink.
        shuffler.resize(50)?;
        assert_eq!(shuffler.size(), 50);
        shuffler.validate_state()?;

        shuffler.value_at(0)?;
        assert_eq!(
            shuffler.resize(25),
            Err(ShuffleStoreError::ShrinkInUse)
        );

        // Growing stays possible.
        shuffler.resize(75)?;
        shuffler.validate_state()?;

        Ok(())
    }

    #[test]
    fn completed_cycle_cannot_resize() -> Result<(), ShuffleStoreError> {
        let mut shuffler = Shuffler::new(6, true)?;
        for index in 0..6 {
            shuffler.value_at(index)?;
        }

        assert_eq!(shuffler.remaining(), 0);
        assert_eq!(
            shuffler.resize(12),
            Err(ShuffleStoreError::ResizeClosed)
        );

        Ok(())
    }

    #[test]
    fn counters_track_generation() -> Result<(), ShuffleStoreError> {
        let mut shuffler = Shuffler::new(16, false)?;

        for index in 0..16 {
            shuffler.value_at(index)?;
        }
        for index in 0..4 {
            shuffler.value_at(index)?;
        }

        assert_eq!(shuffler.counters().generated_count(), 16);
        assert_eq!(shuffler.counters().restored_count(), 4);
        assert_eq!(shuffler.counters().reserved_count(), 0);

        Ok(())
    }
}
