//! A store for lazily materialized random permutations.
//!
//! A [`Shuffler`] maps the indices of a range `[0, size)` to a random
//! permutation of that same range, materializing each index→value pair the
//! first time it is asked for. Time and storage scale with the number of
//! entries actually queried, not with the size of the range, so sparse use
//! of permutations over ranges like `2^40` is practical. A cyclic shuffler
//! produces a permutation that is one single cycle.
//!
//! State is held behind a [`PersistenceManager`], defaulting to the
//! in-memory [`MemoryPersistence`]; the `persist` feature adds an on-disk
//! manager so a permutation can be materialized across process lifetimes.

pub use crate::persist::{MemoryPersistence, PersistenceManager};
pub use crate::shuffler::{Shuffler, ShufflerIter};
pub use crate::types::errors::ShuffleStoreError;
pub use crate::types::{Assignment, Counters, NodeState};

#[cfg(feature = "persist")]
pub use crate::lsm_tree::LsmPersistence;

mod bit_manager;
#[cfg(feature = "persist")]
pub mod lsm_tree;
pub mod persist;
pub mod shuffler;
mod strike_tree;
pub mod types;
