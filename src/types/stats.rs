//------------ Types for Statistics -----------------------------------------

use std::fmt::Display;

/// Counters for the work a shuffler has performed over its lifetime. These
/// are process-local: a shuffler reconstructed from a persisted store starts
/// from zero.
#[derive(Copy, Clone, Debug, Default)]
pub struct Counters {
    generated: u64,
    restored: u64,
    reserved: u64,
}

impl Counters {
    pub fn inc_generated_count(&mut self) {
        self.generated += 1;
    }

    pub fn inc_restored_count(&mut self) {
        self.restored += 1;
    }

    pub fn inc_reserved_count(&mut self) {
        self.reserved += 1;
    }

    /// Number of index→value pairs generated by this instance.
    pub fn generated_count(&self) -> u64 {
        self.generated
    }

    /// Number of `value_at` calls answered from the persisted store.
    pub fn restored_count(&self) -> u64 {
        self.restored
    }

    /// Number of loop-start reservations made for cyclic generation.
    pub fn reserved_count(&self) -> u64 {
        self.reserved
    }
}

impl Display for Counters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} values generated, {} restored, {} loop starts reserved",
            self.generated, self.restored, self.reserved
        )
    }
}
