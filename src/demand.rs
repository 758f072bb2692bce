//! Demand tracking: converts downstream pull requests into the poll budget
//! the receiver loop is allowed to spend.

/// Outstanding record count granted by downstream and not yet delivered.
///
/// `request` saturates instead of overflowing; `consume` never goes below
/// zero. Zero outstanding demand means the loop must pause its partitions
/// rather than buffer fetched records.
#[derive(Debug, Default)]
pub struct DemandTracker {
    outstanding: u64,
}

impl DemandTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant `n` more records of demand.
    pub fn request(&mut self, n: u64) {
        self.outstanding = self.outstanding.saturating_add(n);
    }

    /// Account for `k` delivered records.
    pub fn consume(&mut self, k: u64) {
        debug_assert!(
            k <= self.outstanding,
            "delivered {k} records with only {} demand outstanding",
            self.outstanding
        );
        self.outstanding = self.outstanding.saturating_sub(k);
    }

    pub fn outstanding(&self) -> u64 {
        self.outstanding
    }

    pub fn is_exhausted(&self) -> bool {
        self.outstanding == 0
    }
}
