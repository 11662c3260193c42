//! Occupancy statistics for a counting array.

use std::fmt;

use crate::array::{CellState, CountingArray};
use crate::key::BitKey;

/// Point-in-time classification of every slot in an array.
#[derive(Debug, Clone, PartialEq)]
pub struct OccupancyStats {
    /// Total slot count.
    pub size: u64,
    /// Slots holding a primary cell.
    pub primary_cells: u64,
    /// Slots holding an overflow continuation cell.
    pub continuation_cells: u64,
    /// Unclaimed slots.
    pub empty_cells: u64,
    /// Claimed slots (primary plus continuation) over total.
    pub load_factor: f64,
}

impl fmt::Display for OccupancyStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Occupancy:")?;
        writeln!(f, "  Slots: {}", self.size)?;
        writeln!(f, "  Primary cells: {}", self.primary_cells)?;
        writeln!(f, "  Continuation cells: {}", self.continuation_cells)?;
        writeln!(f, "  Empty cells: {}", self.empty_cells)?;
        writeln!(f, "  Load factor: {:.2}%", self.load_factor * 100.0)
    }
}

impl<K: BitKey> CountingArray<K> {
    /// Scan every slot and classify it. Concurrent writers may shift the
    /// numbers while the scan runs.
    pub fn occupancy(&self) -> OccupancyStats {
        let mut scratch = K::zero(self.key_len());
        let mut primary = 0u64;
        let mut continuation = 0u64;
        let mut empty = 0u64;
        for id in 0..self.size() {
            match self.read_cell(id, &mut scratch) {
                CellState::Empty => empty += 1,
                CellState::Continuation => continuation += 1,
                // An in-flight claim occupies its slot already.
                CellState::Claimed | CellState::NotReady => primary += 1,
            }
        }
        OccupancyStats {
            size: self.size(),
            primary_cells: primary,
            continuation_cells: continuation,
            empty_cells: empty,
            load_factor: (primary + continuation) as f64 / self.size() as f64,
        }
    }
}
