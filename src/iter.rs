//! Read-only iteration over stored entries.
//!
//! The iterator scans raw slot ids. Continuation cells are skipped; for every
//! claimed primary cell the residual key bits and the recovered origin slot
//! are combined through the inverse hash matrix to reconstruct the full key,
//! and the yielded count is the overflow-resolved sum. Iteration may run
//! concurrently with writers and can observe entries mid-update.

use crate::array::{CellState, CountingArray};
use crate::key::BitKey;

/// Iterator over `(key, count)` pairs of a slot range.
pub struct SlotIter<'a, K: BitKey> {
    array: &'a CountingArray<K>,
    id: u64,
    end: u64,
    key_buf: K,
}

impl<'a, K: BitKey> SlotIter<'a, K> {
    pub(crate) fn new(array: &'a CountingArray<K>, start: u64, end: u64) -> Self {
        Self {
            array,
            id: start.min(array.size()),
            end: end.min(array.size()),
            key_buf: K::zero(array.key_len()),
        }
    }

    /// First slot id of the range.
    pub fn start(&self) -> u64 {
        self.id
    }

    /// One past the last slot id of the range.
    pub fn end(&self) -> u64 {
        self.end
    }
}

impl<K: BitKey> Iterator for SlotIter<'_, K> {
    type Item = (K, u64);

    fn next(&mut self) -> Option<Self::Item> {
        while self.id < self.end {
            let id = self.id;
            self.id += 1;
            if self.array.read_cell(id, &mut self.key_buf) != CellState::Claimed {
                continue;
            }
            // The low key bits were never stored: recover them from the rest
            // of the hash image.
            let low = self.array.inverse_matrix().times(&self.key_buf);
            self.key_buf
                .set_bits(0, self.array.lsize() as u16, low);
            let count = self.array.resolved_value(id);
            return Some((self.key_buf.clone(), count));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;
    use crate::config::ArrayConfig;
    use crate::key::PackedKey;

    fn filled_array() -> (CountingArray<PackedKey>, HashMap<PackedKey, u64>) {
        let config = ArrayConfig {
            size: 64,
            key_bits: 10,
            counter_bits: 4,
            max_reprobe: 7,
        };
        let ary = CountingArray::with_rng(&config, &mut StdRng::seed_from_u64(11)).unwrap();
        let mut reference = HashMap::new();
        for v in [3u64, 99, 512, 700, 701, 702, 1023] {
            let k = PackedKey::from_u64(10, v);
            let n = v % 21 + 1;
            ary.add(&k, n).unwrap();
            reference.insert(k, n);
        }
        (ary, reference)
    }

    #[test]
    fn test_iteration_matches_reference() {
        let (ary, reference) = filled_array();
        let mut seen = HashMap::new();
        for (k, v) in ary.iter_all() {
            assert!(seen.insert(k, v).is_none(), "duplicate key yielded");
        }
        assert_eq!(seen, reference);
    }

    #[test]
    fn test_slices_cover_everything_once() {
        let (ary, reference) = filled_array();
        let mut seen = HashMap::new();
        for i in 0..5 {
            for (k, v) in ary.iter_slice(i, 5) {
                assert!(seen.insert(k, v).is_none());
            }
        }
        assert_eq!(seen, reference);
    }

    #[test]
    fn test_slice_bounds_clamped() {
        let (ary, _) = filled_array();
        let it = ary.iter_slice(9, 4);
        assert_eq!(it.start(), ary.size());
        assert_eq!(it.end(), ary.size());
        assert_eq!(it.count(), 0);
    }
}
