//! Rectangular binary matrices over GF(2).
//!
//! The table hashes a key `K` to a slot with `H * K`, where `H` is a random
//! `lsize x key_len` bit matrix. Because `H` is chosen with an invertible low
//! square block, the low `lsize` bits of `K` can be recovered from the slot id
//! and the stored high bits through the companion pseudo-inverse, so they are
//! never stored. Multiplication is the only hot-path operation and is
//! branch-free.

use rand::RngCore;

use crate::key::BitKey;
use crate::utility::low_bits;

/// A `rows x cols` matrix over GF(2), stored column-major: `columns[j]` holds
/// column `j` in its low `rows` bits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryMatrix {
    rows: u32,
    cols: u16,
    columns: Vec<u64>,
}

impl BinaryMatrix {
    /// A random `rows x cols` matrix drawn from `rng`. `rows` must be < 64
    /// and at most `cols`.
    pub fn randomize(rows: u32, cols: u16, rng: &mut impl RngCore) -> Self {
        assert!(rows < 64 && rows as u16 <= cols);
        let mask = low_bits(rows);
        let columns = (0..cols).map(|_| rng.next_u64() & mask).collect();
        Self { rows, cols, columns }
    }

    /// Keep redrawing until the low `rows x rows` block is invertible and
    /// return the matrix together with its pseudo-inverse.
    ///
    /// A uniform square bit matrix is invertible with probability ~0.29, so
    /// this terminates after a handful of draws.
    pub fn randomize_invertible(rows: u32, cols: u16, rng: &mut impl RngCore) -> (Self, Self) {
        loop {
            let m = Self::randomize(rows, cols, rng);
            if let Some(inv) = m.pseudo_inverse() {
                return (m, inv);
            }
        }
    }

    /// Number of rows.
    #[inline]
    pub const fn rows(&self) -> u32 {
        self.rows
    }

    /// Number of columns.
    #[inline]
    pub const fn cols(&self) -> u16 {
        self.cols
    }

    /// Column `j` as a bit vector in the low `rows` bits.
    #[inline]
    pub fn column(&self, j: u16) -> u64 {
        self.columns[j as usize]
    }

    /// Multiply by a key: XOR of the columns selected by the key's set bits.
    ///
    /// The inner loop is a mask-and-xor per column so slot computation never
    /// branches on key data.
    pub fn times<K: BitKey>(&self, key: &K) -> u64 {
        let mut h = 0u64;
        let mut start = 0u16;
        while start < self.cols {
            let n = (self.cols - start).min(32);
            let chunk = key.get_bits(start, n);
            let base = start as usize;
            for t in 0..n as usize {
                h ^= self.columns[base + t] & 0u64.wrapping_sub((chunk >> t) & 1);
            }
            start += n;
        }
        h
    }

    /// Multiply by a plain bit vector held in a word (`cols` must be <= 64).
    pub fn times_u64(&self, v: u64) -> u64 {
        debug_assert!(self.cols <= 64);
        let mut h = 0u64;
        for (j, &col) in self.columns.iter().enumerate() {
            h ^= col & 0u64.wrapping_sub((v >> j) & 1);
        }
        h
    }

    /// Pseudo-inverse `G` such that for any key `K` with `slot = H * K`,
    /// replacing the low `rows` bits of `K` by `slot` and multiplying by `G`
    /// yields the original low `rows` bits of `K`.
    ///
    /// Returns `None` when the low square block of `H` is singular.
    pub fn pseudo_inverse(&self) -> Option<Self> {
        let r = self.rows as usize;
        // Row-major copy of the low square block, augmented with identity.
        let mut a = vec![0u64; r];
        let mut inv = vec![0u64; r];
        for i in 0..r {
            for (j, &col) in self.columns[..r].iter().enumerate() {
                a[i] |= ((col >> i) & 1) << j;
            }
            inv[i] = 1u64 << i;
        }
        // Gauss-Jordan elimination over GF(2).
        for c in 0..r {
            let pivot = (c..r).find(|&p| (a[p] >> c) & 1 == 1)?;
            a.swap(c, pivot);
            inv.swap(c, pivot);
            for p in 0..r {
                if p != c && (a[p] >> c) & 1 == 1 {
                    a[p] ^= a[c];
                    inv[p] ^= inv[c];
                }
            }
        }
        // Back to column-major.
        let mut inv_cols = vec![0u64; r];
        for (i, &row) in inv.iter().enumerate() {
            for (j, ic) in inv_cols.iter_mut().enumerate() {
                *ic |= ((row >> j) & 1) << i;
            }
        }
        // G = [A^-1 | A^-1 * B]: high columns are transformed through A^-1.
        let mut columns = inv_cols.clone();
        for &col in &self.columns[r..] {
            let mut g = 0u64;
            for (i, &ic) in inv_cols.iter().enumerate() {
                g ^= ic & 0u64.wrapping_sub((col >> i) & 1);
            }
            columns.push(g);
        }
        Some(Self {
            rows: self.rows,
            cols: self.cols,
            columns,
        })
    }
}
