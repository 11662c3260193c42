//! oximer - a lock-free, bit-packed counting hash array
//!
//! `oximer` counts occurrences of fixed-length bit-vector keys (such as
//! 2-bit-packed symbol sequences) at high insertion rates from many threads,
//! with no locks on any path:
//!
//! - **Invertible hashing**: keys are hashed with a random GF(2) matrix whose
//!   low block is invertible, so the slot id doubles as storage for the low
//!   key bits and the full key can be reconstructed during iteration.
//! - **Dense packing**: cells are packed back to back at the bit level; a
//!   machine word usually carries pieces of several cells and every update is
//!   a word-sized compare-and-swap.
//! - **Counter overflow chaining**: counters wider than their field claim
//!   continuation cells along the probe schedule instead of resizing.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use oximer::{ArrayConfig, CountingArray, PackedKey};
//!
//! let config = ArrayConfig::new(1 << 20, 42, 7, 62);
//! let counts: CountingArray<PackedKey> = CountingArray::new(&config)?;
//!
//! counts.add(&key, 1)?;
//! let n = counts.get(&key);
//! for (key, count) in counts.iter_all() { /* ... */ }
//! ```

#![warn(missing_docs)]

pub mod array;
mod block;
pub mod config;
pub mod iter;
pub mod key;
pub mod matrix;
mod offsets;
pub mod reprobe;
pub mod stats;
pub mod status;
mod utility;

// Re-exports for convenience
pub use array::{CountingArray, SlotClaim};
pub use config::{ArrayConfig, ConfigError, OximerConfig};
pub use key::{BitKey, PackedKey};
pub use status::Status;

/// Constants used throughout the library
pub mod constants {
    /// Alignment of the backing memory block in bytes
    pub const PAGE_BYTES: usize = crate::block::PAGE_BYTES;

    /// Machine word width in bits
    pub const WORD_BITS: u32 = 64;
}

/// Prelude module for common imports
pub mod prelude {
    pub use crate::array::{CountingArray, SlotClaim};
    pub use crate::config::ArrayConfig;
    pub use crate::key::{BitKey, PackedKey};
    pub use crate::status::Status;
}
