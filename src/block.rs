//! Page-aligned, zero-initialised word storage shared by all threads.
//!
//! Every mutation of the block goes through a compare-and-swap on a single
//! `AtomicU64`; a word typically carries pieces of several logical cells, so
//! writers only ever OR their masked bits in.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::status::Status;
use crate::utility::is_power_of_two;

/// Allocation alignment: one page, so the table starts on a page boundary.
pub const PAGE_BYTES: usize = 4096;

/// A fixed array of atomic words backing the packed cells.
pub struct WordBlock {
    words: NonNull<AtomicU64>,
    len: usize,
}

impl WordBlock {
    /// Allocate `len` zeroed words, page aligned.
    pub fn zeroed(len: usize) -> Result<Self, Status> {
        debug_assert!(is_power_of_two(PAGE_BYTES as u64));
        if len == 0 {
            return Err(Status::InvalidArgument);
        }
        let layout = Layout::from_size_align(len * std::mem::size_of::<AtomicU64>(), PAGE_BYTES)
            .map_err(|_| Status::OutOfMemory)?;
        // Zeroed memory is a valid AtomicU64 array.
        let ptr = unsafe { alloc_zeroed(layout) };
        match NonNull::new(ptr as *mut AtomicU64) {
            Some(words) => Ok(Self { words, len }),
            None => Err(Status::OutOfMemory),
        }
    }

    /// Number of words.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Size of the allocation in bytes.
    #[inline]
    pub fn byte_len(&self) -> usize {
        self.len * std::mem::size_of::<AtomicU64>()
    }

    /// The word at `index`.
    #[inline]
    pub fn word(&self, index: usize) -> &AtomicU64 {
        debug_assert!(index < self.len);
        unsafe { &*self.words.as_ptr().add(index) }
    }

    /// Load the word at `index` with acquire ordering.
    #[inline]
    pub fn load(&self, index: usize) -> u64 {
        self.word(index).load(Ordering::Acquire)
    }

    /// Zero the whole block. Takes `&mut self`: not safe against concurrent
    /// readers or writers.
    pub fn clear(&mut self) {
        unsafe {
            std::ptr::write_bytes(self.words.as_ptr() as *mut u8, 0, self.byte_len());
        }
    }
}

impl Drop for WordBlock {
    fn drop(&mut self) {
        let layout =
            Layout::from_size_align(self.byte_len(), PAGE_BYTES).expect("layout was validated");
        unsafe {
            dealloc(self.words.as_ptr() as *mut u8, layout);
        }
    }
}

// Safety: the block owns its allocation and all shared access is atomic.
unsafe impl Send for WordBlock {}
unsafe impl Sync for WordBlock {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeroed_and_aligned() {
        let block = WordBlock::zeroed(128).unwrap();
        assert_eq!(block.len(), 128);
        assert_eq!(block.words.as_ptr() as usize % PAGE_BYTES, 0);
        for i in 0..block.len() {
            assert_eq!(block.load(i), 0);
        }
    }

    #[test]
    fn test_cas_and_clear() {
        let mut block = WordBlock::zeroed(4).unwrap();
        block
            .word(2)
            .compare_exchange(0, 0xDEAD, Ordering::AcqRel, Ordering::Acquire)
            .unwrap();
        assert_eq!(block.load(2), 0xDEAD);
        block.clear();
        assert_eq!(block.load(2), 0);
    }

    #[test]
    fn test_zero_len_rejected() {
        assert!(WordBlock::zeroed(0).is_err());
    }
}
