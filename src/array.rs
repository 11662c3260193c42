//! The lock-free counting hash array.
//!
//! An open-addressing table of `2^lsize` bit-packed cells. A key is hashed
//! through an invertible GF(2) matrix; the low `lsize` bits of the product
//! pick the starting slot and are never stored, the rest of the key (plus the
//! biased probe index) is published into the claimed cell with word-sized
//! compare-and-swap. Counters grow past their field width by claiming
//! continuation cells along the same probe schedule.
//!
//! All operations other than `clear` take `&self` and are safe to call from
//! any number of threads.

use std::marker::PhantomData;
use std::sync::atomic::Ordering;

use rand::RngCore;

use crate::block::WordBlock;
use crate::config::ArrayConfig;
use crate::iter::SlotIter;
use crate::key::BitKey;
use crate::matrix::BinaryMatrix;
use crate::offsets::{CellOffsets, KeySpan, OffsetTable, ValSpan};
use crate::reprobe::{ReprobeLimit, QUADRATIC_REPROBES};
use crate::status::Status;
use crate::utility::{ceil_log2, low_bits, slice_bounds};

/// Result of a successful `add` or `set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotClaim {
    /// True when this call created the entry (exactly one concurrent claimer
    /// of a new key observes `true`).
    pub inserted_new: bool,
    /// Slot id of the key's primary cell.
    pub slot: u64,
}

/// Classification of a slot as seen by a reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CellState {
    /// Nothing published here yet.
    Empty,
    /// Continuation cell of some overflow chain.
    Continuation,
    /// Primary cell; the biased probe index was decoded.
    Claimed,
    /// Set bit visible but the payload is not fully published (or belongs to
    /// an in-flight claim). Readers treat this as a mismatch and move on.
    NotReady,
}

/// Lock-free counting hash array over keys of type `K`.
pub struct CountingArray<K: BitKey> {
    lsize: u32,
    size: u64,
    size_mask: u64,
    key_len: u16,
    raw_key_len: u32,
    limit: ReprobeLimit,
    reprobes: Vec<u64>,
    offsets: OffsetTable,
    block: WordBlock,
    hash_matrix: BinaryMatrix,
    hash_inverse_matrix: BinaryMatrix,
    _key: PhantomData<fn() -> K>,
}

impl<K: BitKey> CountingArray<K> {
    /// Create an array from `config` with the default quadratic reprobe
    /// schedule and operating-system entropy.
    pub fn new(config: &ArrayConfig) -> Result<Self, Status> {
        Self::with_schedule(config, &QUADRATIC_REPROBES, &mut rand::rng())
    }

    /// Create an array with a caller-supplied entropy source, for
    /// reproducible hash matrices.
    pub fn with_rng(config: &ArrayConfig, rng: &mut impl RngCore) -> Result<Self, Status> {
        Self::with_schedule(config, &QUADRATIC_REPROBES, rng)
    }

    /// Create an array with a caller-supplied reprobe schedule and entropy
    /// source. The schedule must be non-decreasing with `schedule[0] >= 1`.
    pub fn with_schedule(
        config: &ArrayConfig,
        schedule: &[u64],
        rng: &mut impl RngCore,
    ) -> Result<Self, Status> {
        if config.size < 2 {
            return Err(Status::InvalidArgument);
        }
        let lsize = ceil_log2(config.size);
        if lsize > 62 {
            return Err(Status::InvalidArgument);
        }
        let size = 1u64 << lsize;
        let key_len = config.key_bits;
        if key_len == 0 || (key_len as u32) < lsize {
            return Err(Status::InvalidArgument);
        }
        let limit = ReprobeLimit::new(config.max_reprobe, schedule, lsize)?;
        if limit.limit() < config.max_reprobe {
            tracing::warn!(
                requested = config.max_reprobe,
                effective = limit.limit(),
                size,
                "reprobe limit capped for table size"
            );
        }
        let raw_key_len = key_len as u32 - lsize;
        let offsets = OffsetTable::new(
            raw_key_len + limit.reprobe_len(),
            config.counter_bits as u32,
            limit.reprobe_len(),
        )?;
        let block = WordBlock::zeroed(offsets.words_for(size))?;
        let (hash_matrix, hash_inverse_matrix) =
            BinaryMatrix::randomize_invertible(lsize, key_len, rng);
        tracing::debug!(
            size,
            lsize,
            key_len,
            val_len = offsets.val_len(),
            reprobe_limit = limit.limit(),
            block_len = offsets.block_len(),
            block_word_len = offsets.block_word_len(),
            bytes = block.byte_len(),
            "counting array initialized"
        );
        Ok(Self {
            lsize,
            size,
            size_mask: size - 1,
            key_len,
            raw_key_len,
            limit,
            reprobes: schedule.to_vec(),
            offsets,
            block,
            hash_matrix,
            hash_inverse_matrix,
            _key: PhantomData,
        })
    }

    /// Number of slots (always a power of two).
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Log2 of the number of slots.
    #[inline]
    pub fn lsize(&self) -> u32 {
        self.lsize
    }

    /// Mask for reducing hashes to slot ids.
    #[inline]
    pub fn size_mask(&self) -> u64 {
        self.size_mask
    }

    /// Key length in bits.
    #[inline]
    pub fn key_len(&self) -> u16 {
        self.key_len
    }

    /// Primary counter field width in bits.
    #[inline]
    pub fn val_len(&self) -> u32 {
        self.offsets.val_len()
    }

    /// Continuation counter field width in bits.
    #[inline]
    pub fn lval_len(&self) -> u32 {
        self.offsets.lval_len()
    }

    /// Effective reprobe limit (possibly capped below the requested one).
    #[inline]
    pub fn max_reprobe(&self) -> u16 {
        self.limit.limit()
    }

    /// Largest probe displacement in use.
    #[inline]
    pub fn max_reprobe_offset(&self) -> u64 {
        self.reprobes[self.limit.limit() as usize]
    }

    /// The hash matrix.
    #[inline]
    pub fn matrix(&self) -> &BinaryMatrix {
        &self.hash_matrix
    }

    /// The pseudo-inverse used to reconstruct keys from slot ids.
    #[inline]
    pub fn inverse_matrix(&self) -> &BinaryMatrix {
        &self.hash_inverse_matrix
    }

    /// Increment the count of `key` by `delta` (`delta > 0`).
    ///
    /// Returns where the primary cell lives and whether this call created it.
    /// On `Status::TableFull` the visible count of `key` is unchanged: the
    /// primary addition is rolled back modulo the field width. A carry
    /// already parked in an earlier continuation cell is not unwound.
    pub fn add(&self, key: &K, delta: u64) -> Result<SlotClaim, Status> {
        if delta == 0 {
            return Err(Status::InvalidArgument);
        }
        debug_assert_eq!(key.bit_len(), self.key_len);
        let slot = self.hash_slot(key);
        let (inserted_new, primary, cell, base) = self.claim_key(key, slot)?;
        let mut carry = self.accumulate(base, &cell.val, delta);
        let mut cur = primary;
        while carry != 0 {
            match self.claim_continuation(cur) {
                Ok((cid, ccell, cbase)) => {
                    carry = self.accumulate(cbase, &ccell.lval, carry);
                    cur = cid;
                }
                Err(status) => {
                    let neg = delta.wrapping_neg() & self.val_field_mask();
                    self.accumulate(base, &cell.val, neg);
                    return Err(status);
                }
            }
        }
        Ok(SlotClaim {
            inserted_new,
            slot: primary,
        })
    }

    /// Mark `key` present without touching its counter.
    pub fn set(&self, key: &K) -> Result<SlotClaim, Status> {
        debug_assert_eq!(key.bit_len(), self.key_len);
        let slot = self.hash_slot(key);
        let (inserted_new, cid, _, _) = self.claim_key(key, slot)?;
        Ok(SlotClaim {
            inserted_new,
            slot: cid,
        })
    }

    /// Total count of `key` across its primary cell and overflow chain, or
    /// `None` when the key is absent.
    pub fn get(&self, key: &K) -> Option<u64> {
        debug_assert_eq!(key.bit_len(), self.key_len);
        let mut tmp = K::zero(self.key_len);
        let id = self.find_slot(key, &mut tmp)?;
        Some(self.resolved_value(id))
    }

    /// Slot id of `key`'s primary cell, or `None` when absent.
    pub fn get_key_id(&self, key: &K) -> Option<u64> {
        debug_assert_eq!(key.bit_len(), self.key_len);
        let mut tmp = K::zero(self.key_len);
        self.find_slot(key, &mut tmp)
    }

    /// Zero every cell. Not safe against concurrent operations, which the
    /// `&mut self` receiver enforces.
    pub fn clear(&mut self) {
        self.block.clear();
    }

    /// Iterate over all entries as `(key, resolved count)` pairs.
    pub fn iter_all(&self) -> SlotIter<'_, K> {
        SlotIter::new(self, 0, self.size)
    }

    /// Iterate over the `index`-th of `pieces` contiguous slot slices.
    pub fn iter_slice(&self, index: u64, pieces: u64) -> SlotIter<'_, K> {
        let (start, end) = slice_bounds(index, pieces.max(1), self.size);
        SlotIter::new(self, start, end)
    }

    #[inline]
    fn hash_slot(&self, key: &K) -> u64 {
        self.hash_matrix.times(key) & self.size_mask
    }

    #[inline]
    fn val_field_mask(&self) -> u64 {
        let vlen = self.offsets.val_len();
        if vlen == 64 {
            u64::MAX
        } else {
            low_bits(vlen)
        }
    }

    /// Bits `[pos, pos + n)` of a primary key payload: the biased probe index
    /// in the low `reprobe_len` bits, the residual key above it. `n < 64`.
    fn payload_bits(&self, key: &K, biased: u64, pos: u32, n: u32) -> u64 {
        let rlen = self.limit.reprobe_len();
        let mut out = 0u64;
        if pos < rlen {
            out = (biased >> pos) & low_bits(n.min(rlen - pos));
        }
        if pos + n > rlen {
            let shift = rlen.saturating_sub(pos);
            let kstart = pos.saturating_sub(rlen);
            let take = n - shift;
            out |= key.get_bits((self.lsize + kstart) as u16, take as u16) << shift;
        }
        out
    }

    /// Publish `nkey` into one word. Succeeds when the bits under `free_mask`
    /// are all clear (fresh claim, `is_new` set) or the bits under
    /// `equal_mask` already equal `nkey` (same key re-claimed).
    fn publish_word(
        &self,
        widx: usize,
        nkey: u64,
        free_mask: u64,
        equal_mask: u64,
        is_new: &mut bool,
    ) -> bool {
        let w = self.block.word(widx);
        let mut cur = w.load(Ordering::Acquire);
        loop {
            if cur & free_mask == 0 {
                match w.compare_exchange(cur, cur | nkey, Ordering::AcqRel, Ordering::Acquire) {
                    Ok(_) => {
                        *is_new = true;
                        return true;
                    }
                    Err(seen) => {
                        cur = seen;
                        continue;
                    }
                }
            }
            *is_new = false;
            return (cur & equal_mask) == nkey;
        }
    }

    /// Walk the probe schedule from `slot` and claim a primary cell for
    /// `key`. Returns `(inserted_new, slot id, cell descriptors, block base)`.
    fn claim_key(&self, key: &K, slot: u64) -> Result<(bool, u64, &CellOffsets, usize), Status> {
        let klen = self.offsets.key_len();
        let mut is_new = false;
        for r in 0..=self.limit.limit() as u64 {
            let cid = (slot + self.reprobes[r as usize]) & self.size_mask;
            let (base, cell) = self.offsets.locate(cid);
            let k = &cell.key;
            let biased = r + 1;
            let claimed = if k.sb_mask1 == 0 {
                let nkey = (self.payload_bits(key, biased, 0, klen) << k.boff) & k.mask1;
                self.publish_word(base + k.woff as usize, nkey, k.mask1, k.mask1, &mut is_new)
            } else {
                self.claim_split_key(key, biased, base, k, &mut is_new)
            };
            if claimed {
                return Ok((is_new, cid, cell, base));
            }
        }
        Err(Status::TableFull)
    }

    /// Claim a key whose payload straddles words: head word with its set bit
    /// first, then the body, so readers that see an incomplete body fail the
    /// key comparison and move on.
    fn claim_split_key(
        &self,
        key: &K,
        biased: u64,
        base: usize,
        k: &KeySpan,
        is_new: &mut bool,
    ) -> bool {
        let klen = self.offsets.key_len();
        let head = ((self.payload_bits(key, biased, 0, k.shift) << k.boff) | k.sb_mask1) & k.mask1;
        if !self.publish_word(base + k.woff as usize, head, k.mask1, k.mask1, is_new) {
            return false;
        }
        let mut pos = k.shift;
        for i in 0..k.full_words {
            let body = self.payload_bits(key, biased, pos, 63) | (1u64 << 63);
            pos += 63;
            if !self.publish_word(
                base + (k.woff + 1 + i) as usize,
                body,
                u64::MAX,
                u64::MAX,
                is_new,
            ) {
                return false;
            }
        }
        if k.mask2 != 0 {
            let tail = (self.payload_bits(key, biased, pos, klen - pos) | k.sb_mask2) & k.mask2;
            if !self.publish_word(
                base + (k.woff + 1 + k.full_words) as usize,
                tail,
                k.mask2,
                k.mask2,
                is_new,
            ) {
                return false;
            }
        }
        true
    }

    /// Claim a continuation cell for the chain hanging off `from`. The cell
    /// stores only the probe distance from the chain's walk start and has its
    /// large bit set.
    fn claim_continuation(&self, from: u64) -> Result<(u64, &CellOffsets, usize), Status> {
        let start = (from + self.reprobes[0]) & self.size_mask;
        for r in 0..=self.limit.limit() as u64 {
            let cid = (start + self.reprobes[r as usize]) & self.size_mask;
            let (base, cell) = self.offsets.locate(cid);
            let (k, lk) = (&cell.key, &cell.lkey);
            let mut is_new = false;
            // Freedom is judged on the primary mask, the wider of the two.
            let claimed = if lk.sb_mask1 == 0 {
                let nkey = ((r << lk.boff) | lk.lb_mask) & lk.mask1;
                self.publish_word(base + lk.woff as usize, nkey, k.mask1, lk.mask1, &mut is_new)
            } else {
                let head =
                    (((r & low_bits(lk.shift)) << lk.boff) | lk.sb_mask1 | lk.lb_mask) & lk.mask1;
                let free2 = if k.full_words > 0 { u64::MAX } else { k.mask2 };
                self.publish_word(base + lk.woff as usize, head, k.mask1, lk.mask1, &mut is_new)
                    && {
                        let tail = ((r >> lk.shift) | lk.sb_mask2) & lk.mask2;
                        self.publish_word(
                            base + lk.woff as usize + 1,
                            tail,
                            free2,
                            lk.mask2,
                            &mut is_new,
                        )
                    }
            };
            if claimed {
                return Ok((cid, cell, base));
            }
        }
        Err(Status::TableFull)
    }

    /// CAS-add into the bits of one word selected by `mask`; returns the full
    /// unmasked sum so the caller can extract the carry.
    fn cas_field_add(&self, widx: usize, add: u64, boff: u32, mask: u64) -> u64 {
        let w = self.block.word(widx);
        let mut cur = w.load(Ordering::Acquire);
        loop {
            let field = (cur & mask) >> boff;
            let sum = field.wrapping_add(add);
            let next = (cur & !mask) | ((sum << boff) & mask);
            match w.compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return sum,
                Err(seen) => cur = seen,
            }
        }
    }

    /// Add into a (possibly split) value field; returns the carry out of the
    /// field.
    fn accumulate(&self, base: usize, v: &ValSpan, add: u64) -> u64 {
        let sum = self.cas_field_add(base + v.woff as usize, add, v.boff, v.mask1);
        let mut carry = if v.shift < 64 { sum >> v.shift } else { 0 };
        if v.mask2 != 0 && carry != 0 {
            let sum2 = self.cas_field_add(base + v.woff as usize + 1, carry, 0, v.mask2);
            carry = if v.cshift < 64 { sum2 >> v.cshift } else { 0 };
        }
        carry
    }

    /// Read a (possibly split) value field.
    fn read_field(&self, base: usize, v: &ValSpan) -> u64 {
        let mut out = (self.block.load(base + v.woff as usize) & v.mask1) >> v.boff;
        if v.mask2 != 0 {
            out |= (self.block.load(base + v.woff as usize + 1) & v.mask2) << v.shift;
        }
        out
    }

    /// Classify the cell at `id`. For a claimed primary cell, `key_out`
    /// receives the residual key bits and the recovered origin slot in its
    /// low bits; the caller still has to run the inverse matrix (iteration)
    /// or substitute the probe key's low bits (lookup).
    pub(crate) fn read_cell(&self, id: u64, key_out: &mut K) -> CellState {
        let (base, cell) = self.offsets.locate(id);
        let k = &cell.key;
        let w1 = self.block.load(base + k.woff as usize);
        if w1 & k.lb_mask != 0 {
            return CellState::Continuation;
        }
        let rlen = self.limit.reprobe_len();
        let klen = self.offsets.key_len();
        let mut biased = 0u64;
        if k.sb_mask1 == 0 {
            let payload = (w1 & k.mask1) >> k.boff;
            if payload == 0 {
                return CellState::Empty;
            }
            biased = payload & self.limit.reprobe_mask();
            if self.raw_key_len > 0 {
                key_out.set_bits(
                    self.lsize as u16,
                    self.raw_key_len as u16,
                    payload >> rlen,
                );
            }
        } else {
            if w1 & k.sb_mask1 == 0 {
                return CellState::Empty;
            }
            let head = (w1 & k.mask1 & !k.sb_mask1) >> k.boff;
            self.absorb_payload(key_out, &mut biased, 0, head, k.shift);
            let mut pos = k.shift;
            for i in 0..k.full_words {
                let w = self.block.load(base + (k.woff + 1 + i) as usize);
                self.absorb_payload(key_out, &mut biased, pos, w & !(1u64 << 63), 63);
                pos += 63;
            }
            if k.mask2 != 0 {
                let w = self.block.load(base + (k.woff + 1 + k.full_words) as usize);
                self.absorb_payload(key_out, &mut biased, pos, w & k.mask2 & !k.sb_mask2, klen - pos);
            }
        }
        if biased == 0 || biased > self.limit.limit() as u64 + 1 {
            // Body words not published yet; never index the schedule with a
            // torn probe value.
            return CellState::NotReady;
        }
        let origin = id.wrapping_sub(self.reprobes[(biased - 1) as usize]) & self.size_mask;
        key_out.set_bits(0, self.lsize as u16, origin);
        CellState::Claimed
    }

    /// Merge `n` payload bits (starting at payload position `pos`) into the
    /// biased probe index and the residual key bits of `key_out`.
    fn absorb_payload(&self, key_out: &mut K, biased: &mut u64, pos: u32, bits: u64, n: u32) {
        let rlen = self.limit.reprobe_len();
        if pos < rlen {
            *biased |= (bits & low_bits(n.min(rlen - pos))) << pos;
        }
        if pos + n > rlen {
            let shift = rlen.saturating_sub(pos);
            let kstart = pos.saturating_sub(rlen);
            key_out.set_bits(
                (self.lsize + kstart) as u16,
                (n - shift) as u16,
                bits >> shift,
            );
        }
    }

    /// Find the primary slot of `key`, reusing `tmp` as scratch.
    fn find_slot(&self, key: &K, tmp: &mut K) -> Option<u64> {
        let slot = self.hash_slot(key);
        for r in 0..=self.limit.limit() as u64 {
            let cid = (slot + self.reprobes[r as usize]) & self.size_mask;
            match self.read_cell(cid, tmp) {
                CellState::Empty => return None,
                CellState::Continuation | CellState::NotReady => continue,
                CellState::Claimed => {
                    if tmp.get_bits(0, self.lsize as u16) != slot {
                        continue;
                    }
                    tmp.set_bits(0, self.lsize as u16, key.get_bits(0, self.lsize as u16));
                    if &*tmp == key {
                        return Some(cid);
                    }
                }
            }
        }
        None
    }

    /// Sum a primary cell's count with every continuation cell of its chain.
    pub(crate) fn resolved_value(&self, id: u64) -> u64 {
        let (base, cell) = self.offsets.locate(id);
        let mut total = self.read_field(base, &cell.val);
        let mut shift = self.offsets.val_len();
        let lvlen = self.offsets.lval_len();
        let mut cur = id;
        'levels: loop {
            if shift >= 64 {
                // Deeper levels would contribute multiples of 2^64.
                break;
            }
            let start = (cur + self.reprobes[0]) & self.size_mask;
            for r in 0..=self.limit.limit() as u64 {
                let cid = (start + self.reprobes[r as usize]) & self.size_mask;
                let (cbase, ccell) = self.offsets.locate(cid);
                let lk = &ccell.lkey;
                let w1 = self.block.load(cbase + lk.woff as usize);
                if w1 & lk.lb_mask != 0 {
                    let mut stored = (w1 & lk.mask1 & !lk.sb_mask1) >> lk.boff;
                    if lk.sb_mask1 != 0 && lk.mask2 != 0 {
                        let w2 = self.block.load(cbase + lk.woff as usize + 1);
                        stored |= (w2 & lk.mask2 & !lk.sb_mask2) << lk.shift;
                    }
                    if stored == r {
                        let v = self.read_field(cbase, &ccell.lval);
                        total = total.wrapping_add(v << shift);
                        shift += lvlen;
                        cur = cid;
                        continue 'levels;
                    }
                } else if w1 & ccell.key.mask1 == 0 {
                    // An unclaimed slot ends the chain.
                    break 'levels;
                }
            }
            break;
        }
        total
    }
}
