//! Precomputed bit-field descriptors for packed cells.
//!
//! Cells are laid out back to back in bits, so a cell generally starts at an
//! arbitrary bit offset and its fields can straddle machine words. The layout
//! repeats with a period of `block_len` cells spanning `block_word_len` words;
//! this module computes one period of descriptors up front so the hot path
//! only ever indexes into them.
//!
//! Cell anatomy, low bits first:
//! - the large bit (`lb`), set when the cell is an overflow continuation;
//! - the key payload: on a primary cell the biased probe index in the low
//!   `reprobe_len` bits with the residual key above it, on a continuation
//!   cell the probe distance back to its owner only;
//! - the value field (`val_len` bits primary, `lval_len` bits continuation).
//!
//! A key payload that crosses a word boundary reserves the top bit of every
//! word it touches as a set bit (`sb`), claimed with the head word so that
//! readers can classify a cell from a single load. Payloads that fit in one
//! word need no `sb`: a primary payload is never zero (the biased probe index
//! is at least 1) and a continuation flags itself through `lb`.

use crate::status::Status;
use crate::utility::bit_range;

/// Word-sized span of a key payload plus its marker bits.
#[derive(Debug, Clone, Default)]
pub struct KeySpan {
    /// Word offset of the head word, relative to the cell's block.
    pub woff: u32,
    /// Bit offset of the payload inside the head word.
    pub boff: u32,
    /// Payload bits held by the head word when the payload straddles words.
    pub shift: u32,
    /// Head-word mask: large bit, payload bits and `sb_mask1` together.
    pub mask1: u64,
    /// Tail-word mask (payload plus `sb_mask2`), zero when the payload ends
    /// in the head or in a full word.
    pub mask2: u64,
    /// Set bit in the head word; zero for single-word payloads.
    pub sb_mask1: u64,
    /// Set bit in the tail word; zero unless `mask2` is non-zero.
    pub sb_mask2: u64,
    /// Large bit; always in the head word, below `boff`.
    pub lb_mask: u64,
    /// Number of fully-occupied words between head and tail.
    pub full_words: u32,
}

/// Word-sized span of a value field.
#[derive(Debug, Clone, Default)]
pub struct ValSpan {
    /// Word offset of the first word, relative to the cell's block.
    pub woff: u32,
    /// Bit offset of the field inside the first word.
    pub boff: u32,
    /// Field bits held by the first word; equals the field width when the
    /// field does not straddle.
    pub shift: u32,
    /// Field bits held by the second word; zero when `mask2` is zero.
    pub cshift: u32,
    /// First-word mask.
    pub mask1: u64,
    /// Second-word mask, zero when the field fits in one word.
    pub mask2: u64,
}

/// Both interpretations of one in-block cell position.
#[derive(Debug, Clone, Default)]
pub struct CellOffsets {
    /// Primary-cell key descriptor.
    pub key: KeySpan,
    /// Primary-cell value descriptor.
    pub val: ValSpan,
    /// Continuation-cell key descriptor (probe distance only).
    pub lkey: KeySpan,
    /// Continuation-cell value descriptor.
    pub lval: ValSpan,
}

/// One period of cell descriptors plus the block geometry.
#[derive(Debug)]
pub struct OffsetTable {
    key_len: u32,
    val_len: u32,
    lval_len: u32,
    block_len: u32,
    block_word_len: u32,
    /// Unused bits per block (alignment padding).
    pub dead_bits: u32,
    cells: Vec<CellOffsets>,
}

impl OffsetTable {
    /// Compute descriptors for cells of `key_len` payload bits (probe field
    /// included), `val_len` value bits and a `reprobe_len`-bit probe field.
    pub fn new(key_len: u32, val_len: u32, reprobe_len: u32) -> Result<Self, Status> {
        if key_len == 0 || key_len < reprobe_len || key_len > 4096 {
            return Err(Status::InvalidArgument);
        }
        if val_len == 0 || val_len > 64 {
            return Err(Status::InvalidArgument);
        }
        if reprobe_len == 0 || reprobe_len > 62 {
            return Err(Status::InvalidArgument);
        }
        let lval_len = (key_len + val_len - reprobe_len).min(64);

        // Walk cell layouts until the word-alignment state repeats; every
        // prefix of that walk is a candidate block, closed by padding up to
        // the next word boundary. Keep the prefix wasting the fewest bits.
        let mut cells = Vec::new();
        let mut ends = Vec::new();
        let mut seen = [false; 64];
        let mut pos: u64 = 0;
        let mut interior_dead: u32 = 0;
        loop {
            let mut b = (pos % 64) as u32;
            // A cell never starts on the last bit of a word: the large bit
            // must share its word with the head of the key payload.
            if b == 63 {
                pos += 1;
                interior_dead += 1;
                b = 0;
            }
            if !cells.is_empty() && seen[b as usize] {
                break;
            }
            seen[b as usize] = true;
            let (cell, end) = layout_cell(pos, key_len, val_len, reprobe_len, lval_len);
            cells.push(cell);
            pos = end;
            ends.push((cells.len(), pos, interior_dead));
        }
        let mut best = None;
        for &(n, p, di) in &ends {
            let closing = ((64 - p % 64) % 64) as u32;
            let words = (p + closing as u64) / 64;
            let waste = di + closing;
            let frac = waste as f64 / (words * 64) as f64;
            if best.map_or(true, |(bf, _, _, _): (f64, usize, u32, u32)| frac < bf) {
                best = Some((frac, n, words as u32, waste));
            }
        }
        let (_, block_len, block_word_len, dead_bits) = best.ok_or(Status::InvalidArgument)?;
        cells.truncate(block_len);

        Ok(Self {
            key_len,
            val_len,
            lval_len,
            block_len: block_len as u32,
            block_word_len,
            dead_bits,
            cells,
        })
    }

    /// Key payload width in bits (probe field included).
    #[inline]
    pub fn key_len(&self) -> u32 {
        self.key_len
    }

    /// Primary value field width in bits.
    #[inline]
    pub fn val_len(&self) -> u32 {
        self.val_len
    }

    /// Continuation value field width in bits.
    #[inline]
    pub fn lval_len(&self) -> u32 {
        self.lval_len
    }

    /// Cells per block.
    #[inline]
    pub fn block_len(&self) -> u32 {
        self.block_len
    }

    /// Words per block.
    #[inline]
    pub fn block_word_len(&self) -> u32 {
        self.block_word_len
    }

    /// Words needed to back `size` slots.
    pub fn words_for(&self, size: u64) -> usize {
        (size.div_ceil(self.block_len as u64) * self.block_word_len as u64) as usize
    }

    /// Base word of the block containing `id`, and the cell descriptors for
    /// `id`'s position inside that block.
    #[inline]
    pub fn locate(&self, id: u64) -> (usize, &CellOffsets) {
        let block = id / self.block_len as u64;
        let j = (id % self.block_len as u64) as usize;
        (
            (block * self.block_word_len as u64) as usize,
            &self.cells[j],
        )
    }
}

/// Lay out the cell starting at bit `pos`; returns descriptors and the bit
/// position one past the cell.
fn layout_cell(pos: u64, key_len: u32, val_len: u32, reprobe_len: u32, lval_len: u32) -> (CellOffsets, u64) {
    let base_word = pos / 64;
    let b = (pos % 64) as u32;
    debug_assert!(b < 63);

    let (key, key_end) = layout_key(pos, b, base_word, key_len);
    let (val, cell_end) = layout_val(key_end, val_len);
    let (lkey, lkey_end) = layout_key(pos, b, base_word, reprobe_len);
    let (lval, lval_end) = layout_val(lkey_end, lval_len);
    debug_assert!(lval_end <= cell_end);

    // Word offsets are relative to the block, which starts at a word
    // boundary; rebase them when the block builder runs from bit 0.
    (CellOffsets { key, val, lkey, lval }, cell_end)
}

fn layout_key(pos: u64, b: u32, base_word: u64, payload: u32) -> (KeySpan, u64) {
    let boff = b + 1;
    let lb_mask = 1u64 << b;
    if boff + payload <= 64 {
        // Layout 1: large bit and payload share one word.
        let span = KeySpan {
            woff: base_word as u32,
            boff,
            shift: 0,
            mask1: bit_range(b, payload + 1),
            mask2: 0,
            sb_mask1: 0,
            sb_mask2: 0,
            lb_mask,
            full_words: 0,
        };
        (span, pos + 1 + payload as u64)
    } else {
        // Layouts 2 and 3: the head word tops out with a set bit, then any
        // full words (63 payload bits plus their own set bit), then a tail.
        let head = 63 - boff;
        let mut rem = payload - head;
        let full_words = rem / 63;
        rem %= 63;
        let (mask2, sb_mask2, end) = if rem > 0 {
            (
                bit_range(0, rem + 1),
                1u64 << rem,
                (base_word + 1 + full_words as u64) * 64 + rem as u64 + 1,
            )
        } else {
            (0, 0, (base_word + 1 + full_words as u64) * 64)
        };
        let span = KeySpan {
            woff: base_word as u32,
            boff,
            shift: head,
            mask1: bit_range(b, 64 - b),
            mask2,
            sb_mask1: 1u64 << 63,
            sb_mask2,
            lb_mask,
            full_words,
        };
        (span, end)
    }
}

fn layout_val(pos: u64, len: u32) -> (ValSpan, u64) {
    let woff = (pos / 64) as u32;
    let boff = (pos % 64) as u32;
    if boff + len <= 64 {
        let span = ValSpan {
            woff,
            boff,
            shift: len,
            cshift: 0,
            mask1: bit_range(boff, len),
            mask2: 0,
        };
        (span, pos + len as u64)
    } else {
        let head = 64 - boff;
        let tail = len - head;
        let span = ValSpan {
            woff,
            boff,
            shift: head,
            cshift: tail,
            mask1: bit_range(boff, head),
            mask2: bit_range(0, tail),
        };
        (span, (pos / 64 + 1) * 64 + tail as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// OR a mask into a per-word coverage map, failing on overlap.
    fn cover(map: &mut [u64], w: usize, mask: u64) {
        assert_eq!(map[w] & mask, 0, "field overlap in word {w}");
        map[w] |= mask;
    }

    /// Every bit of a block is either covered by exactly one primary-layout
    /// field or accounted for as padding.
    fn check_density(key_len: u32, val_len: u32, reprobe_len: u32) -> OffsetTable {
        let table = OffsetTable::new(key_len, val_len, reprobe_len).unwrap();
        let words = table.block_word_len() as usize;
        let mut map = vec![0u64; words];
        for j in 0..table.block_len() as u64 {
            let (base, cell) = table.locate(j);
            assert_eq!(base, 0);
            let k = &cell.key;
            cover(&mut map, k.woff as usize, k.mask1);
            for i in 0..k.full_words {
                cover(&mut map, (k.woff + 1 + i) as usize, u64::MAX);
            }
            if k.mask2 != 0 {
                cover(&mut map, (k.woff + 1 + k.full_words) as usize, k.mask2);
            }
            let v = &cell.val;
            cover(&mut map, v.woff as usize, v.mask1);
            if v.mask2 != 0 {
                cover(&mut map, (v.woff + 1) as usize, v.mask2);
            }
        }
        let used: u32 = map.iter().map(|w| w.count_ones()).sum();
        assert_eq!(used + table.dead_bits, words as u32 * 64);
        table
    }

    #[test]
    fn test_block_density() {
        for (k, v, r) in [
            (6, 4, 3),
            (7, 2, 3),
            (14, 8, 6),
            (28, 7, 6),
            (92, 4, 6),
            (63, 1, 6),
            (64, 2, 6),
            (65, 3, 6),
            (2, 62, 1),
            (120, 9, 7),
            (31, 13, 5),
            (20, 64, 5),
            (1, 1, 1),
        ] {
            check_density(k, v, r);
        }
    }

    #[test]
    fn test_known_geometries() {
        let t = check_density(6, 4, 3);
        assert_eq!((t.block_len(), t.block_word_len(), t.dead_bits), (23, 4, 1));
        let t = check_density(14, 8, 6);
        assert_eq!((t.block_len(), t.block_word_len(), t.dead_bits), (52, 19, 0));
    }

    #[test]
    fn test_single_word_cell() {
        // 6-bit payload, 4-bit value: first cell occupies bits [0, 11).
        let t = OffsetTable::new(6, 4, 3).unwrap();
        let (_, cell) = t.locate(0);
        assert_eq!(cell.key.lb_mask, 1);
        assert_eq!(cell.key.boff, 1);
        assert_eq!(cell.key.mask1, 0b111_1111);
        assert_eq!(cell.key.sb_mask1, 0);
        assert_eq!(cell.val.boff, 7);
        assert_eq!(cell.val.mask1, 0b1111 << 7);
        // Continuation view: 3-bit probe field, 7-bit value right after.
        assert_eq!(cell.lkey.mask1, 0b1111);
        assert_eq!(t.lval_len(), 7);
        assert_eq!(cell.lval.boff, 4);
        assert_eq!(cell.lval.mask1, 0b111_1111 << 4);
    }

    #[test]
    fn test_straddling_key_reserves_set_bits() {
        // 92-bit payload: the head word is followed by a full word and a tail.
        let t = OffsetTable::new(92, 4, 6).unwrap();
        let mut saw_straddle = false;
        for j in 0..t.block_len() as u64 {
            let (_, cell) = t.locate(j);
            let k = &cell.key;
            if k.sb_mask1 != 0 {
                saw_straddle = true;
                assert_eq!(k.sb_mask1, 1u64 << 63);
                assert_eq!(k.mask1, bit_range(k.boff - 1, 64 - (k.boff - 1)));
                // head + full + tail payload bits add up.
                let tail = if k.mask2 != 0 {
                    k.mask2.count_ones() - 1
                } else {
                    0
                };
                assert_eq!(k.shift + k.full_words * 63 + tail, 92);
                if k.mask2 != 0 {
                    assert_eq!(k.sb_mask2, 1 << (k.mask2.count_ones() - 1));
                }
            }
        }
        assert!(saw_straddle);
    }

    #[test]
    fn test_locate_across_blocks() {
        let t = OffsetTable::new(6, 4, 3).unwrap();
        let bl = t.block_len() as u64;
        let (base0, _) = t.locate(3);
        assert_eq!(base0, 0);
        let (base1, _) = t.locate(bl + 3);
        assert_eq!(base1, t.block_word_len() as usize);
        assert_eq!(t.words_for(256), 256usize.div_ceil(bl as usize) * t.block_word_len() as usize);
    }

    #[test]
    fn test_rejects_bad_geometry() {
        assert!(OffsetTable::new(0, 4, 1).is_err());
        assert!(OffsetTable::new(6, 0, 3).is_err());
        assert!(OffsetTable::new(6, 65, 3).is_err());
        assert!(OffsetTable::new(6, 4, 0).is_err());
        assert!(OffsetTable::new(6, 4, 63).is_err());
        assert!(OffsetTable::new(4, 4, 6).is_err());
    }
}
