use byteorder::{ByteOrder, LittleEndian};

use crate::allocators::{AllocError, Result};

//----------------------------------------------------------------

const WORD_BITS: u64 = 64;
const WORD_BYTES: u64 = 8;

fn div_up(n: u64, divisor: u64) -> u64 {
    (n + divisor - 1) / divisor
}

/// Number of bytes the on-disk image of a bitmap with `nr_bits` bits
/// occupies.  Always a whole number of little endian u64 words.
pub fn image_len(nr_bits: u64) -> u64 {
    div_up(nr_bits, WORD_BITS) * WORD_BYTES
}

/// Mask with bits [b, e) of a single word set, 0 <= b < e <= 64.
fn word_mask(b: u64, e: u64) -> u64 {
    debug_assert!(b < e && e <= WORD_BITS);
    let high = if e == WORD_BITS {
        u64::MAX
    } else {
        (1u64 << e) - 1
    };
    high & !((1u64 << b) - 1)
}

//----------------------------------------------------------------

/// A growable bit vector.  Bits beyond `nr_bits` in the last word are
/// always zero.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Bitmap {
    nr_bits: u64,
    nr_set: u64,
    words: Vec<u64>,
}

impl Bitmap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn zeroes(nr_bits: u64) -> Result<Self> {
        let mut bm = Self::new();
        bm.grow(nr_bits)?;
        Ok(bm)
    }

    /// Builds a bitmap from its on-disk image, as produced by `to_bytes()`.
    pub fn from_bytes(nr_bits: u64, data: &[u8]) -> Result<Self> {
        if data.len() as u64 != image_len(nr_bits) {
            return Err(AllocError::Corrupt(format!(
                "bitmap image is {} bytes, expected {} for {} bits",
                data.len(),
                image_len(nr_bits),
                nr_bits
            )));
        }

        let nr_words = data.len() / WORD_BYTES as usize;
        let mut words = Vec::new();
        words
            .try_reserve_exact(nr_words)
            .map_err(|_| AllocError::NoMemory)?;
        words.extend(data.chunks_exact(WORD_BYTES as usize).map(LittleEndian::read_u64));

        // Anything past the end is junk.
        let tail = nr_bits % WORD_BITS;
        if tail != 0 {
            if let Some(last) = words.last_mut() {
                *last &= word_mask(0, tail);
            }
        }

        let nr_set = words.iter().map(|w| w.count_ones() as u64).sum();
        Ok(Self {
            nr_bits,
            nr_set,
            words,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.words.len() * WORD_BYTES as usize);
        for w in &self.words {
            out.extend_from_slice(&w.to_le_bytes());
        }
        out
    }

    pub fn len(&self) -> u64 {
        self.nr_bits
    }

    pub fn is_empty(&self) -> bool {
        self.nr_bits == 0
    }

    pub fn count_ones(&self) -> u64 {
        self.nr_set
    }

    pub fn count_zeroes(&self) -> u64 {
        self.nr_bits - self.nr_set
    }

    /// Extends the bitmap to `nr_bits`, new bits are zero.  Shrinking is
    /// not supported.
    pub fn grow(&mut self, nr_bits: u64) -> Result<()> {
        assert!(nr_bits >= self.nr_bits, "bitmaps never shrink");

        let nr_words = div_up(nr_bits, WORD_BITS) as usize;
        if nr_words > self.words.len() {
            self.words
                .try_reserve_exact(nr_words - self.words.len())
                .map_err(|_| AllocError::NoMemory)?;
            self.words.resize(nr_words, 0);
        }
        self.nr_bits = nr_bits;
        Ok(())
    }

    pub fn get(&self, bit: u64) -> bool {
        if bit >= self.nr_bits {
            return false;
        }
        let w = self.words[(bit / WORD_BITS) as usize];
        (w & (1u64 << (bit % WORD_BITS))) != 0
    }

    /// Sets bits [b, e).
    pub fn set_range(&mut self, b: u64, e: u64) {
        self.update_range(b, e, |w, mask| w | mask);
    }

    /// Clears bits [b, e).
    pub fn clear_range(&mut self, b: u64, e: u64) {
        self.update_range(b, e, |w, mask| w & !mask);
    }

    fn update_range<F: Fn(u64, u64) -> u64>(&mut self, b: u64, e: u64, op: F) {
        assert!(b < e && e <= self.nr_bits, "Invalid range");

        let mut bit = b;
        while bit < e {
            let idx = (bit / WORD_BITS) as usize;
            let word_begin = bit % WORD_BITS;
            let word_end = (e - (bit - word_begin)).min(WORD_BITS);
            let mask = word_mask(word_begin, word_end);

            let old = self.words[idx];
            let new = op(old, mask);
            self.words[idx] = new;
            self.nr_set = self.nr_set + new.count_ones() as u64 - old.count_ones() as u64;

            bit += word_end - word_begin;
        }
    }

    /// Finds the lowest bit >= `begin` whose value is `set`.
    fn find_next(&self, begin: u64, set: bool) -> Option<u64> {
        if begin >= self.nr_bits {
            return None;
        }

        let mut idx = (begin / WORD_BITS) as usize;
        let mut below = word_mask(0, begin % WORD_BITS + 1) >> 1;
        while idx < self.words.len() {
            // Normalise so we're always looking for a one.
            let w = if set { self.words[idx] } else { !self.words[idx] };
            let w = w & !below;
            if w != 0 {
                let bit = idx as u64 * WORD_BITS + w.trailing_zeros() as u64;
                return if bit < self.nr_bits { Some(bit) } else { None };
            }
            below = 0;
            idx += 1;
        }
        None
    }

    pub fn find_first_zero(&self, begin: u64) -> Option<u64> {
        self.find_next(begin, false)
    }

    pub fn find_first_set(&self, begin: u64) -> Option<u64> {
        self.find_next(begin, true)
    }

    /// Iterates the runs of set bits as half open [begin, end) pairs.
    pub fn set_runs(&self) -> SetRunIterator<'_> {
        self.set_runs_from(0)
    }

    /// As `set_runs()`, ignoring bits below `begin`.
    pub fn set_runs_from(&self, begin: u64) -> SetRunIterator<'_> {
        SetRunIterator::new(self, begin)
    }
}

//----------------------------------------------------------------

pub struct SetRunIterator<'a> {
    bitmap: &'a Bitmap,
    current_position: u64,
}

impl<'a> SetRunIterator<'a> {
    fn new(bitmap: &'a Bitmap, begin: u64) -> Self {
        SetRunIterator {
            bitmap,
            current_position: begin,
        }
    }
}

impl<'a> Iterator for SetRunIterator<'a> {
    type Item = (u64, u64);

    fn next(&mut self) -> Option<Self::Item> {
        let begin = self.bitmap.find_first_set(self.current_position)?;
        let end = self
            .bitmap
            .find_first_zero(begin)
            .unwrap_or(self.bitmap.nr_bits);
        self.current_position = end;
        Some((begin, end))
    }
}

//----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn test_word_mask() {
        assert_eq!(word_mask(0, 64), u64::MAX);
        assert_eq!(word_mask(0, 1), 1);
        assert_eq!(word_mask(60, 64), 0xFu64 << 60);
        assert_eq!(word_mask(4, 8), 0xF0);
    }

    #[test]
    fn test_grow_zero_fills() -> anyhow::Result<()> {
        let mut bm = Bitmap::zeroes(10)?;
        bm.set_range(0, 10);
        bm.grow(100)?;
        assert_eq!(bm.len(), 100);
        assert_eq!(bm.count_ones(), 10);
        for bit in 10..100 {
            assert!(!bm.get(bit));
        }
        Ok(())
    }

    #[test]
    #[should_panic(expected = "bitmaps never shrink")]
    fn test_shrink_panics() {
        let mut bm = Bitmap::zeroes(100).unwrap();
        let _ = bm.grow(10);
    }

    #[test]
    fn test_set_clear_across_words() -> anyhow::Result<()> {
        let mut bm = Bitmap::zeroes(256)?;
        bm.set_range(60, 200);
        assert_eq!(bm.count_ones(), 140);
        assert!(!bm.get(59));
        assert!(bm.get(60));
        assert!(bm.get(199));
        assert!(!bm.get(200));
        assert_eq!(bm.words[1], u64::MAX);

        bm.clear_range(64, 128);
        assert_eq!(bm.count_ones(), 76);
        assert_eq!(bm.words[1], 0);

        // Setting bits that are already set doesn't change the count.
        bm.set_range(60, 64);
        assert_eq!(bm.count_ones(), 76);
        Ok(())
    }

    #[test]
    #[should_panic(expected = "Invalid range")]
    fn test_range_past_end_panics() {
        let mut bm = Bitmap::zeroes(10).unwrap();
        bm.set_range(5, 11);
    }

    #[test]
    fn test_find_first_zero() -> anyhow::Result<()> {
        let mut bm = Bitmap::zeroes(130)?;
        assert_eq!(bm.find_first_zero(0), Some(0));
        bm.set_range(0, 129);
        assert_eq!(bm.find_first_zero(0), Some(129));
        assert_eq!(bm.find_first_zero(129), Some(129));
        bm.set_range(129, 130);
        assert_eq!(bm.find_first_zero(0), None);
        bm.clear_range(70, 71);
        assert_eq!(bm.find_first_zero(3), Some(70));
        assert_eq!(bm.find_first_zero(71), None);
        assert_eq!(bm.find_first_zero(500), None);
        Ok(())
    }

    #[test]
    fn test_find_first_set_skips_tail() -> anyhow::Result<()> {
        let bm = Bitmap::zeroes(70)?;
        assert_eq!(bm.find_first_set(0), None);
        Ok(())
    }

    #[test]
    fn test_set_runs() -> anyhow::Result<()> {
        let mut bm = Bitmap::zeroes(128)?;
        bm.set_range(10, 20);
        bm.set_range(50, 60);
        bm.set_range(64, 96);
        bm.set_range(127, 128);

        let runs: Vec<(u64, u64)> = bm.set_runs().collect();
        assert_eq!(runs, vec![(10, 20), (50, 60), (64, 96), (127, 128)]);
        Ok(())
    }

    #[test]
    fn test_image() -> anyhow::Result<()> {
        let mut bm = Bitmap::zeroes(100)?;
        bm.set_range(3, 4);
        bm.set_range(64, 72);

        let bytes = bm.to_bytes();
        assert_eq!(bytes.len() as u64, image_len(100));
        assert_eq!(bytes[0], 0x08);
        assert_eq!(bytes[8], 0xFF);
        assert_eq!(bytes[9], 0x00);

        let copy = Bitmap::from_bytes(100, &bytes)?;
        assert_eq!(copy, bm);
        Ok(())
    }

    #[test]
    fn test_from_bytes_masks_tail() -> anyhow::Result<()> {
        let bytes = vec![0xFF; 8];
        let bm = Bitmap::from_bytes(4, &bytes)?;
        assert_eq!(bm.count_ones(), 4);
        assert_eq!(bm.find_first_zero(0), None);
        Ok(())
    }

    #[test]
    fn test_from_bytes_bad_len() {
        assert!(matches!(
            Bitmap::from_bytes(100, &[0u8; 8]),
            Err(AllocError::Corrupt(_))
        ));
    }
}

//----------------------------------------------------------------
