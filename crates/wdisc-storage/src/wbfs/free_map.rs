//! Free-block bitmap of a WBFS partition.
//!
//! One bit per data unit, packed into big-endian u32 words. Unit `b`
//! (1-based, unit 0 is the metadata unit and never listed) is bit
//! `(b - 1) % 32` of word `(b - 1) / 32`. A set bit means free.

use std::num::NonZeroU16;

/// In-memory free-block bitmap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeBlockMap {
    words: Vec<u32>,
    /// Number of data units (units 1..=n_units)
    n_units: u32,
}

impl FreeBlockMap {
    /// Bitmap with every one of `n_units` data units free.
    pub fn all_free(n_units: u32) -> Self {
        let mut map = Self {
            words: vec![0; n_units.div_ceil(32) as usize],
            n_units,
        };
        for unit in 1..=n_units {
            map.set(unit, true);
        }
        map
    }

    /// Decode the on-disk bitmap. Bits past `n_units` are ignored.
    pub fn from_bytes(data: &[u8], n_units: u32) -> Self {
        let words_needed = n_units.div_ceil(32) as usize;
        let mut words: Vec<u32> = data
            .chunks_exact(4)
            .take(words_needed)
            .map(|w| u32::from_be_bytes([w[0], w[1], w[2], w[3]]))
            .collect();
        words.resize(words_needed, 0);

        let mut map = Self { words, n_units };
        map.clear_padding();
        map
    }

    /// Encode to `size` bytes (the geometry's bitmap size).
    pub fn to_bytes(&self, size: usize) -> Vec<u8> {
        let mut buf: Vec<u8> = self.words.iter().flat_map(|w| w.to_be_bytes()).collect();
        buf.resize(size.max(buf.len()), 0);
        buf
    }

    fn clear_padding(&mut self) {
        let used_bits = self.n_units % 32;
        if used_bits != 0
            && let Some(last) = self.words.last_mut()
        {
            *last &= (1u32 << used_bits) - 1;
        }
    }

    /// Number of data units covered.
    pub const fn n_units(&self) -> u32 {
        self.n_units
    }

    fn locate(&self, unit: u32) -> Option<(usize, u32)> {
        (1..=self.n_units)
            .contains(&unit)
            .then(|| (((unit - 1) / 32) as usize, (unit - 1) % 32))
    }

    fn set(&mut self, unit: u32, free: bool) -> bool {
        let Some((word, bit)) = self.locate(unit) else {
            return false;
        };
        let mask = 1u32 << bit;
        let was_free = self.words[word] & mask != 0;
        if free {
            self.words[word] |= mask;
        } else {
            self.words[word] &= !mask;
        }
        was_free != free
    }

    /// Whether `unit` is free. Out-of-range units are never free.
    pub fn is_free(&self, unit: u32) -> bool {
        self.locate(unit)
            .is_some_and(|(word, bit)| self.words[word] & (1 << bit) != 0)
    }

    /// First-fit allocation: claim the lowest free unit.
    pub fn alloc(&mut self) -> Option<NonZeroU16> {
        let (index, word) = self.words.iter().enumerate().find(|(_, w)| **w != 0)?;
        let unit = index as u32 * 32 + word.trailing_zeros() + 1;
        let unit = NonZeroU16::new(u16::try_from(unit).ok()?)?;
        self.set(u32::from(unit.get()), false);
        Some(unit)
    }

    /// Claim a specific unit. Returns false if it was not free.
    pub fn claim(&mut self, unit: u32) -> bool {
        self.is_free(unit) && self.set(unit, false)
    }

    /// Release `unit`. Returns false if it was already free or out of range.
    pub fn free(&mut self, unit: NonZeroU16) -> bool {
        self.set(u32::from(unit.get()), true)
    }

    /// Number of free units.
    pub fn count_free(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }
}
