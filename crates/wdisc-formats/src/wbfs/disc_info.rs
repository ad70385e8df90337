//! Per-disc info block: header copy plus indirection table.
//!
//! | Offset | Size      | Field |
//! |--------|-----------|-------|
//! | 0x000  | 0x100     | Disc header copy |
//! | 0x100  | 2 × units | Physical unit per virtual unit (BE u16, 0 = hole) |
//!
//! The block is padded with zeros to a host sector multiple.

use crate::disc_header::{DISC_HEADER_SIZE, DiscHeader};
use crate::error::{FormatError, ensure_len};
use std::num::NonZeroU16;

/// On-disk value of a hole entry.
pub const HOLE_SENTINEL: u16 = 0;

/// Decoded disc-info block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscInfo {
    /// Copy of the disc's leading 256 bytes
    pub header: DiscHeader,
    /// Physical unit per virtual unit, `None` for holes
    pub table: Vec<Option<NonZeroU16>>,
}

impl DiscInfo {
    /// Empty info block (every entry a hole).
    pub fn new(header: DiscHeader, units_per_disc: u32) -> Self {
        Self {
            header,
            table: vec![None; units_per_disc as usize],
        }
    }

    /// Parse an info block holding `units_per_disc` entries.
    pub fn decode(data: &[u8], units_per_disc: u32) -> Result<Self, FormatError> {
        let units = units_per_disc as usize;
        ensure_len("WBFS disc info", data, DISC_HEADER_SIZE + units * 2)?;

        let header = DiscHeader::from_bytes(&data[..DISC_HEADER_SIZE])?;
        let table = data[DISC_HEADER_SIZE..DISC_HEADER_SIZE + units * 2]
            .chunks_exact(2)
            .map(|pair| NonZeroU16::new(u16::from_be_bytes([pair[0], pair[1]])))
            .collect();

        Ok(Self { header, table })
    }

    /// Serialize to `block_size` bytes (the geometry's disc-info size).
    pub fn encode(&self, block_size: usize) -> Vec<u8> {
        let mut buf = Vec::with_capacity(block_size);
        buf.extend_from_slice(self.header.as_bytes());
        for entry in &self.table {
            let raw = entry.map_or(HOLE_SENTINEL, NonZeroU16::get);
            buf.extend_from_slice(&raw.to_be_bytes());
        }
        buf.resize(block_size.max(buf.len()), 0);
        buf
    }

    /// Number of allocated entries.
    pub fn used_units(&self) -> usize {
        self.table.iter().filter(|e| e.is_some()).count()
    }

    /// One past the highest allocated virtual unit, 0 if nothing is allocated.
    pub fn high_water(&self) -> usize {
        self.table
            .iter()
            .rposition(Option::is_some)
            .map_or(0, |last| last + 1)
    }
}
