//! WBFS partition header and disc-slot table.
//!
//! Layout of host sector 0 (big-endian):
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0x00   | 4    | Magic "WBFS" |
//! | 0x04   | 4    | Host sector count |
//! | 0x08   | 1    | Host sector size shift |
//! | 0x09   | 1    | Allocation unit size shift |
//! | 0x0A   | 1    | Version |
//! | 0x0B   | 1    | Padding |
//! | 0x0C   | ..   | Disc-slot table, one byte per slot |

use super::{
    MAX_HD_SECTOR_SHIFT, MAX_UNIT_SECTOR_SHIFT, MIN_HD_SECTOR_SHIFT, MIN_UNIT_SECTOR_SHIFT,
    WBFS_HEADER_SIZE, WBFS_MAGIC, WBFS_VERSION,
};
use crate::WII_SECTOR_SHIFT;
use crate::error::{FormatError, ensure_len};
use binrw::{BinRead, BinWrite};
use std::io::Cursor;

/// Fixed WBFS header fields.
#[derive(Debug, Clone, PartialEq, Eq, BinRead, BinWrite)]
#[brw(big)]
pub struct WbfsHeader {
    /// Partition magic, must be [`WBFS_MAGIC`]
    pub magic: u32,
    /// Number of host sectors covered by the partition
    pub n_hd_sec: u32,
    /// Host sector size as a shift value
    pub hd_sec_sz_s: u8,
    /// Allocation unit size as a shift value
    pub wbfs_sec_sz_s: u8,
    /// Format version
    pub version: u8,
    /// Unused
    pub padding: u8,
}

impl WbfsHeader {
    /// Create a header for a freshly formatted partition.
    pub const fn new(n_hd_sec: u32, hd_sec_sz_s: u8, wbfs_sec_sz_s: u8) -> Self {
        Self {
            magic: WBFS_MAGIC,
            n_hd_sec,
            hd_sec_sz_s,
            wbfs_sec_sz_s,
            version: WBFS_VERSION,
            padding: 0,
        }
    }

    /// Host sector size in bytes.
    pub const fn hd_sec_sz(&self) -> u32 {
        1 << self.hd_sec_sz_s
    }

    /// Validate field ranges.
    pub fn validate(&self) -> Result<(), FormatError> {
        if self.magic != WBFS_MAGIC {
            return Err(FormatError::bad_magic(
                "WBFS",
                &WBFS_MAGIC.to_be_bytes(),
                &self.magic.to_be_bytes(),
            ));
        }

        if !(MIN_HD_SECTOR_SHIFT..=MAX_HD_SECTOR_SHIFT).contains(&self.hd_sec_sz_s) {
            return Err(FormatError::invalid(
                "WBFS",
                "hd_sec_sz_s",
                format!(
                    "shift {} outside {MIN_HD_SECTOR_SHIFT}..={MAX_HD_SECTOR_SHIFT}",
                    self.hd_sec_sz_s
                ),
            ));
        }

        let min_unit = MIN_UNIT_SECTOR_SHIFT + WII_SECTOR_SHIFT;
        let max_unit = MAX_UNIT_SECTOR_SHIFT + WII_SECTOR_SHIFT;
        if !(min_unit..=max_unit).contains(&self.wbfs_sec_sz_s) {
            return Err(FormatError::invalid(
                "WBFS",
                "wbfs_sec_sz_s",
                format!(
                    "shift {} outside {min_unit}..={max_unit}",
                    self.wbfs_sec_sz_s
                ),
            ));
        }

        if self.n_hd_sec == 0 {
            return Err(FormatError::invalid(
                "WBFS",
                "n_hd_sec",
                "partition has no sectors",
            ));
        }

        Ok(())
    }
}

/// Occupancy of one disc slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Slot is unused
    Free,
    /// Slot holds a valid disc
    Valid,
    /// Slot is occupied but flagged invalid (raw table value kept)
    Invalid(u8),
}

impl SlotState {
    /// Decode a disc-slot table byte.
    pub const fn from_byte(value: u8) -> Self {
        match value {
            0 => Self::Free,
            1 => Self::Valid,
            other => Self::Invalid(other),
        }
    }

    /// Encode to a disc-slot table byte.
    pub const fn to_byte(self) -> u8 {
        match self {
            Self::Free => 0,
            Self::Valid => 1,
            Self::Invalid(value) => value,
        }
    }

    /// Whether the slot holds a disc, valid or not.
    pub const fn is_used(self) -> bool {
        !matches!(self, Self::Free)
    }
}

/// Host sector 0 of a partition: header plus disc-slot table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WbfsHead {
    /// Fixed header fields
    pub header: WbfsHeader,
    /// Disc-slot table, one entry per slot up to the end of the sector
    pub slots: Vec<SlotState>,
}

impl WbfsHead {
    /// Create a head with every slot free.
    pub fn new(header: WbfsHeader) -> Self {
        let slot_capacity = header.hd_sec_sz() as usize - WBFS_HEADER_SIZE;
        Self {
            header,
            slots: vec![SlotState::Free; slot_capacity],
        }
    }

    /// Parse a head from the first host sector of a partition.
    ///
    /// Only the magic is checked before the field validation, so a
    /// [`FormatError::BadMagic`] always means "not WBFS".
    pub fn decode(data: &[u8]) -> Result<Self, FormatError> {
        ensure_len("WBFS", data, WBFS_HEADER_SIZE)?;
        if data[..4] != WBFS_MAGIC.to_be_bytes() {
            return Err(FormatError::bad_magic(
                "WBFS",
                &WBFS_MAGIC.to_be_bytes(),
                &data[..4],
            ));
        }

        let header = WbfsHeader::read(&mut Cursor::new(&data[..WBFS_HEADER_SIZE]))?;
        header.validate()?;

        let sector = header.hd_sec_sz() as usize;
        ensure_len("WBFS", data, sector)?;
        let slots = data[WBFS_HEADER_SIZE..sector]
            .iter()
            .map(|&b| SlotState::from_byte(b))
            .collect();

        Ok(Self { header, slots })
    }

    /// Serialize to exactly one host sector.
    pub fn encode(&self) -> Result<Vec<u8>, FormatError> {
        let sector = self.header.hd_sec_sz() as usize;
        let mut buf = Vec::with_capacity(sector);
        self.header.write(&mut Cursor::new(&mut buf))?;
        buf.extend(self.slots.iter().map(|s| s.to_byte()));
        buf.resize(sector, 0);
        Ok(buf)
    }
}
