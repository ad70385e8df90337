//! CISO container header and presence map.
//!
//! The header occupies the first 0x8000 bytes of the file:
//!
//! | Offset | Size     | Field |
//! |--------|----------|-------|
//! | 0x00   | 4        | Magic "CISO" |
//! | 0x04   | 4        | Unit size (**little-endian**) |
//! | 0x08   | 0x7FF8   | Presence map, one byte per unit (1 = present) |
//!
//! Present units follow the header, packed in map order. Unlike the WBFS
//! structures, the unit size is stored little-endian.

use crate::error::{FormatError, ensure_len};
use crate::{HD_SECTOR_SIZE, WII_SECTOR_SIZE};
use binrw::{BinRead, BinWrite};
use std::io::Cursor;

/// CISO magic bytes.
pub const CISO_MAGIC: [u8; 4] = *b"CISO";

/// Total header size; data starts here.
pub const CISO_HEAD_SIZE: usize = 0x8000;

/// Number of entries in the presence map.
pub const CISO_MAP_SIZE: usize = CISO_HEAD_SIZE - 8;

/// Smallest unit size used when creating a container.
pub const CISO_MIN_BLOCK_SIZE: u32 = WII_SECTOR_SIZE;

/// Raw header as laid out on disk.
#[derive(Debug, Clone, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
struct RawCisoHeader {
    magic: [u8; 4],
    block_size: u32,
    #[br(count = CISO_MAP_SIZE)]
    map: Vec<u8>,
}

/// Decoded CISO header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CisoHeader {
    /// Allocation unit size in bytes
    pub block_size: u32,
    /// Presence flag per unit
    pub map: Vec<bool>,
}

impl CisoHeader {
    /// Header with an empty presence map.
    pub fn new(block_size: u32) -> Result<Self, FormatError> {
        validate_block_size(block_size)?;
        Ok(Self {
            block_size,
            map: vec![false; CISO_MAP_SIZE],
        })
    }

    /// Parse the 0x8000-byte header.
    pub fn decode(data: &[u8]) -> Result<Self, FormatError> {
        ensure_len("CISO", data, 4)?;
        if data[..4] != CISO_MAGIC {
            return Err(FormatError::bad_magic("CISO", &CISO_MAGIC, &data[..4]));
        }
        ensure_len("CISO", data, CISO_HEAD_SIZE)?;

        let raw = RawCisoHeader::read(&mut Cursor::new(&data[..CISO_HEAD_SIZE]))?;
        validate_block_size(raw.block_size)?;

        Ok(Self {
            block_size: raw.block_size,
            map: raw.map.iter().map(|&b| b != 0).collect(),
        })
    }

    /// Serialize to exactly [`CISO_HEAD_SIZE`] bytes.
    pub fn encode(&self) -> Result<Vec<u8>, FormatError> {
        let mut map: Vec<u8> = self.map.iter().map(|&p| u8::from(p)).collect();
        map.resize(CISO_MAP_SIZE, 0);
        let raw = RawCisoHeader {
            magic: CISO_MAGIC,
            block_size: self.block_size,
            map,
        };

        let mut buf = Vec::with_capacity(CISO_HEAD_SIZE);
        raw.write(&mut Cursor::new(&mut buf))?;
        Ok(buf)
    }

    /// Number of present units.
    pub fn used_blocks(&self) -> usize {
        self.map.iter().filter(|&&p| p).count()
    }

    /// One past the highest present unit.
    pub fn high_water(&self) -> usize {
        self.map.iter().rposition(|&p| p).map_or(0, |last| last + 1)
    }
}

/// A CISO unit size must be a power of two no smaller than a host sector.
pub fn validate_block_size(block_size: u32) -> Result<(), FormatError> {
    if !block_size.is_power_of_two() || block_size < HD_SECTOR_SIZE {
        return Err(FormatError::invalid(
            "CISO",
            "block_size",
            format!("{block_size} is not a power of two >= {HD_SECTOR_SIZE}"),
        ));
    }
    Ok(())
}

/// Unit size for an image of `image_size` bytes: the smallest power of two,
/// at least [`CISO_MIN_BLOCK_SIZE`], for which the map covers the image.
pub fn calc_block_size(image_size: u64) -> u32 {
    let needed = image_size.div_ceil(CISO_MAP_SIZE as u64);
    let block = needed
        .max(u64::from(CISO_MIN_BLOCK_SIZE))
        .next_power_of_two();
    u32::try_from(block).unwrap_or(1 << 31)
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::WII_MAX_DISC_SIZE;

    #[test]
    fn test_block_size_is_little_endian() {
        let mut header = CisoHeader::new(0x0002_0000).expect("header");
        header.map[0] = true;
        header.map[2] = true;

        let bytes = header.encode().expect("encode");
        assert_eq!(bytes.len(), CISO_HEAD_SIZE);
        assert_eq!(&bytes[..4], b"CISO");
        assert_eq!(&bytes[4..8], &[0x00, 0x00, 0x02, 0x00]);
        assert_eq!(&bytes[8..11], &[1, 0, 1]);

        let parsed = CisoHeader::decode(&bytes).expect("decode");
        assert_eq!(parsed, header);
        assert_eq!(parsed.used_blocks(), 2);
        assert_eq!(parsed.high_water(), 3);
    }

    #[test]
    fn test_bad_magic_is_mismatch() {
        let mut bytes = CisoHeader::new(0x8000).unwrap().encode().unwrap();
        bytes[..4].copy_from_slice(b"WBFS");
        assert!(CisoHeader::decode(&bytes).unwrap_err().is_mismatch());
    }

    #[test]
    fn test_invalid_block_size_rejected() {
        let mut bytes = CisoHeader::new(0x8000).unwrap().encode().unwrap();
        bytes[4..8].copy_from_slice(&0x0000_9000u32.to_le_bytes());
        let err = CisoHeader::decode(&bytes).unwrap_err();
        assert!(matches!(err, FormatError::InvalidField { field: "block_size", .. }));

        // 64 KiB written big-endian reads back as 256
        bytes[4..8].copy_from_slice(&0x0001_0000u32.to_be_bytes());
        assert!(CisoHeader::decode(&bytes).is_err());
    }

    #[test]
    fn test_truncated_header() {
        let bytes = CisoHeader::new(0x8000).unwrap().encode().unwrap();
        assert!(matches!(
            CisoHeader::decode(&bytes[..0x1000]),
            Err(FormatError::Truncated { .. })
        ));
    }

    #[test]
    fn test_calc_block_size() {
        assert_eq!(calc_block_size(0), CISO_MIN_BLOCK_SIZE);
        assert_eq!(calc_block_size(1024 * 1024), CISO_MIN_BLOCK_SIZE);
        // dual-layer disc needs about 0x46000 bytes per unit, rounded up
        assert_eq!(calc_block_size(WII_MAX_DISC_SIZE), 0x80000);
        let bs = calc_block_size(WII_MAX_DISC_SIZE);
        assert!(u64::from(bs) * CISO_MAP_SIZE as u64 >= WII_MAX_DISC_SIZE);
        assert!(u64::from(bs / 2) * (CISO_MAP_SIZE as u64) < WII_MAX_DISC_SIZE);
    }
}
