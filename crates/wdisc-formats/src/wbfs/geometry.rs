//! WBFS geometry derivation.
//!
//! Everything about a partition's layout follows from two numbers: how many
//! host sectors it spans and how big a host sector is. The allocation unit is
//! the smallest power of two (2 MiB at least) that keeps the number of units
//! below the 16-bit ceiling of the indirection entries.

use super::header::WbfsHeader;
use super::{
    MAX_HD_SECTOR_SHIFT, MAX_UNIT_SECTOR_SHIFT, MAX_UNITS, MIN_HD_SECTOR_SHIFT,
    MIN_UNIT_SECTOR_SHIFT, WBFS_HEADER_SIZE,
};
use crate::disc_header::DISC_HEADER_SIZE;
use crate::error::FormatError;
use crate::{WII_MAX_SECTORS, WII_SECTOR_SHIFT, WII_SECTOR_SIZE, align_up};

/// Derived layout of a WBFS partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WbfsGeometry {
    /// Host sector size shift
    pub hd_sec_sz_s: u8,
    /// Allocation unit size shift
    pub wbfs_sec_sz_s: u8,
    /// Host sectors in the partition
    pub n_hd_sec: u32,
    /// Virtual disc sectors that fit in the partition
    pub n_wii_sec: u32,
    /// Allocation units in the partition, unit 0 included
    pub n_wbfs_sec: u32,
    /// Indirection entries per disc (units spanned by the largest disc)
    pub n_wbfs_sec_per_disc: u32,
    /// Size of one disc-info block in bytes (host sector aligned)
    pub disc_info_sz: u32,
    /// Number of u32 words in the free-block bitmap
    pub free_map_words: u32,
    /// Size of the on-disk free-block bitmap in bytes (host sector aligned)
    pub free_map_sz: u32,
    /// Host sector where the free-block bitmap starts
    pub free_map_lba: u32,
    /// Number of usable disc slots
    pub max_discs: u32,
}

impl WbfsGeometry {
    /// Smallest unit shift, in virtual disc sectors, for a partition holding
    /// `n_wii_sec` virtual sectors. `None` if even the largest unit is too
    /// small to keep the unit count addressable.
    pub fn smallest_unit_shift(n_wii_sec: u32) -> Option<u8> {
        (MIN_UNIT_SECTOR_SHIFT..=MAX_UNIT_SECTOR_SHIFT)
            .find(|&s| u64::from(n_wii_sec) < u64::from(MAX_UNITS) << s)
    }

    /// Derive the geometry of a new partition.
    pub fn derive(n_hd_sec: u32, hd_sec_sz: u32) -> Result<Self, FormatError> {
        let hd_sec_sz_s = hd_shift(hd_sec_sz)?;
        let n_wii_sec = wii_sectors(n_hd_sec, hd_sec_sz_s);
        let s = Self::smallest_unit_shift(n_wii_sec).ok_or_else(|| {
            FormatError::Geometry(format!(
                "{n_hd_sec} sectors of {hd_sec_sz} bytes exceed the largest allocation unit"
            ))
        })?;
        Self::with_shift(n_hd_sec, hd_sec_sz_s, s + WII_SECTOR_SHIFT)
    }

    /// Geometry recorded in an existing header.
    pub fn from_header(header: &WbfsHeader) -> Result<Self, FormatError> {
        header.validate()?;
        Self::with_shift(header.n_hd_sec, header.hd_sec_sz_s, header.wbfs_sec_sz_s)
    }

    /// Geometry for explicit shift values.
    pub fn with_shift(n_hd_sec: u32, hd_sec_sz_s: u8, wbfs_sec_sz_s: u8) -> Result<Self, FormatError> {
        if !(MIN_HD_SECTOR_SHIFT..=MAX_HD_SECTOR_SHIFT).contains(&hd_sec_sz_s) {
            return Err(FormatError::Geometry(format!(
                "host sector shift {hd_sec_sz_s} out of range"
            )));
        }
        let s = wbfs_sec_sz_s
            .checked_sub(WII_SECTOR_SHIFT)
            .filter(|s| (MIN_UNIT_SECTOR_SHIFT..=MAX_UNIT_SECTOR_SHIFT).contains(s))
            .ok_or_else(|| {
                FormatError::Geometry(format!("unit shift {wbfs_sec_sz_s} out of range"))
            })?;

        let hd_sec_sz = 1u32 << hd_sec_sz_s;
        let unit_size = 1u64 << wbfs_sec_sz_s;
        let n_wii_sec = wii_sectors(n_hd_sec, hd_sec_sz_s);
        let n_wbfs_sec = n_wii_sec >> s;

        if n_wbfs_sec < 2 {
            return Err(FormatError::Geometry(format!(
                "partition too small: {n_wbfs_sec} units of {unit_size} bytes"
            )));
        }
        if n_wbfs_sec > MAX_UNITS {
            return Err(FormatError::Geometry(format!(
                "{n_wbfs_sec} units exceed the 16-bit unit index"
            )));
        }

        let n_wbfs_sec_per_disc = WII_MAX_SECTORS.div_ceil(1 << s);
        let disc_info_sz = align_up(
            (DISC_HEADER_SIZE as u64) + u64::from(n_wbfs_sec_per_disc) * 2,
            u64::from(hd_sec_sz),
        ) as u32;

        let free_map_words = (n_wbfs_sec - 1).div_ceil(32);
        let free_map_sz = align_up(u64::from(free_map_words) * 4, u64::from(hd_sec_sz)) as u32;
        let free_map_lba = ((unit_size - u64::from(free_map_sz)) >> hd_sec_sz_s) as u32;

        let disc_info_lba = disc_info_sz >> hd_sec_sz_s;
        let slot_capacity = hd_sec_sz - WBFS_HEADER_SIZE as u32;
        let max_discs = (free_map_lba.saturating_sub(1) / disc_info_lba).min(slot_capacity);
        if max_discs == 0 {
            return Err(FormatError::Geometry(
                "no room for a single disc-info block".to_string(),
            ));
        }

        Ok(Self {
            hd_sec_sz_s,
            wbfs_sec_sz_s,
            n_hd_sec,
            n_wii_sec,
            n_wbfs_sec,
            n_wbfs_sec_per_disc,
            disc_info_sz,
            free_map_words,
            free_map_sz,
            free_map_lba,
            max_discs,
        })
    }

    /// Header describing this geometry.
    pub const fn header(&self) -> WbfsHeader {
        WbfsHeader::new(self.n_hd_sec, self.hd_sec_sz_s, self.wbfs_sec_sz_s)
    }

    /// Host sector size in bytes.
    pub const fn hd_sec_sz(&self) -> u32 {
        1 << self.hd_sec_sz_s
    }

    /// Allocation unit size in bytes.
    pub const fn unit_size(&self) -> u64 {
        1 << self.wbfs_sec_sz_s
    }

    /// Partition size in bytes.
    pub const fn partition_size(&self) -> u64 {
        (self.n_hd_sec as u64) << self.hd_sec_sz_s
    }

    /// Disc-info block size in host sectors.
    pub const fn disc_info_lba(&self) -> u32 {
        self.disc_info_sz >> self.hd_sec_sz_s
    }

    /// Byte offset of the disc-info block of `slot`, relative to the partition.
    pub const fn disc_info_offset(&self, slot: u32) -> u64 {
        (1 + slot as u64 * self.disc_info_lba() as u64) << self.hd_sec_sz_s
    }

    /// Byte offset of the free-block bitmap, relative to the partition.
    pub const fn free_map_offset(&self) -> u64 {
        (self.free_map_lba as u64) << self.hd_sec_sz_s
    }

    /// Byte offset of allocation unit `unit`, relative to the partition.
    pub const fn unit_offset(&self, unit: u16) -> u64 {
        (unit as u64) << self.wbfs_sec_sz_s
    }

    /// Bytes addressable by one disc's indirection table.
    pub const fn disc_capacity(&self) -> u64 {
        (self.n_wbfs_sec_per_disc as u64) << self.wbfs_sec_sz_s
    }

    /// Host sectors needed so a partition holds `data_units` data units plus
    /// the metadata unit, for the given unit and host sector sizes.
    pub const fn sectors_for_units(data_units: u32, wbfs_sec_sz_s: u8, hd_sec_sz_s: u8) -> u64 {
        ((data_units as u64) + 1) << (wbfs_sec_sz_s - hd_sec_sz_s)
    }
}

fn hd_shift(hd_sec_sz: u32) -> Result<u8, FormatError> {
    if !hd_sec_sz.is_power_of_two() {
        return Err(FormatError::Geometry(format!(
            "host sector size {hd_sec_sz} is not a power of two"
        )));
    }
    let shift = hd_sec_sz.trailing_zeros() as u8;
    if !(MIN_HD_SECTOR_SHIFT..=MAX_HD_SECTOR_SHIFT).contains(&shift) {
        return Err(FormatError::Geometry(format!(
            "host sector size {hd_sec_sz} outside 512..=4096"
        )));
    }
    Ok(shift)
}

fn wii_sectors(n_hd_sec: u32, hd_sec_sz_s: u8) -> u32 {
    ((u64::from(n_hd_sec) << hd_sec_sz_s) / u64::from(WII_SECTOR_SIZE)) as u32
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_small_partition_geometry() {
        // 64 MiB of 512-byte sectors
        let geo = WbfsGeometry::derive(131_072, 512).expect("geometry");
        assert_eq!(geo.hd_sec_sz(), 512);
        assert_eq!(geo.unit_size(), 2 * MIB);
        assert_eq!(geo.n_wii_sec, 2048);
        assert_eq!(geo.n_wbfs_sec, 32);
        assert_eq!(geo.n_wbfs_sec_per_disc, 4483);
        assert_eq!(geo.disc_info_sz, 9728);
        assert_eq!(geo.disc_info_lba(), 19);
        assert_eq!(geo.free_map_words, 1);
        assert_eq!(geo.free_map_sz, 512);
        assert_eq!(geo.free_map_lba, 4095);
        assert_eq!(geo.max_discs, 215);
        assert_eq!(geo.disc_info_offset(0), 512);
        assert_eq!(geo.disc_info_offset(2), 512 * 39);
        assert_eq!(geo.free_map_offset(), 2 * MIB - 512);
        assert_eq!(geo.unit_offset(3), 6 * MIB);
    }

    #[test]
    fn test_large_partition_grows_unit() {
        // 500 GB drive
        let geo = WbfsGeometry::derive(976_773_168, 512).expect("geometry");
        assert_eq!(geo.unit_size(), 8 * MIB);
        assert!(geo.n_wbfs_sec <= MAX_UNITS);
        assert_eq!(geo.max_discs, 500);
    }

    #[test]
    fn test_disc_info_blocks_stay_below_free_map() {
        for n_hd_sec in [131_072u32, 1 << 24, 976_773_168, u32::MAX] {
            let Ok(geo) = WbfsGeometry::derive(n_hd_sec, 512) else {
                continue;
            };
            let last = geo.disc_info_offset(geo.max_discs - 1) + u64::from(geo.disc_info_sz);
            assert!(last <= geo.free_map_offset(), "n_hd_sec={n_hd_sec}");
            assert!(geo.free_map_offset() + u64::from(geo.free_map_sz) <= geo.unit_size());
        }
    }

    #[test]
    fn test_rejects_bad_sector_sizes() {
        assert!(WbfsGeometry::derive(131_072, 500).is_err());
        assert!(WbfsGeometry::derive(131_072, 256).is_err());
        assert!(WbfsGeometry::derive(131_072, 8192).is_err());
    }

    #[test]
    fn test_rejects_tiny_partition() {
        // 2 MiB: only the metadata unit
        assert!(matches!(
            WbfsGeometry::derive(4096, 512),
            Err(FormatError::Geometry(_))
        ));
    }

    #[test]
    fn test_header_round_trip() {
        let geo = WbfsGeometry::derive(1 << 22, 512).expect("geometry");
        let again = WbfsGeometry::from_header(&geo.header()).expect("from header");
        assert_eq!(geo, again);
    }

    #[test]
    fn test_sectors_for_units() {
        let sectors = WbfsGeometry::sectors_for_units(10, 21, 9);
        assert_eq!(sectors * 512, 11 * 2 * MIB);
    }

    proptest! {
        #[test]
        fn derived_unit_is_smallest_within_ceiling(
            n_hd_sec in 8192u32..=u32::MAX,
            hd_shift in MIN_HD_SECTOR_SHIFT..=MAX_HD_SECTOR_SHIFT,
        ) {
            let hd_sec_sz = 1u32 << hd_shift;
            let n_wii_sec = wii_sectors(n_hd_sec, hd_shift);
            match WbfsGeometry::derive(n_hd_sec, hd_sec_sz) {
                Ok(geo) => {
                    let s = geo.wbfs_sec_sz_s - WII_SECTOR_SHIFT;
                    prop_assert!(geo.n_wbfs_sec <= MAX_UNITS);
                    prop_assert!(u64::from(n_wii_sec) < u64::from(MAX_UNITS) << s);
                    if s > MIN_UNIT_SECTOR_SHIFT {
                        prop_assert!(u64::from(n_wii_sec) >= u64::from(MAX_UNITS) << (s - 1));
                    }
                }
                Err(FormatError::Geometry(_)) => {
                    let too_big = WbfsGeometry::smallest_unit_shift(n_wii_sec).is_none();
                    let too_small = n_wii_sec >> MIN_UNIT_SECTOR_SHIFT < 2;
                    prop_assert!(too_big || too_small);
                }
                Err(other) => prop_assert!(false, "unexpected error {other}"),
            }
        }
    }
}
