//! Configuration for image handles

use crate::{ImageError, Result};
use serde::{Deserialize, Serialize};
use wdisc_formats::ciso::{CISO_MIN_BLOCK_SIZE, validate_block_size};
use wdisc_formats::{DiscSelector, HD_SECTOR_SIZE};

/// Default sparse elision threshold in bytes.
pub const DEFAULT_MIN_HOLE_SIZE: usize = 4096;

/// Configuration shared by the image engines
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// Shortest zero run a sparse write skips
    pub min_hole_size: usize,

    /// Host sector size used when formatting a WBFS partition
    pub hd_sector_size: u32,

    /// Cap on the WBFS disc-slot table, below the geometry limit
    pub max_discs: Option<usize>,

    /// Reject WBFS partitions whose unit size is not the derived smallest one
    pub verify_geometry: bool,

    /// Zero every disc-info block when formatting
    pub clear_disc_infos: bool,

    /// Fixed CISO unit size instead of the derived one
    pub ciso_block_size: Option<u32>,

    /// Byte offset of the WBFS partition inside the file
    pub partition_offset: u64,

    /// Disc a WBFS-backed virtual image binds to (first used slot if unset)
    pub wbfs_disc: Option<DiscSelector>,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            min_hole_size: DEFAULT_MIN_HOLE_SIZE,
            hd_sector_size: HD_SECTOR_SIZE,
            max_discs: None,
            verify_geometry: false,
            clear_disc_infos: false,
            ciso_block_size: None,
            partition_offset: 0,
            wbfs_disc: None,
        }
    }
}

impl ImageConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON configuration; missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::Config`] if the JSON is malformed or the
    /// resulting values fail [`validate`](Self::validate).
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ImageError::Config(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.min_hole_size == 0 {
            return Err(ImageError::Config("min_hole_size must be at least 1".into()));
        }
        if !self.hd_sector_size.is_power_of_two() || !(512..=4096).contains(&self.hd_sector_size) {
            return Err(ImageError::Config(format!(
                "hd_sector_size {} is not a power of two in 512..=4096",
                self.hd_sector_size
            )));
        }
        if self.max_discs == Some(0) {
            return Err(ImageError::Config("max_discs must be at least 1".into()));
        }
        if let Some(block_size) = self.ciso_block_size {
            validate_block_size(block_size)?;
            if block_size < CISO_MIN_BLOCK_SIZE {
                return Err(ImageError::Config(format!(
                    "ciso_block_size {block_size:#x} below minimum {CISO_MIN_BLOCK_SIZE:#x}"
                )));
            }
        }
        if self.partition_offset % u64::from(self.hd_sector_size) != 0 {
            return Err(ImageError::Config(format!(
                "partition_offset {:#x} is not sector aligned",
                self.partition_offset
            )));
        }
        Ok(())
    }

    /// Set the sparse elision threshold
    #[must_use]
    pub const fn with_min_hole_size(mut self, size: usize) -> Self {
        self.min_hole_size = size;
        self
    }

    /// Set the host sector size for formatting
    #[must_use]
    pub const fn with_hd_sector_size(mut self, size: u32) -> Self {
        self.hd_sector_size = size;
        self
    }

    /// Cap the number of disc slots
    #[must_use]
    pub const fn with_max_discs(mut self, max: usize) -> Self {
        self.max_discs = Some(max);
        self
    }

    /// Enable or disable geometry verification on open
    #[must_use]
    pub const fn with_verify_geometry(mut self, verify: bool) -> Self {
        self.verify_geometry = verify;
        self
    }

    /// Enable or disable zeroing disc-info blocks on format
    #[must_use]
    pub const fn with_clear_disc_infos(mut self, clear: bool) -> Self {
        self.clear_disc_infos = clear;
        self
    }

    /// Force the CISO unit size
    #[must_use]
    pub const fn with_ciso_block_size(mut self, block_size: u32) -> Self {
        self.ciso_block_size = Some(block_size);
        self
    }

    /// Set the partition offset
    #[must_use]
    pub const fn with_partition_offset(mut self, offset: u64) -> Self {
        self.partition_offset = offset;
        self
    }

    /// Select the WBFS disc to bind
    #[must_use]
    pub fn with_wbfs_disc(mut self, disc: DiscSelector) -> Self {
        self.wbfs_disc = Some(disc);
        self
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_are_valid() {
        let config = ImageConfig::default();
        config.validate().expect("default config");
        assert_eq!(config.min_hole_size, 4096);
        assert_eq!(config.hd_sector_size, 512);
        assert_eq!(config.wbfs_disc, None);
    }

    #[test]
    fn test_from_json_partial() {
        let config = ImageConfig::from_json(
            r#"{ "max_discs": 4, "wbfs_disc": { "id": "RMCP01" }, "min_hole_size": 512 }"#,
        )
        .expect("parse");
        assert_eq!(
            config,
            ImageConfig::new()
                .with_max_discs(4)
                .with_min_hole_size(512)
                .with_wbfs_disc(DiscSelector::Id("RMCP01".into()))
        );

        let slot = ImageConfig::from_json(r#"{ "wbfs_disc": { "slot": 2 } }"#).expect("slot");
        assert_eq!(slot.wbfs_disc, Some(DiscSelector::Slot(2)));
    }

    #[test]
    fn test_json_round_trip() {
        let config = ImageConfig::new()
            .with_ciso_block_size(0x10000)
            .with_partition_offset(0x100000)
            .with_verify_geometry(true);
        let json = serde_json::to_string(&config).expect("serialize");
        assert_eq!(ImageConfig::from_json(&json).expect("parse"), config);
    }

    #[test]
    fn test_validate_rejects() {
        let bad = [
            ImageConfig::new().with_min_hole_size(0),
            ImageConfig::new().with_hd_sector_size(1000),
            ImageConfig::new().with_hd_sector_size(8192),
            ImageConfig::new().with_max_discs(0),
            ImageConfig::new().with_ciso_block_size(0x1000),
            ImageConfig::new().with_ciso_block_size(0x9000),
            ImageConfig::new().with_partition_offset(100),
        ];
        for config in bad {
            assert!(config.validate().is_err(), "{config:?}");
        }
        assert!(matches!(
            ImageConfig::from_json("{ nope"),
            Err(ImageError::Config(_))
        ));
    }
}
