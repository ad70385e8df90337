//! WBFS partition structures
//!
//! A WBFS partition stores many disc images in fixed-size allocation units.
//! Unit 0 holds all metadata:
//!
//! ```text
//! +--------------------+  host sector 0
//! | header + slot table|
//! +--------------------+  host sector 1
//! | disc info, slot 0  |  header copy + indirection table
//! | disc info, slot 1  |
//! | ...                |
//! +--------------------+  free_map_lba
//! | free-block bitmap  |  end of unit 0
//! +--------------------+  unit 1 onwards: image data
//! ```
//!
//! Every integer is big-endian on disk.

pub mod disc_info;
pub mod geometry;
pub mod header;

pub use disc_info::DiscInfo;
pub use geometry::WbfsGeometry;
pub use header::{SlotState, WbfsHead, WbfsHeader};

/// WBFS magic: "WBFS" as a big-endian u32.
pub const WBFS_MAGIC: u32 = u32::from_be_bytes(*b"WBFS");

/// Version byte written by this implementation.
pub const WBFS_VERSION: u8 = 1;

/// Size of the fixed header fields that precede the disc-slot table.
pub const WBFS_HEADER_SIZE: usize = 12;

/// Smallest accepted host sector shift (512 bytes).
pub const MIN_HD_SECTOR_SHIFT: u8 = 9;

/// Largest accepted host sector shift (4096 bytes).
pub const MAX_HD_SECTOR_SHIFT: u8 = 12;

/// Smallest allocation unit, in virtual disc sectors, as a shift (2 MiB units).
pub const MIN_UNIT_SECTOR_SHIFT: u8 = 6;

/// Largest allocation unit, in virtual disc sectors, as a shift (32 MiB units).
pub const MAX_UNIT_SECTOR_SHIFT: u8 = 10;

/// Upper bound on the number of allocation units, so every unit number fits
/// the 16-bit indirection entries.
pub const MAX_UNITS: u32 = 1 << 16;
