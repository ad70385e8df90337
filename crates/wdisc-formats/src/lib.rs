//! On-disk structures for WBFS partitions and CISO sparse containers
//!
#![allow(clippy::cast_possible_truncation)] // Intentional for binary format parsing
#![allow(clippy::cast_lossless)] // Sometimes clearer than From
#![allow(clippy::module_name_repetitions)] // Clear naming is preferred
#![allow(clippy::doc_markdown)] // WBFS/CISO terms don't need backticks
//! This crate holds the pure, I/O-free half of the disc image engine: every
//! structure that lands on disk is encoded and decoded here, and nothing in
//! here ever touches a file. The engines in `wdisc-storage` read raw bytes,
//! hand them to these codecs, and write the produced bytes back.
//!
//! # Supported Structures
//!
//! - **Disc header copy**: the first 256 bytes of a Wii/GameCube disc, used
//!   to identify stored images without decoding them
//! - **WBFS**: partition header, disc-slot table, geometry derivation and the
//!   per-disc info block holding the indirection table
//! - **CISO**: container header with its byte-per-unit presence map
//! - **Detection**: magic-based [`ImageFormat`] probing
//!
//! # Byte Order
//!
//! WBFS is big-endian throughout. CISO stores its unit size little-endian,
//! the reverse of everything else in this family of formats. Both are
//! handled at the serialization boundary only; in-memory types never rely on
//! host layout.

#![warn(missing_docs)]

pub mod ciso;
pub mod disc_header;
pub mod error;
pub mod format;
pub mod wbfs;

pub use disc_header::DiscHeader;
pub use error::FormatError;
pub use format::{DiscSelector, ImageFormat, Probe};

/// Size of one virtual disc sector (the Wii sector) in bytes.
pub const WII_SECTOR_SIZE: u32 = 0x8000;

/// Shift value of [`WII_SECTOR_SIZE`].
pub const WII_SECTOR_SHIFT: u8 = 15;

/// Number of sectors on a single-layer Wii disc.
pub const WII_SECTORS_SINGLE_LAYER: u32 = 143_432;

/// Number of sectors on a dual-layer Wii disc, the largest addressable image.
pub const WII_MAX_SECTORS: u32 = WII_SECTORS_SINGLE_LAYER * 2;

/// Size of a single-layer Wii disc in bytes.
pub const WII_SINGLE_LAYER_SIZE: u64 = WII_SECTORS_SINGLE_LAYER as u64 * WII_SECTOR_SIZE as u64;

/// Size of the full virtual disc address space in bytes.
pub const WII_MAX_DISC_SIZE: u64 = WII_MAX_SECTORS as u64 * WII_SECTOR_SIZE as u64;

/// Default host sector size.
pub const HD_SECTOR_SIZE: u32 = 512;

/// Round `value` up to a multiple of `align` (a power of two).
pub const fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}
