//! Disc image storage engine for WBFS partitions, CISO containers and raw files.
//!
//! Client code works on one virtual, linearly addressed disc image. The
//! engine maps that address space onto one of three backing formats:
//!
//! - **WBFS**: a partition holding many images, with a free-block bitmap and
//!   a per-image indirection table ([`wbfs`])
//! - **CISO**: a single image with a byte-per-unit presence map ([`ciso`])
//! - **Raw**: a plain file, addressed directly ([`raw`])
//!
//! [`VirtualImage`] binds one of them at open/create time and forwards the
//! read / write / write-sparse / write-zero / flush contract to it. Sparse
//! writes run through the zero-run detector in [`sparse`] first.
//!
//! Everything is synchronous and single-owner: a handle owns its file for
//! its whole lifetime and there is no internal locking.
//!
//! # Example
//!
//! ```rust,no_run
//! use wdisc_storage::{ImageConfig, VirtualImage};
//! use wdisc_formats::{DiscHeader, ImageFormat};
//!
//! # fn example() -> wdisc_storage::Result<()> {
//! let file = std::fs::OpenOptions::new()
//!     .read(true)
//!     .write(true)
//!     .create(true)
//!     .truncate(true)
//!     .open("game.ciso")?;
//! let header = DiscHeader::new("RMCP01", "Mario Kart Wii")?;
//! let mut image = VirtualImage::create(
//!     file,
//!     ImageFormat::Ciso,
//!     wdisc_formats::WII_SINGLE_LAYER_SIZE,
//!     Some(header),
//!     &ImageConfig::default(),
//! )?;
//! image.write_sparse(0, &[0u8; 0x8000])?;
//! image.close()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![allow(clippy::must_use_candidate)]

use thiserror::Error;
use wdisc_formats::FormatError;

// Positioned file access
pub mod io;

// Zero-run detection for sparse writes
pub mod sparse;

// Single-image sparse container
pub mod ciso;

// Multi-image partition filesystem
pub mod wbfs;

// Plain file passthrough
pub mod raw;

// Virtual image dispatcher
pub mod image;

// Configuration
pub mod config;

mod units;

pub use ciso::CisoImage;
pub use config::ImageConfig;
pub use image::{ImageInfo, ImageIo, VirtualImage, WriteState};
pub use io::{DiskFile, MemoryFile, WriteStats};
pub use raw::RawImage;
pub use sparse::SparseSplitter;
pub use wbfs::{WbfsDisc, WbfsPartition};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, ImageError>;

/// Errors that can occur during image storage operations.
#[derive(Debug, Error)]
pub enum ImageError {
    /// Underlying file I/O failed (short reads surface as `UnexpectedEof`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk structure did not decode or validate.
    #[error("Format error: {0}")]
    Format(#[from] FormatError),

    /// The WBFS free-block bitmap has no free unit left.
    #[error("No free allocation unit left in the partition")]
    NoFreeBlocks,

    /// Every WBFS disc slot is occupied.
    #[error("Disc slot table full ({slots} slots)")]
    SlotTableFull {
        /// Slot capacity of the partition
        slots: usize,
    },

    /// A CISO unit index exceeds the presence map.
    #[error("CISO presence map full: unit {unit} >= {capacity}")]
    CisoMapFull {
        /// Unit that was addressed
        unit: u64,
        /// Map capacity
        capacity: usize,
    },

    /// Write into a unit that was skipped when a later unit was committed.
    #[error("Unit {unit} is a permanent hole (high-water mark {high_water})")]
    HoleWrite {
        /// Virtual unit that was addressed
        unit: u64,
        /// Units committed so far
        high_water: u64,
    },

    /// Byte range lies beyond the addressable image.
    #[error("Range {offset:#x}+{len:#x} exceeds addressable size {limit:#x}")]
    OutOfRange {
        /// Start offset
        offset: u64,
        /// Length in bytes
        len: u64,
        /// Addressable limit
        limit: u64,
    },

    /// No disc with this slot or identifier.
    #[error("Disc not found: {0}")]
    DiscNotFound(String),

    /// A disc with this identifier already exists.
    #[error("Disc already exists: {0}")]
    DiscExists(String),

    /// Slot index outside the slot table.
    #[error("Invalid disc slot {slot} (partition has {max} slots)")]
    InvalidSlot {
        /// Requested slot
        slot: usize,
        /// Slot capacity
        max: usize,
    },

    /// The disc is open and cannot be removed or opened twice.
    #[error("Disc in slot {0} is open")]
    DiscInUse(usize),

    /// Partition close requested while discs are still open.
    #[error("{0} disc(s) still open")]
    DiscsStillOpen(usize),

    /// Configuration or usage error.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Error classes callers react to differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Not this format; another one may be tried
    Detection,
    /// This format, but the header is self-inconsistent
    Validity,
    /// Bitmap, slot table or presence map exhausted
    Capacity,
    /// Write into a permanent hole or beyond the addressable range
    Protocol,
    /// Underlying file failure
    Io,
    /// Lookup or lifecycle misuse
    Usage,
}

impl ImageError {
    /// Classify this error.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) => ErrorKind::Io,
            Self::Format(e) if e.is_mismatch() => ErrorKind::Detection,
            Self::Format(_) => ErrorKind::Validity,
            Self::NoFreeBlocks | Self::SlotTableFull { .. } | Self::CisoMapFull { .. } => {
                ErrorKind::Capacity
            }
            Self::HoleWrite { .. } | Self::OutOfRange { .. } => ErrorKind::Protocol,
            Self::DiscNotFound(_)
            | Self::DiscExists(_)
            | Self::InvalidSlot { .. }
            | Self::DiscInUse(_)
            | Self::DiscsStillOpen(_)
            | Self::Config(_) => ErrorKind::Usage,
        }
    }

    /// Whether the caller may retry the open with a different format.
    pub const fn is_format_mismatch(&self) -> bool {
        matches!(self.kind(), ErrorKind::Detection)
    }
}

/// Version information for the storage engine.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
