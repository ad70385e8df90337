//! Container format identification.

use crate::ciso::CISO_MAGIC;
use crate::disc_header::{DISC_HEADER_SIZE, DiscHeader};
use crate::error::FormatError;
use crate::wbfs::WBFS_MAGIC;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Backing container of a virtual disc image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    /// Plain, linearly stored image (ISO/GCM)
    #[default]
    Raw,
    /// Single-image sparse container with a presence map
    Ciso,
    /// Multi-image partition with per-disc indirection tables
    Wbfs,
}

/// Result of probing the first bytes of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Probe {
    /// Detected container format
    pub format: ImageFormat,
    /// Whether a Wii or GameCube disc header sits at offset 0 of a raw image
    pub disc_magic: bool,
}

impl ImageFormat {
    /// Number of leading bytes [`ImageFormat::detect`] looks at.
    pub const PROBE_SIZE: usize = DISC_HEADER_SIZE;

    /// Identify the container from its leading bytes.
    ///
    /// Anything that is neither WBFS nor CISO is treated as a raw image.
    pub fn detect(head: &[u8]) -> Probe {
        let format = match head.get(..4) {
            Some(magic) if magic == WBFS_MAGIC.to_be_bytes() => Self::Wbfs,
            Some(magic) if magic == CISO_MAGIC => Self::Ciso,
            _ => Self::Raw,
        };

        let disc_magic = format == Self::Raw
            && DiscHeader::from_bytes(head).is_ok_and(|h| h.is_wii() || h.is_gamecube());

        Probe { format, disc_magic }
    }

    /// Canonical upper-case name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Raw => "ISO",
            Self::Ciso => "CISO",
            Self::Wbfs => "WBFS",
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ImageFormat {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "raw" | "iso" | "gcm" | "plain" => Ok(Self::Raw),
            "ciso" => Ok(Self::Ciso),
            "wbfs" => Ok(Self::Wbfs),
            other => Err(FormatError::invalid(
                "image",
                "format",
                format!("unknown format name {other:?}"),
            )),
        }
    }
}

/// Selects one disc inside a WBFS partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscSelector {
    /// Disc-slot index
    Slot(usize),
    /// Six-character disc identifier
    Id(String),
}

impl fmt::Display for DiscSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Slot(slot) => write!(f, "slot {slot}"),
            Self::Id(id) => write!(f, "id {id}"),
        }
    }
}
