//! Leading 256-byte disc header copy.
//!
//! Both container formats keep the first 0x100 bytes of an image around for
//! identification. Layout of the fields this crate cares about:
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0x00   | 6    | Disc identifier (ASCII) |
//! | 0x18   | 4    | Wii magic `0x5D1C9EA3` (BE) |
//! | 0x1C   | 4    | GameCube magic `0xC2339F3D` (BE) |
//! | 0x20   | 64   | Title, NUL padded |

use crate::error::{FormatError, ensure_len};

/// Size of the disc header copy in bytes.
pub const DISC_HEADER_SIZE: usize = 0x100;

/// Length of a disc identifier.
pub const DISC_ID_LEN: usize = 6;

/// Wii disc magic at offset 0x18.
pub const WII_MAGIC: u32 = 0x5D1C_9EA3;

/// GameCube disc magic at offset 0x1C.
pub const GAMECUBE_MAGIC: u32 = 0xC233_9F3D;

const TITLE_OFFSET: usize = 0x20;
const TITLE_LEN: usize = 0x40;

/// A six-character disc identifier.
pub type DiscId = [u8; DISC_ID_LEN];

/// Copy of the first 256 bytes of a disc image.
#[derive(Clone, PartialEq, Eq)]
pub struct DiscHeader {
    bytes: [u8; DISC_HEADER_SIZE],
}

impl DiscHeader {
    /// Build a Wii disc header from an identifier and title.
    ///
    /// The identifier must be exactly six printable ASCII characters.
    pub fn new(id: &str, title: &str) -> Result<Self, FormatError> {
        let id = parse_disc_id(id)?;
        let mut header = Self {
            bytes: [0; DISC_HEADER_SIZE],
        };
        header.bytes[..DISC_ID_LEN].copy_from_slice(&id);
        header.bytes[0x18..0x1C].copy_from_slice(&WII_MAGIC.to_be_bytes());
        header.set_title(title);
        Ok(header)
    }

    /// Parse a header copy from at least 256 bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, FormatError> {
        ensure_len("disc header", data, DISC_HEADER_SIZE)?;
        let mut bytes = [0u8; DISC_HEADER_SIZE];
        bytes.copy_from_slice(&data[..DISC_HEADER_SIZE]);
        Ok(Self { bytes })
    }

    /// Raw header bytes.
    pub const fn as_bytes(&self) -> &[u8; DISC_HEADER_SIZE] {
        &self.bytes
    }

    /// Overwrite `data.len()` bytes starting at `offset`, clipped to the header.
    ///
    /// Returns whether any byte changed.
    pub fn patch(&mut self, offset: usize, data: &[u8]) -> bool {
        if offset >= DISC_HEADER_SIZE {
            return false;
        }
        let len = data.len().min(DISC_HEADER_SIZE - offset);
        let target = &mut self.bytes[offset..offset + len];
        if *target == data[..len] {
            return false;
        }
        target.copy_from_slice(&data[..len]);
        true
    }

    /// Disc identifier bytes.
    pub fn id(&self) -> DiscId {
        let mut id = [0u8; DISC_ID_LEN];
        id.copy_from_slice(&self.bytes[..DISC_ID_LEN]);
        id
    }

    /// Disc identifier as a string (lossy for non-ASCII bytes).
    pub fn id_str(&self) -> String {
        String::from_utf8_lossy(&self.bytes[..DISC_ID_LEN]).into_owned()
    }

    /// Replace the identifier.
    pub fn set_id(&mut self, id: &str) -> Result<(), FormatError> {
        let id = parse_disc_id(id)?;
        self.bytes[..DISC_ID_LEN].copy_from_slice(&id);
        Ok(())
    }

    /// Disc title, trimmed at the first NUL.
    pub fn title(&self) -> String {
        let raw = &self.bytes[TITLE_OFFSET..TITLE_OFFSET + TITLE_LEN];
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        String::from_utf8_lossy(&raw[..end]).trim_end().to_string()
    }

    /// Replace the title. Longer titles are truncated to 63 bytes.
    pub fn set_title(&mut self, title: &str) {
        let field = &mut self.bytes[TITLE_OFFSET..TITLE_OFFSET + TITLE_LEN];
        field.fill(0);
        let len = title.len().min(TITLE_LEN - 1);
        field[..len].copy_from_slice(&title.as_bytes()[..len]);
    }

    /// Whether the Wii magic is present.
    pub fn is_wii(&self) -> bool {
        u32::from_be_bytes([
            self.bytes[0x18],
            self.bytes[0x19],
            self.bytes[0x1A],
            self.bytes[0x1B],
        ]) == WII_MAGIC
    }

    /// Whether the GameCube magic is present.
    pub fn is_gamecube(&self) -> bool {
        u32::from_be_bytes([
            self.bytes[0x1C],
            self.bytes[0x1D],
            self.bytes[0x1E],
            self.bytes[0x1F],
        ]) == GAMECUBE_MAGIC
    }
}

impl Default for DiscHeader {
    fn default() -> Self {
        Self {
            bytes: [0; DISC_HEADER_SIZE],
        }
    }
}

impl std::fmt::Debug for DiscHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscHeader")
            .field("id", &self.id_str())
            .field("title", &self.title())
            .field("wii", &self.is_wii())
            .field("gamecube", &self.is_gamecube())
            .finish()
    }
}

/// Validate a six-character disc identifier.
pub fn parse_disc_id(id: &str) -> Result<DiscId, FormatError> {
    let bytes = id.as_bytes();
    if bytes.len() != DISC_ID_LEN {
        return Err(FormatError::invalid(
            "disc header",
            "id",
            format!("expected {DISC_ID_LEN} characters, got {}", bytes.len()),
        ));
    }
    if !bytes.iter().all(u8::is_ascii_graphic) {
        return Err(FormatError::invalid(
            "disc header",
            "id",
            format!("{id:?} contains non-printable characters"),
        ));
    }
    let mut out = [0u8; DISC_ID_LEN];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_new_header() {
        let header = DiscHeader::new("RMCP01", "Mario Kart Wii").expect("valid header");
        assert_eq!(&header.id(), b"RMCP01");
        assert_eq!(header.id_str(), "RMCP01");
        assert_eq!(header.title(), "Mario Kart Wii");
        assert!(header.is_wii());
        assert!(!header.is_gamecube());
    }

    #[test]
    fn test_invalid_ids() {
        assert!(DiscHeader::new("RMC", "x").is_err());
        assert!(DiscHeader::new("RMCP0 ", "x").is_err());
        assert!(DiscHeader::new("RMCP011", "x").is_err());
    }

    #[test]
    fn test_long_title_truncated() {
        let title = "T".repeat(100);
        let header = DiscHeader::new("ABCD01", &title).expect("valid header");
        assert_eq!(header.title().len(), TITLE_LEN - 1);
    }

    #[test]
    fn test_patch_clips_to_header() {
        let mut header = DiscHeader::default();
        assert!(header.patch(0, b"GALE01"));
        assert!(!header.patch(0, b"GALE01"));
        assert!(header.patch(0xFE, &[1, 2, 3, 4]));
        assert_eq!(header.as_bytes()[0xFE..], [1, 2]);
        assert!(!header.patch(DISC_HEADER_SIZE, &[1]));
        assert_eq!(header.id_str(), "GALE01");
    }

    #[test]
    fn test_from_bytes_truncated() {
        assert!(DiscHeader::from_bytes(&[0u8; 0xFF]).is_err());
        let bytes = [0x41u8; 0x200];
        let header = DiscHeader::from_bytes(&bytes).expect("parse");
        assert_eq!(header.id_str(), "AAAAAA");
    }
}
