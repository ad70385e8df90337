//! Error types for on-disk structure parsing and validation

use thiserror::Error;

/// Errors produced while decoding or validating container structures.
#[derive(Error, Debug)]
pub enum FormatError {
    /// The bytes do not carry this format's magic. Not a failure of the
    /// format itself: the caller may try another one.
    #[error("{format}: bad magic, expected {expected}, got {found}")]
    BadMagic {
        /// Format being probed
        format: &'static str,
        /// Expected magic, hex encoded
        expected: String,
        /// Magic found in the data, hex encoded
        found: String,
    },

    /// The magic matched but a header field is self-inconsistent.
    #[error("{format}: invalid {field}: {reason}")]
    InvalidField {
        /// Format being parsed
        format: &'static str,
        /// Header field name
        field: &'static str,
        /// Why the value was rejected
        reason: String,
    },

    /// Input shorter than the fixed structure size.
    #[error("{format}: truncated data, expected {expected} bytes, got {actual}")]
    Truncated {
        /// Format being parsed
        format: &'static str,
        /// Required size
        expected: usize,
        /// Available size
        actual: usize,
    },

    /// No legal geometry exists for the given partition dimensions.
    #[error("WBFS geometry: {0}")]
    Geometry(String),

    /// Binary format parsing error from binrw
    #[error("Binary format error: {0}")]
    Binary(#[from] binrw::Error),
}

impl FormatError {
    /// Build a [`FormatError::BadMagic`] from raw magic bytes.
    pub fn bad_magic(format: &'static str, expected: &[u8], found: &[u8]) -> Self {
        Self::BadMagic {
            format,
            expected: hex::encode(expected),
            found: hex::encode(found),
        }
    }

    /// Build a [`FormatError::InvalidField`].
    pub fn invalid(format: &'static str, field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            format,
            field,
            reason: reason.into(),
        }
    }

    /// Whether this error only means "these bytes are some other format".
    pub const fn is_mismatch(&self) -> bool {
        matches!(self, Self::BadMagic { .. })
    }
}

/// Require `data` to hold at least `expected` bytes.
pub(crate) fn ensure_len(
    format: &'static str,
    data: &[u8],
    expected: usize,
) -> Result<(), FormatError> {
    if data.len() < expected {
        return Err(FormatError::Truncated {
            format,
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}
