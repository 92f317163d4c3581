// ABOUTME: Watermark value type for incremental exchange - last seen row version per entity
// ABOUTME: Fixed 8-byte marker ordered as a big-endian unsigned 64-bit counter

use serde::{Deserialize, Serialize};
use std::fmt;

use super::row::MappingError;

/// Width of a watermark in bytes.
pub const WATERMARK_LEN: usize = 8;

/// High-water mark of a source row version.
///
/// Source rows carry an 8-byte version that grows on every modification. The
/// exchange only ever compares and persists these values, so the type exposes
/// ordering and byte conversion and nothing else. Ordering is the ordering of
/// the bytes read as a big-endian `u64`, independent of platform endianness.
///
/// The all-zero value means "never synced" and is also what a pass reports when
/// it saw no rows, so it must never overwrite a persisted watermark.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Watermark([u8; WATERMARK_LEN]);

impl Watermark {
    /// The "never synced" sentinel.
    pub const ZERO: Watermark = Watermark([0; WATERMARK_LEN]);

    pub fn from_bytes(bytes: [u8; WATERMARK_LEN]) -> Self {
        Self(bytes)
    }

    /// Build a watermark from a byte slice read from a store.
    ///
    /// The slice must be exactly 8 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, MappingError> {
        let array: [u8; WATERMARK_LEN] = bytes.try_into().map_err(|_| {
            MappingError::new(
                "version",
                format!(
                    "expected {} bytes for a watermark, got {}",
                    WATERMARK_LEN,
                    bytes.len()
                ),
            )
        })?;
        Ok(Self(array))
    }

    pub fn from_u64(value: u64) -> Self {
        Self(value.to_be_bytes())
    }

    pub fn as_u64(&self) -> u64 {
        u64::from_be_bytes(self.0)
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; WATERMARK_LEN]
    }

    /// Raise `self` to `candidate` if the candidate is newer.
    ///
    /// Returns true when the watermark moved.
    pub fn advance_to(&mut self, candidate: Watermark) -> bool {
        if candidate > *self {
            *self = candidate;
            true
        } else {
            false
        }
    }
}

impl Ord for Watermark {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.as_u64().cmp(&other.as_u64())
    }
}

impl PartialOrd for Watermark {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl From<u64> for Watermark {
    fn from(value: u64) -> Self {
        Self::from_u64(value)
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x")?;
        for byte in self.0 {
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}
