//! SHA-256 content hasher.
//!
//! # Responsibility
//! - Provide the canonical digest used for atom identity.
//! - Provide the bounded fingerprint stored as `AtomicValue` for overflow atoms.
//!
//! # Invariants
//! - Digest width is always `CONTENT_HASH_LEN` bytes.
//! - Fingerprint output length is `min(len(bytes), max_size)`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};

/// Digest width in bytes.
pub const CONTENT_HASH_LEN: usize = 32;

/// Fixed-width digest identifying one atom value within a tenant.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentHash([u8; CONTENT_HASH_LEN]);

impl ContentHash {
    pub fn from_bytes(bytes: [u8; CONTENT_HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// Builds a hash from a persisted slice.
    ///
    /// Returns `None` when the slice is not exactly `CONTENT_HASH_LEN` bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; CONTENT_HASH_LEN] = bytes.try_into().ok()?;
        Some(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; CONTENT_HASH_LEN] {
        &self.0
    }

    /// Lowercase hex rendering, 64 characters.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short hex prefix used in log lines.
    pub fn short(&self) -> String {
        self.to_hex()[..12].to_string()
    }

    /// Parses a 64-character hex string (case-insensitive).
    pub fn from_hex(value: &str) -> Result<Self, HashParseError> {
        let trimmed = value.trim();
        if trimmed.len() != CONTENT_HASH_LEN * 2 {
            return Err(HashParseError::InvalidLength(trimmed.len()));
        }

        let mut bytes = [0_u8; CONTENT_HASH_LEN];
        hex::decode_to_slice(trimmed, &mut bytes)?;
        Ok(Self(bytes))
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Debug for ContentHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContentHash({})", self.short())
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::from_hex(&text).map_err(serde::de::Error::custom)
    }
}

/// Error returned when parsing a hex content hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashParseError {
    InvalidLength(usize),
    InvalidDigit,
}

impl Display for HashParseError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidLength(len) => write!(
                f,
                "content hash must be {} hex characters, got {len}",
                CONTENT_HASH_LEN * 2
            ),
            Self::InvalidDigit => write!(f, "content hash contains a non-hex character"),
        }
    }
}

impl Error for HashParseError {}

impl From<hex::FromHexError> for HashParseError {
    fn from(err: hex::FromHexError) -> Self {
        match err {
            hex::FromHexError::InvalidStringLength | hex::FromHexError::OddLength => {
                Self::InvalidLength(CONTENT_HASH_LEN * 2)
            }
            hex::FromHexError::InvalidHexCharacter { .. } => Self::InvalidDigit,
        }
    }
}

/// Computes the canonical digest of `bytes`.
pub fn hash(bytes: &[u8]) -> ContentHash {
    let digest = Sha256::digest(bytes);
    let mut out = [0_u8; CONTENT_HASH_LEN];
    out.copy_from_slice(&digest);
    ContentHash(out)
}

/// Packs `bytes` into at most `max_size` bytes.
///
/// Values that already fit are returned unchanged. Larger values become
/// `digest-prefix ‖ content-prefix`, where the digest part takes half of the
/// budget (capped at the digest width) and the content part takes the rest.
pub fn fingerprint(bytes: &[u8], max_size: usize) -> Vec<u8> {
    if bytes.len() <= max_size {
        return bytes.to_vec();
    }

    let digest = hash(bytes);
    let digest_len = (max_size / 2).min(CONTENT_HASH_LEN);
    let content_len = max_size - digest_len;

    let mut out = Vec::with_capacity(max_size);
    out.extend_from_slice(&digest.as_bytes()[..digest_len]);
    out.extend_from_slice(&bytes[..content_len]);
    out
}
