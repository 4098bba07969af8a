//! Content hashing and fingerprinting.
//!
//! # Responsibility
//! - Derive the fixed-width `ContentHash` that identifies an atom.
//! - Pack oversized values into a bounded fingerprint.
//!
//! # Invariants
//! - Both operations are pure: same input bytes, same output bytes.
//! - `fingerprint(x, n) == x` whenever `x.len() <= n`.

pub mod content_hasher;

pub use content_hasher::{fingerprint, hash, ContentHash, HashParseError, CONTENT_HASH_LEN};
