//! Space-filling curve mapping of projected coordinates to sortable keys.
//!
//! # Responsibility
//! - Turn `B`-dimensional coordinates into one-dimensional `u64` keys that
//!   preserve locality well enough for B-tree range scans.
//! - Turn a query box into a bounded set of key intervals.
//!
//! # See also
//! - crate::index

pub mod hilbert;

pub use hilbert::{CurveError, EncodedKey, HilbertEncoder, KeyRanges, MAX_CURVE_DIMS};
