//! Semantic search entry points.
//!
//! # Responsibility
//! - Run the coarse spatial prefilter and exact refinement as one query.
//! - Keep ranking rules inside core.
//!
//! # See also
//! - crate::index

pub mod engine;

pub use engine::{SearchEngine, SearchError, SearchHit, SearchOutcome, SearchParams, SearchResult};
