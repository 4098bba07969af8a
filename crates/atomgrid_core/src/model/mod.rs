//! Domain model for content-addressed atoms.
//!
//! # Responsibility
//! - Define canonical data structures shared by atomizers, stores and search.
//! - Keep identity rules (`ContentHash` + `TenantId`) in one place.
//!
//! # Invariants
//! - `(content_hash, tenant_id)` identifies exactly one logical atom.
//! - Relations reference atoms by content hash, never by storage id.

pub mod atom;
pub mod relation;
pub mod tenant;
pub mod validation;
pub mod warning;
