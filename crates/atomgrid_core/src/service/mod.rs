//! Core use-case services.
//!
//! # Responsibility
//! - Orchestrate atomizers, stores, embedding and search into use-case APIs.
//! - Keep the CLI decoupled from storage details.

pub mod engine;
pub mod ingest;

pub use engine::{Engine, EngineError, EngineResult};
pub use ingest::{IngestError, IngestReport, IngestRequest, IngestService};
