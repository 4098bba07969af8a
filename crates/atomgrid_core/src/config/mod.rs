//! Engine configuration.
//!
//! # Responsibility
//! - Hold every tunable of the ingest, embedding, index and search layers.
//! - Parse JSON documents with per-field defaults and validate bounds.
//!
//! # Invariants
//! - A config returned by `from_json_str` / `from_path` has passed `validate`.
//! - `basis_size * precision_bits <= 64` so curve keys fit one `u64`.

use crate::atomizer::AtomizeLimits;
use crate::curve::{CurveError, HilbertEncoder, MAX_CURVE_DIMS};
use crate::db::RetryPolicy;
use crate::embedding::WorkerSettings;
use crate::search::SearchParams;
use crate::vector::BasisStrategy;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::Path;
use std::time::Duration;

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_json::Error),
    Invalid { field: &'static str, reason: String },
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "cannot read config: {err}"),
            Self::Parse(err) => write!(f, "invalid config json: {err}"),
            Self::Invalid { field, reason } => write!(f, "invalid config `{field}`: {reason}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Parse(err) => Some(err),
            Self::Invalid { .. } => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(value: serde_json::Error) -> Self {
        Self::Parse(value)
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub max_atom_size: usize,
    pub max_recursion_depth: usize,
    pub max_tensor_elements: usize,
    pub embedding_dim: usize,
    pub basis_size: usize,
    pub basis_strategy: BasisStrategy,
    /// Seed for random resampling during basis bootstrap.
    pub basis_seed: u64,
    pub precision_bits: u32,
    pub axis_min: f32,
    pub axis_max: f32,
    pub max_key_ranges: usize,
    pub full_scan_clamp_ratio: f64,
    pub initial_radius: f32,
    pub radius_growth: f32,
    pub max_radius_retries: u32,
    pub candidate_multiplier: usize,
    pub embed_batch_size: usize,
    pub embed_max_attempts: u32,
    /// Store every embedding dimension as an atom.
    pub decompose_embeddings: bool,
    pub store_retry_attempts: u32,
    pub store_retry_backoff_ms: u64,
    /// Ingest pool size; 0 uses the rayon default.
    pub worker_threads: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_atom_size: 64,
            max_recursion_depth: 10,
            max_tensor_elements: 65_536,
            embedding_dim: 384,
            basis_size: 4,
            basis_strategy: BasisStrategy::GramSchmidt,
            basis_seed: 0x5eed,
            precision_bits: 16,
            axis_min: -1.0,
            axis_max: 1.0,
            max_key_ranges: 256,
            full_scan_clamp_ratio: 0.25,
            initial_radius: 0.1,
            radius_growth: 1.5,
            max_radius_retries: 8,
            candidate_multiplier: 4,
            embed_batch_size: 32,
            embed_max_attempts: 5,
            decompose_embeddings: false,
            store_retry_attempts: 4,
            store_retry_backoff_ms: 10,
            worker_threads: 0,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(payload: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(payload)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let payload = std::fs::read_to_string(path)?;
        Self::from_json_str(&payload)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_atom_size < 2 {
            return Err(invalid("max_atom_size", "must be at least 2"));
        }
        if self.max_tensor_elements == 0 {
            return Err(invalid("max_tensor_elements", "must be at least 1"));
        }
        if self.embedding_dim == 0 {
            return Err(invalid("embedding_dim", "must be at least 1"));
        }
        if self.basis_size == 0 || self.basis_size > MAX_CURVE_DIMS {
            return Err(invalid(
                "basis_size",
                format!("must be in 1..={MAX_CURVE_DIMS}"),
            ));
        }
        if self.basis_size > self.embedding_dim {
            return Err(invalid("basis_size", "must not exceed embedding_dim"));
        }
        if self.precision_bits == 0 || self.basis_size as u32 * self.precision_bits > 64 {
            return Err(invalid(
                "precision_bits",
                "must be positive with basis_size * precision_bits <= 64",
            ));
        }
        if !self.axis_min.is_finite() || !self.axis_max.is_finite() || self.axis_min >= self.axis_max {
            return Err(invalid("axis_min", "bounds must be finite with axis_min < axis_max"));
        }
        if self.max_key_ranges == 0 {
            return Err(invalid("max_key_ranges", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.full_scan_clamp_ratio) {
            return Err(invalid("full_scan_clamp_ratio", "must be within [0, 1]"));
        }
        if !self.initial_radius.is_finite() || self.initial_radius <= 0.0 {
            return Err(invalid("initial_radius", "must be finite and positive"));
        }
        if !self.radius_growth.is_finite() || self.radius_growth <= 1.0 {
            return Err(invalid("radius_growth", "must be finite and greater than 1"));
        }
        if self.candidate_multiplier == 0 {
            return Err(invalid("candidate_multiplier", "must be at least 1"));
        }
        if self.embed_batch_size == 0 {
            return Err(invalid("embed_batch_size", "must be at least 1"));
        }
        if self.embed_max_attempts == 0 {
            return Err(invalid("embed_max_attempts", "must be at least 1"));
        }
        if self.store_retry_attempts == 0 {
            return Err(invalid("store_retry_attempts", "must be at least 1"));
        }
        Ok(())
    }

    pub fn atomize_limits(&self) -> AtomizeLimits {
        AtomizeLimits {
            max_depth: self.max_recursion_depth,
            max_atom_size: self.max_atom_size,
            max_tensor_elements: self.max_tensor_elements,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.store_retry_attempts,
            Duration::from_millis(self.store_retry_backoff_ms),
        )
    }

    pub fn search_params(&self) -> SearchParams {
        SearchParams {
            initial_radius: self.initial_radius,
            radius_growth: self.radius_growth,
            max_radius_retries: self.max_radius_retries,
            candidate_multiplier: self.candidate_multiplier,
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            batch_size: self.embed_batch_size,
            max_attempts: self.embed_max_attempts,
            decompose: self.decompose_embeddings,
            max_atom_size: self.max_atom_size,
        }
    }

    /// Curve encoder over `basis_size` axes with the configured bounds.
    pub fn build_encoder(&self) -> Result<HilbertEncoder, CurveError> {
        HilbertEncoder::new(self.basis_size, self.precision_bits, self.axis_min, self.axis_max)
    }
}

#[cfg(test)]
mod tests {
    use super::{ConfigError, EngineConfig};
    use crate::vector::BasisStrategy;

    #[test]
    fn defaults_are_valid_and_build_an_encoder() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        let encoder = config.build_encoder().unwrap();
        assert_eq!(encoder.dims(), 4);
        assert_eq!(encoder.precision_bits(), 16);
    }

    #[test]
    fn partial_json_keeps_remaining_defaults() {
        let config = EngineConfig::from_json_str(
            r#"{"embedding_dim": 64, "basis_size": 3, "basis_strategy": "power_iteration"}"#,
        )
        .unwrap();
        assert_eq!(config.embedding_dim, 64);
        assert_eq!(config.basis_strategy, BasisStrategy::PowerIteration);
        assert_eq!(config.max_atom_size, 64);
        assert_eq!(config.atomize_limits().max_depth, 10);
    }

    #[test]
    fn oversized_keys_and_bad_growth_are_rejected() {
        let err = EngineConfig::from_json_str(r#"{"basis_size": 5, "precision_bits": 16}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "precision_bits", .. }));

        let err = EngineConfig::from_json_str(r#"{"radius_growth": 1.0}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "radius_growth", .. }));
    }

    #[test]
    fn unknown_fields_and_bad_json_are_parse_errors() {
        assert!(matches!(
            EngineConfig::from_json_str(r#"{"max_atom_sise": 12}"#),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(EngineConfig::from_json_str("{"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn reads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{"max_atom_size": 32}"#).unwrap();
        assert_eq!(EngineConfig::from_path(&path).unwrap().max_atom_size, 32);
        assert!(matches!(
            EngineConfig::from_path(dir.path().join("missing.json")),
            Err(ConfigError::Io(_))
        ));
    }
}
