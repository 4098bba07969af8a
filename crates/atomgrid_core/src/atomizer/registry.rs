//! In-process atomizer registry and selection.

use crate::atomizer::detect::{FileTypeDetector, MagicDetector};
use crate::atomizer::{
    ArchiveAtomizer, AtomizationOutput, AtomizeContext, AtomizeError, AtomizeLimits, Atomizer,
    BinaryAtomizer, NetpbmAtomizer, SafetensorsAtomizer, SourceMetadata, TextAtomizer,
};
use crate::cancel::CancellationToken;
use crate::model::validation::ValidationError;
use crate::model::warning::WarningCode;
use log::{info, warn};
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtomizerRegistryError {
    InvalidName(String),
    DuplicateName(String),
}

impl Display for AtomizerRegistryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidName(value) => write!(f, "atomizer name is invalid: {value}"),
            Self::DuplicateName(value) => write!(f, "atomizer name already registered: {value}"),
        }
    }
}

impl Error for AtomizerRegistryError {}

/// Ordered collection of atomizers plus the detector used to pick one.
pub struct AtomizerRegistry {
    atomizers: Vec<Arc<dyn Atomizer>>,
    names: BTreeSet<String>,
    detector: Arc<dyn FileTypeDetector>,
}

impl Default for AtomizerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AtomizerRegistry {
    /// Empty registry using `MagicDetector`.
    pub fn new() -> Self {
        Self {
            atomizers: Vec::new(),
            names: BTreeSet::new(),
            detector: Arc::new(MagicDetector),
        }
    }

    /// Registry with every built-in variant registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        let defaults: [Arc<dyn Atomizer>; 5] = [
            Arc::new(ArchiveAtomizer),
            Arc::new(SafetensorsAtomizer),
            Arc::new(NetpbmAtomizer),
            Arc::new(TextAtomizer),
            Arc::new(BinaryAtomizer),
        ];
        for atomizer in defaults {
            if let Err(err) = registry.register(atomizer) {
                warn!("event=atomizer_register module=atomizer status=error error={err}");
            }
        }
        registry
    }

    pub fn with_detector(mut self, detector: Arc<dyn FileTypeDetector>) -> Self {
        self.detector = detector;
        self
    }

    /// Registers one atomizer; registration order breaks priority ties.
    pub fn register(&mut self, atomizer: Arc<dyn Atomizer>) -> Result<(), AtomizerRegistryError> {
        let name = atomizer.name().trim().to_string();
        if !is_valid_name(&name) {
            return Err(AtomizerRegistryError::InvalidName(name));
        }
        if !self.names.insert(name.clone()) {
            return Err(AtomizerRegistryError::DuplicateName(name));
        }
        self.atomizers.push(atomizer);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.atomizers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.atomizers.is_empty()
    }

    /// Returns sorted atomizer names.
    pub fn names(&self) -> Vec<String> {
        self.names.iter().cloned().collect()
    }

    pub fn detector(&self) -> &Arc<dyn FileTypeDetector> {
        &self.detector
    }

    /// Capable atomizers, highest priority first, ties in registration order.
    pub fn candidates(&self, content_type: &str, extension: Option<&str>) -> Vec<Arc<dyn Atomizer>> {
        let mut capable: Vec<Arc<dyn Atomizer>> = self
            .atomizers
            .iter()
            .filter(|atomizer| atomizer.can_handle(content_type, extension))
            .cloned()
            .collect();
        capable.sort_by_key(|atomizer| std::cmp::Reverse(atomizer.priority()));
        capable
    }

    /// Highest-priority capable atomizer.
    pub fn select(&self, content_type: &str, extension: Option<&str>) -> Option<Arc<dyn Atomizer>> {
        self.candidates(content_type, extension).into_iter().next()
    }

    /// Atomizes top-level content at depth 0.
    ///
    /// # Errors
    /// - `Validation(EmptyContent)` for empty input.
    /// - `NoAtomizer` when nothing can handle the content.
    /// - `InvalidGraph` when an atomizer broke the DAG/connectivity invariant.
    pub fn atomize(
        &self,
        content: &[u8],
        source: &SourceMetadata,
        limits: AtomizeLimits,
        cancel: &CancellationToken,
    ) -> Result<AtomizationOutput, AtomizeError> {
        let started_at = Instant::now();
        let ctx = AtomizeContext::root(self, limits, cancel, source.filename.clone());
        let output = self.atomize_with(&ctx, content, source)?;
        output.validate()?;

        info!(
            "event=atomize module=atomizer status=ok bytes={} atoms={} relations={} warnings={} root={} duration_ms={}",
            content.len(),
            output.atoms().len(),
            output.relations().len(),
            output.warnings().len(),
            output.root_hash().short(),
            started_at.elapsed().as_millis()
        );
        Ok(output)
    }

    pub(crate) fn atomize_with(
        &self,
        ctx: &AtomizeContext<'_>,
        content: &[u8],
        source: &SourceMetadata,
    ) -> Result<AtomizationOutput, AtomizeError> {
        if content.is_empty() {
            return Err(ValidationError::EmptyContent.into());
        }

        let detection = self.detector.detect(content, source.filename.as_deref());
        let content_type = source
            .content_type
            .clone()
            .unwrap_or(detection.content_type);
        let extension = source.extension().or(detection.extension);

        let mut fallbacks = Vec::new();
        for atomizer in self.candidates(&content_type, extension.as_deref()) {
            match atomizer.atomize(ctx, content, source) {
                Ok(mut output) => {
                    for warning in fallbacks {
                        output.warn(warning);
                    }
                    return Ok(output);
                }
                Err(AtomizeError::Malformed { atomizer, reason }) => {
                    warn!(
                        "event=atomize module=atomizer status=warn atomizer={atomizer} depth={} fallback=true",
                        ctx.depth()
                    );
                    fallbacks.push(ctx.warning(
                        WarningCode::MalformedContent,
                        format!("{atomizer} atomizer rejected content ({reason}); fell back"),
                    ));
                }
                Err(err) => return Err(err),
            }
        }

        Err(AtomizeError::NoAtomizer { content_type })
    }
}

fn is_valid_name(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}
