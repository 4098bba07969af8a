//! Content atomization.
//!
//! # Responsibility
//! - Decompose content of one modality into size-bounded atoms and relations.
//! - Select the highest-priority capable variant through `AtomizerRegistry`.
//! - Thread recursion depth and cancellation through nested content.
//!
//! # Invariants
//! - Every invocation produces exactly one root "file" atom and every other
//!   atom is reachable from it.
//! - Relations form a DAG; self-references are dropped with a warning.
//! - Atomization never persists anything; callers batch the output into an
//!   `AtomStore`.
//! - Recursion past `max_depth` and cancellation yield warnings plus partial
//!   output, never an error.
//!
//! # See also
//! - crate::repo::atom_repo

use crate::cancel::CancellationToken;
use crate::hash::ContentHash;
use crate::model::atom::{AtomDraft, Modality};
use crate::model::relation::{is_acyclic, reachable_from, AtomRelation, RelationType};
use crate::model::validation::ValidationError;
use crate::model::warning::{IngestWarning, WarningCode};
use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod archive;
pub mod binary;
pub mod detect;
pub mod image;
pub mod registry;
pub mod text;
pub mod weights;

pub use archive::{write_ustar, ArchiveAtomizer};
pub use binary::BinaryAtomizer;
pub use detect::{Detection, FileTypeDetector, MagicDetector};
pub use image::NetpbmAtomizer;
pub use registry::{AtomizerRegistry, AtomizerRegistryError};
pub use text::TextAtomizer;
pub use weights::{write_safetensors, SafetensorsAtomizer};

/// One modality-specific decomposition strategy.
pub trait Atomizer: Send + Sync {
    /// Stable lowercase identifier, unique within a registry.
    fn name(&self) -> &str;

    /// Higher wins when several variants can handle the same content.
    fn priority(&self) -> i32;

    fn can_handle(&self, content_type: &str, extension: Option<&str>) -> bool;

    /// Returns `AtomizeError::Malformed` when content does not decode in this
    /// format; the registry then falls back to the next capable variant.
    fn atomize(
        &self,
        ctx: &AtomizeContext<'_>,
        content: &[u8],
        source: &SourceMetadata,
    ) -> Result<AtomizationOutput, AtomizeError>;
}

/// Caller-provided description of the content being ingested.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceMetadata {
    pub filename: Option<String>,
    /// Explicit MIME type; detected from content when absent.
    pub content_type: Option<String>,
}

impl SourceMetadata {
    pub fn named(filename: impl Into<String>) -> Self {
        Self {
            filename: Some(filename.into()),
            content_type: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Lowercased extension of `filename`, without the dot.
    pub fn extension(&self) -> Option<String> {
        let name = self.filename.as_deref()?;
        let base = name.rsplit('/').next().unwrap_or(name);
        let (stem, ext) = base.rsplit_once('.')?;
        if stem.is_empty() || ext.is_empty() {
            return None;
        }
        Some(ext.to_ascii_lowercase())
    }
}

/// Bounds applied to every atomizer invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtomizeLimits {
    pub max_depth: usize,
    pub max_atom_size: usize,
    pub max_tensor_elements: usize,
}

impl Default for AtomizeLimits {
    fn default() -> Self {
        Self {
            max_depth: 10,
            max_atom_size: 64,
            max_tensor_elements: 65_536,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtomizeError {
    Validation(ValidationError),
    /// Content does not decode in the format the atomizer handles.
    Malformed { atomizer: String, reason: String },
    NoAtomizer { content_type: String },
    /// Output violated the DAG or connectivity invariant.
    InvalidGraph(String),
}

impl AtomizeError {
    pub fn malformed(atomizer: &str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            atomizer: atomizer.to_string(),
            reason: reason.into(),
        }
    }
}

impl Display for AtomizeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(err) => write!(f, "{err}"),
            Self::Malformed { atomizer, reason } => {
                write!(f, "{atomizer} atomizer rejected content: {reason}")
            }
            Self::NoAtomizer { content_type } => {
                write!(f, "no atomizer can handle content type `{content_type}`")
            }
            Self::InvalidGraph(reason) => write!(f, "atomization produced an invalid graph: {reason}"),
        }
    }
}

impl Error for AtomizeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Validation(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ValidationError> for AtomizeError {
    fn from(value: ValidationError) -> Self {
        Self::Validation(value)
    }
}

type RelationKey = (ContentHash, ContentHash, RelationType, Option<u64>);

/// Atoms, relations and warnings of one atomizer invocation.
///
/// Atoms are deduplicated by hash in first-seen order; the root is always the
/// first atom.
#[derive(Debug, Clone)]
pub struct AtomizationOutput {
    atoms: Vec<AtomDraft>,
    relations: Vec<AtomRelation>,
    warnings: Vec<IngestWarning>,
    positions: HashMap<ContentHash, usize>,
    relation_keys: HashSet<RelationKey>,
}

impl AtomizationOutput {
    pub fn new(root: AtomDraft) -> Self {
        let mut positions = HashMap::new();
        positions.insert(root.content_hash, 0);
        Self {
            atoms: vec![root],
            relations: Vec::new(),
            warnings: Vec::new(),
            positions,
            relation_keys: HashSet::new(),
        }
    }

    pub fn root(&self) -> &AtomDraft {
        &self.atoms[0]
    }

    pub fn root_hash(&self) -> ContentHash {
        self.atoms[0].content_hash
    }

    pub fn atoms(&self) -> &[AtomDraft] {
        &self.atoms
    }

    pub fn relations(&self) -> &[AtomRelation] {
        &self.relations
    }

    pub fn warnings(&self) -> &[IngestWarning] {
        &self.warnings
    }

    pub fn has_warning(&self, code: WarningCode) -> bool {
        self.warnings.iter().any(|warning| warning.code == code)
    }

    /// Adds `draft` unless its hash is already present; returns its hash.
    pub fn add_atom(&mut self, draft: AtomDraft) -> ContentHash {
        let hash = draft.content_hash;
        match self.positions.get(&hash) {
            Some(position) => {
                let existing = &mut self.atoms[*position];
                existing.embeddable |= draft.embeddable;
            }
            None => {
                self.positions.insert(hash, self.atoms.len());
                self.atoms.push(draft);
            }
        }
        hash
    }

    /// Adds a relation; repeated keys are ignored, self-loops are dropped.
    pub fn add_relation(&mut self, relation: AtomRelation) {
        if relation.is_self_loop() {
            self.warn(IngestWarning::new(
                WarningCode::SelfReferenceDropped,
                format!("relation {} -> itself dropped", relation.parent_hash.short()),
            ));
            return;
        }
        let key = (
            relation.parent_hash,
            relation.child_hash,
            relation.relation_type,
            relation.sequence_index,
        );
        if self.relation_keys.insert(key) {
            self.relations.push(relation);
        }
    }

    /// Adds `draft` as a child of `parent` at `sequence_index`.
    pub fn attach(
        &mut self,
        parent: ContentHash,
        draft: AtomDraft,
        relation_type: RelationType,
        sequence_index: u64,
    ) -> ContentHash {
        let child = self.add_atom(draft);
        self.add_relation(AtomRelation::new(parent, child, relation_type).at(sequence_index));
        child
    }

    pub fn warn(&mut self, warning: IngestWarning) {
        self.warnings.push(warning);
    }

    /// Merges a nested output and returns its root hash.
    ///
    /// The caller links the returned root to one of its own atoms.
    pub fn absorb(&mut self, child: AtomizationOutput) -> ContentHash {
        let root = child.root_hash();
        for atom in child.atoms {
            self.add_atom(atom);
        }
        for relation in child.relations {
            self.add_relation(relation);
        }
        self.warnings.extend(child.warnings);
        root
    }

    /// Checks acyclicity and that every atom is reachable from the root.
    pub fn validate(&self) -> Result<(), AtomizeError> {
        if !is_acyclic(&self.relations) {
            return Err(AtomizeError::InvalidGraph("relations contain a cycle".to_string()));
        }
        let reachable = reachable_from(self.root_hash(), &self.relations);
        if let Some(orphan) = self
            .atoms
            .iter()
            .find(|atom| !reachable.contains(&atom.content_hash))
        {
            return Err(AtomizeError::InvalidGraph(format!(
                "atom {} is not reachable from root {}",
                orphan.content_hash.short(),
                self.root_hash().short()
            )));
        }
        Ok(())
    }

    pub fn into_parts(self) -> (Vec<AtomDraft>, Vec<AtomRelation>, Vec<IngestWarning>) {
        (self.atoms, self.relations, self.warnings)
    }
}

/// Result of dispatching nested content back through the registry.
#[derive(Debug)]
pub enum ChildOutcome {
    Atomized(AtomizationOutput),
    /// Nested content lies beyond `max_depth`; nothing was produced.
    DepthExceeded,
    /// Cancellation was requested before the child started.
    Cancelled,
}

/// Per-invocation state handed to atomizers.
pub struct AtomizeContext<'a> {
    registry: &'a AtomizerRegistry,
    limits: AtomizeLimits,
    cancel: &'a CancellationToken,
    depth: usize,
    path: Option<String>,
}

impl<'a> AtomizeContext<'a> {
    pub(crate) fn root(
        registry: &'a AtomizerRegistry,
        limits: AtomizeLimits,
        cancel: &'a CancellationToken,
        path: Option<String>,
    ) -> Self {
        Self {
            registry,
            limits,
            cancel,
            depth: 0,
            path,
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn limits(&self) -> AtomizeLimits {
        self.limits
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn draft(&self, content: &[u8], modality: Modality, subtype: &str) -> AtomDraft {
        AtomDraft::new(content, modality, subtype, self.limits.max_atom_size)
    }

    pub fn file_root(&self, content: &[u8], modality: Modality) -> AtomDraft {
        AtomDraft::file_root(content, modality, self.limits.max_atom_size)
    }

    /// Warning located at the current source path.
    pub fn warning(&self, code: WarningCode, message: impl Into<String>) -> IngestWarning {
        let warning = IngestWarning::new(code, message);
        match &self.path {
            Some(path) => warning.at_path(path.clone()),
            None => warning,
        }
    }

    /// Records a cancellation warning once and returns `true` when cancelled.
    pub fn stop_if_cancelled(&self, output: &mut AtomizationOutput) -> bool {
        if !self.is_cancelled() {
            return false;
        }
        if !output.has_warning(WarningCode::Cancelled) {
            output.warn(self.warning(
                WarningCode::Cancelled,
                "atomization stopped early; output is partial",
            ));
        }
        true
    }

    /// Atomizes nested content one level deeper.
    pub fn dispatch_child(
        &self,
        content: &[u8],
        source: &SourceMetadata,
    ) -> Result<ChildOutcome, AtomizeError> {
        if self.is_cancelled() {
            return Ok(ChildOutcome::Cancelled);
        }
        let depth = self.depth + 1;
        if depth > self.limits.max_depth {
            return Ok(ChildOutcome::DepthExceeded);
        }

        let child_path = match (&self.path, &source.filename) {
            (Some(parent), Some(name)) => Some(format!("{parent}/{name}")),
            (None, Some(name)) => Some(name.clone()),
            (parent, None) => parent.clone(),
        };
        let child = AtomizeContext {
            registry: self.registry,
            limits: self.limits,
            cancel: self.cancel,
            depth,
            path: child_path,
        };
        self.registry
            .atomize_with(&child, content, source)
            .map(ChildOutcome::Atomized)
    }
}

#[cfg(test)]
mod tests {
    use super::{AtomizationOutput, SourceMetadata};
    use crate::model::atom::{AtomDraft, Modality};
    use crate::model::relation::{AtomRelation, RelationType};
    use crate::model::warning::WarningCode;

    #[test]
    fn extension_is_lowercased_and_requires_a_stem() {
        assert_eq!(SourceMetadata::named("dir/Photo.PGM").extension().as_deref(), Some("pgm"));
        assert_eq!(SourceMetadata::named(".bashrc").extension(), None);
        assert_eq!(SourceMetadata::default().extension(), None);
    }

    #[test]
    fn output_dedups_atoms_and_drops_self_loops() {
        let root = AtomDraft::file_root(b"root content", Modality::Text, 64);
        let root_hash = root.content_hash;
        let mut output = AtomizationOutput::new(root);

        let token = AtomDraft::new(b"tok", Modality::Text, "word", 64);
        output.attach(root_hash, token.clone(), RelationType::Sequence, 0);
        output.attach(root_hash, token, RelationType::Sequence, 1);
        output.add_relation(AtomRelation::new(root_hash, root_hash, RelationType::Reference));

        assert_eq!(output.atoms().len(), 2);
        assert_eq!(output.relations().len(), 2);
        assert!(output.has_warning(WarningCode::SelfReferenceDropped));
        assert!(output.validate().is_ok());
    }

    #[test]
    fn validate_rejects_orphans() {
        let mut output = AtomizationOutput::new(AtomDraft::file_root(b"r", Modality::Binary, 64));
        output.add_atom(AtomDraft::new(b"orphan", Modality::Binary, "chunk", 64));
        assert!(output.validate().is_err());
    }
}
