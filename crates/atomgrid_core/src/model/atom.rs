//! Atom domain model.
//!
//! # Responsibility
//! - Define the pre-persistence `AtomDraft` produced by atomizers.
//! - Define the persisted `AtomRecord` returned by stores.
//! - Keep size-bound and overflow rules in one constructor.
//!
//! # Invariants
//! - `atomic_value.len() <= max_atom_size` for every draft.
//! - Overflow drafts carry the full canonical payload and the overflow flag.
//! - `content_hash` is the digest of the canonical payload, so identical
//!   content always maps to the same identity within a tenant.
//!
//! # See also
//! - crate::hash

use crate::hash::{fingerprint, hash, ContentHash};
use crate::model::tenant::TenantId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable storage identifier of a persisted atom.
pub type AtomId = Uuid;

/// Content modality an atom was produced from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    Text,
    Binary,
    Image,
    Archive,
    ModelWeights,
    Embedding,
}

impl Modality {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Binary => "binary",
            Self::Image => "image",
            Self::Archive => "archive",
            Self::ModelWeights => "model_weights",
            Self::Embedding => "embedding",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "text" => Some(Self::Text),
            "binary" => Some(Self::Binary),
            "image" => Some(Self::Image),
            "archive" => Some(Self::Archive),
            "model_weights" => Some(Self::ModelWeights),
            "embedding" => Some(Self::Embedding),
            _ => None,
        }
    }
}

/// Subtype used for the single root atom of every atomizer invocation.
pub const FILE_SUBTYPE: &str = "file";

/// Atom produced by an atomizer, not yet persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtomDraft {
    pub content_hash: ContentHash,
    /// Bounded value; a fingerprint when `overflow_payload` is set.
    pub atomic_value: Vec<u8>,
    /// Full canonical payload for values larger than the atom bound.
    pub overflow_payload: Option<Vec<u8>>,
    pub modality: Modality,
    pub subtype: String,
    /// Whether the ingest pipeline should request an embedding for this atom.
    pub embeddable: bool,
}

impl AtomDraft {
    /// Builds a draft from raw content, routing oversized values through
    /// [`fingerprint`] and keeping the full value in the overflow channel.
    pub fn new(
        content: &[u8],
        modality: Modality,
        subtype: impl Into<String>,
        max_atom_size: usize,
    ) -> Self {
        let content_hash = hash(content);
        let (atomic_value, overflow_payload) = if content.len() > max_atom_size {
            (fingerprint(content, max_atom_size), Some(content.to_vec()))
        } else {
            (content.to_vec(), None)
        };

        Self {
            content_hash,
            atomic_value,
            overflow_payload,
            modality,
            subtype: subtype.into(),
            embeddable: false,
        }
    }

    /// Builds the root "file" atom for one atomizer invocation.
    pub fn file_root(content: &[u8], modality: Modality, max_atom_size: usize) -> Self {
        Self::new(content, modality, FILE_SUBTYPE, max_atom_size)
    }

    pub fn with_embeddable(mut self, embeddable: bool) -> Self {
        self.embeddable = embeddable;
        self
    }

    pub fn is_overflow(&self) -> bool {
        self.overflow_payload.is_some()
    }

    /// Full value: the overflow payload when present, else the atomic value.
    pub fn canonical_payload(&self) -> &[u8] {
        self.overflow_payload
            .as_deref()
            .unwrap_or(self.atomic_value.as_slice())
    }
}

/// Persisted atom as returned by an `AtomStore`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtomRecord {
    pub id: AtomId,
    pub content_hash: ContentHash,
    pub atomic_value: Vec<u8>,
    pub overflow: bool,
    pub overflow_payload: Option<Vec<u8>>,
    pub modality: Modality,
    pub subtype: String,
    pub tenant_id: TenantId,
    /// Number of live references; zero means GC-eligible.
    pub reference_count: u64,
    /// Unix epoch milliseconds.
    pub created_at: i64,
    /// The atom waits for an embedding until one is stored.
    #[serde(default)]
    pub embeddable: bool,
}

impl AtomRecord {
    /// Materializes a fresh record from a draft with `reference_count = 1`.
    pub fn from_draft(id: AtomId, draft: &AtomDraft, tenant_id: TenantId, created_at: i64) -> Self {
        Self {
            id,
            content_hash: draft.content_hash,
            atomic_value: draft.atomic_value.clone(),
            overflow: draft.is_overflow(),
            overflow_payload: draft.overflow_payload.clone(),
            modality: draft.modality,
            subtype: draft.subtype.clone(),
            tenant_id,
            reference_count: 1,
            created_at,
            embeddable: draft.embeddable,
        }
    }

    pub fn canonical_payload(&self) -> &[u8] {
        self.overflow_payload
            .as_deref()
            .unwrap_or(self.atomic_value.as_slice())
    }

    pub fn is_gc_eligible(&self) -> bool {
        self.reference_count == 0
    }
}

/// Current wall-clock time in Unix epoch milliseconds.
pub fn now_epoch_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}
