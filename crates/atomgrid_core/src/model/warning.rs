//! Non-fatal conditions reported alongside partial results.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningCode {
    /// Nested content deeper than the configured limit was skipped.
    RecursionLimitExceeded,
    /// Work stopped early on a cancellation request.
    Cancelled,
    /// Content claimed a format but could not be decoded; fallback applied.
    MalformedContent,
    /// Archive entry type that carries no content (links, devices).
    UnsupportedEntry,
    /// Elements (tensor values, pixels) beyond the configured cap were not atomized.
    ElementLimitReached,
    /// Embedding could not be produced now; retried later.
    EmbeddingDeferred,
    /// Embedding gave up after the retry ceiling.
    EmbeddingFailed,
    /// Relation whose parent equals its child was dropped.
    SelfReferenceDropped,
}

impl WarningCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RecursionLimitExceeded => "recursion_limit_exceeded",
            Self::Cancelled => "cancelled",
            Self::MalformedContent => "malformed_content",
            Self::UnsupportedEntry => "unsupported_entry",
            Self::ElementLimitReached => "element_limit_reached",
            Self::EmbeddingDeferred => "embedding_deferred",
            Self::EmbeddingFailed => "embedding_failed",
            Self::SelfReferenceDropped => "self_reference_dropped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestWarning {
    pub code: WarningCode,
    pub message: String,
    /// Location inside the source, e.g. an archive entry path.
    pub path: Option<String>,
}

impl IngestWarning {
    pub fn new(code: WarningCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            path: None,
        }
    }

    pub fn at_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }
}

impl Display for IngestWarning {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.path {
            Some(path) => write!(f, "{} at `{}`: {}", self.code.as_str(), path, self.message),
            None => write!(f, "{}: {}", self.code.as_str(), self.message),
        }
    }
}
