//! Two-phase nearest-neighbour search.
//!
//! # Responsibility
//! - Phase 1: project the query and collect spatial candidates, growing the
//!   radius geometrically until enough candidates exist or retries run out.
//! - Phase 2: score candidates by exact cosine similarity against stored
//!   native embeddings and return the top `k`.
//!
//! # Invariants
//! - Escalation is bounded by `max_radius_retries`.
//! - Ranking is deterministic: score descending, then atom id ascending.
//! - An empty candidate set is a valid empty result.
//! - One query runs against one index generation from start to finish.

use crate::index::{GenerationCell, IndexError, IndexGeneration};
use crate::model::atom::AtomId;
use crate::model::tenant::TenantId;
use crate::model::validation::{validate_vector, ValidationError};
use crate::repo::{EmbeddingStore, StoreError};
use crate::vector::math::cosine_similarity;
use log::info;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Instant;

pub type SearchResult<T> = Result<T, SearchError>;

#[derive(Debug)]
pub enum SearchError {
    Validation(ValidationError),
    Index(IndexError),
    Store(StoreError),
    /// No landmark basis has been bootstrapped yet.
    NotBootstrapped,
}

impl Display for SearchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(err) => write!(f, "{err}"),
            Self::Index(err) => write!(f, "{err}"),
            Self::Store(err) => write!(f, "{err}"),
            Self::NotBootstrapped => write!(f, "search requires a bootstrapped landmark basis"),
        }
    }
}

impl Error for SearchError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Validation(err) => Some(err),
            Self::Index(err) => Some(err),
            Self::Store(err) => Some(err),
            Self::NotBootstrapped => None,
        }
    }
}

impl From<ValidationError> for SearchError {
    fn from(value: ValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<IndexError> for SearchError {
    fn from(value: IndexError) -> Self {
        Self::Index(value)
    }
}

impl From<StoreError> for SearchError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

/// Phase-1 escalation settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchParams {
    pub initial_radius: f32,
    /// Multiplier applied to the radius after an insufficient pass.
    pub radius_growth: f32,
    pub max_radius_retries: u32,
    /// Candidates wanted per requested hit.
    pub candidate_multiplier: usize,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            initial_radius: 0.1,
            radius_growth: 1.5,
            max_radius_retries: 8,
            candidate_multiplier: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub atom_id: AtomId,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchOutcome {
    /// Best hits, score descending.
    pub hits: Vec<SearchHit>,
    /// Size of the Phase-1 candidate pool.
    pub candidates: usize,
    /// Radius of the final Phase-1 pass.
    pub radius: f32,
    /// Escalations performed.
    pub retries: u32,
    pub basis_version: u32,
}

enum SearchState {
    Start,
    Project {
        generation: Arc<IndexGeneration>,
    },
    Prefilter {
        generation: Arc<IndexGeneration>,
        center: Vec<f32>,
        radius: f32,
        retries: u32,
    },
    Refine {
        basis_version: u32,
        candidates: Vec<AtomId>,
        radius: f32,
        retries: u32,
    },
    Rank {
        scored: Vec<SearchHit>,
        outcome: SearchOutcome,
    },
    Done(SearchOutcome),
}

pub struct SearchEngine {
    generations: Arc<GenerationCell>,
    embeddings: Arc<dyn EmbeddingStore>,
    params: SearchParams,
}

impl SearchEngine {
    pub fn new(
        generations: Arc<GenerationCell>,
        embeddings: Arc<dyn EmbeddingStore>,
        params: SearchParams,
    ) -> Self {
        Self {
            generations,
            embeddings,
            params,
        }
    }

    pub fn params(&self) -> SearchParams {
        self.params
    }

    /// Returns up to `top_k` atoms of `tenant` most similar to `query`.
    ///
    /// # Errors
    /// - `Validation` for a zero `top_k` or a malformed query embedding.
    /// - `NotBootstrapped` before the first basis exists.
    pub fn search(&self, query: &[f32], top_k: usize, tenant: &TenantId) -> SearchResult<SearchOutcome> {
        let started_at = Instant::now();
        let wanted = top_k.saturating_mul(self.params.candidate_multiplier.max(1));
        let mut state = SearchState::Start;

        let outcome = loop {
            state = match state {
                SearchState::Start => {
                    if top_k == 0 {
                        return Err(ValidationError::ZeroTopK.into());
                    }
                    let generation = self
                        .generations
                        .current()
                        .ok_or(SearchError::NotBootstrapped)?;
                    SearchState::Project { generation }
                }
                SearchState::Project { generation } => {
                    validate_vector(query, generation.projector().input_dim())?;
                    let center = generation.project(query)?;
                    SearchState::Prefilter {
                        generation,
                        center,
                        radius: self.params.initial_radius,
                        retries: 0,
                    }
                }
                SearchState::Prefilter {
                    generation,
                    center,
                    radius,
                    retries,
                } => {
                    let index = generation.index();
                    let candidates = index.range_query(&center, radius, Some(tenant))?;
                    let exhausted = candidates.len() >= index.tenant_len(tenant)?;
                    if candidates.len() >= wanted
                        || exhausted
                        || retries >= self.params.max_radius_retries
                    {
                        SearchState::Refine {
                            basis_version: generation.basis_version(),
                            candidates,
                            radius,
                            retries,
                        }
                    } else {
                        SearchState::Prefilter {
                            generation,
                            center,
                            radius: radius * self.params.radius_growth,
                            retries: retries + 1,
                        }
                    }
                }
                SearchState::Refine {
                    basis_version,
                    candidates,
                    radius,
                    retries,
                } => {
                    let vectors = self.embeddings.latest_many(&candidates)?;
                    let scored = candidates
                        .iter()
                        .filter_map(|atom_id| {
                            let vector = vectors.get(atom_id)?;
                            (vector.len() == query.len()).then(|| SearchHit {
                                atom_id: *atom_id,
                                score: cosine_similarity(query, vector),
                            })
                        })
                        .collect();
                    SearchState::Rank {
                        scored,
                        outcome: SearchOutcome {
                            hits: Vec::new(),
                            candidates: candidates.len(),
                            radius,
                            retries,
                            basis_version,
                        },
                    }
                }
                SearchState::Rank {
                    mut scored,
                    mut outcome,
                } => {
                    scored.sort_by(rank_order);
                    scored.truncate(top_k);
                    outcome.hits = scored;
                    SearchState::Done(outcome)
                }
                SearchState::Done(outcome) => break outcome,
            };
        };

        info!(
            "event=search module=search status=ok tenant={} top_k={top_k} basis_version={} candidates={} hits={} radius={:.4} retries={} duration_ms={}",
            tenant,
            outcome.basis_version,
            outcome.candidates,
            outcome.hits.len(),
            outcome.radius,
            outcome.retries,
            started_at.elapsed().as_millis()
        );
        Ok(outcome)
    }
}

fn rank_order(a: &SearchHit, b: &SearchHit) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.atom_id.cmp(&b.atom_id))
}
