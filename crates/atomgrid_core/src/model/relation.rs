//! Atom relation model.
//!
//! # Responsibility
//! - Describe typed, ordered edges between atoms by content hash.
//! - Provide the DAG check used by atomizer tests and the ingest pipeline.
//!
//! # Invariants
//! - Relations are keyed by `(parent_hash, child_hash, relation_type, sequence_index)`.
//! - Relation sets produced by one atomizer invocation form a DAG rooted at
//!   the invocation's file atom.

use crate::hash::ContentHash;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    ParentChild,
    Sequence,
    EmbeddingDimension,
    Reference,
}

impl RelationType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ParentChild => "parent_child",
            Self::Sequence => "sequence",
            Self::EmbeddingDimension => "embedding_dimension",
            Self::Reference => "reference",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "parent_child" => Some(Self::ParentChild),
            "sequence" => Some(Self::Sequence),
            "embedding_dimension" => Some(Self::EmbeddingDimension),
            "reference" => Some(Self::Reference),
            _ => None,
        }
    }
}

/// Optional positional data attached to a relation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SpatialMetadata {
    /// Pixel position inside an image.
    Pixel { x: u32, y: u32 },
    /// Byte range inside the parent payload.
    ByteRange { offset: u64, length: u64 },
    /// Tensor shape owning an element, for weight atoms.
    Tensor { shape: Vec<u64> },
    /// Projected coordinate of the owning embedding.
    Projection { basis_version: u32, coordinate: Vec<f32> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomRelation {
    pub parent_hash: ContentHash,
    pub child_hash: ContentHash,
    pub relation_type: RelationType,
    pub sequence_index: Option<u64>,
    pub weight: Option<f32>,
    pub spatial: Option<SpatialMetadata>,
}

impl AtomRelation {
    pub fn new(parent_hash: ContentHash, child_hash: ContentHash, relation_type: RelationType) -> Self {
        Self {
            parent_hash,
            child_hash,
            relation_type,
            sequence_index: None,
            weight: None,
            spatial: None,
        }
    }

    pub fn at(mut self, sequence_index: u64) -> Self {
        self.sequence_index = Some(sequence_index);
        self
    }

    pub fn with_weight(mut self, weight: f32) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn with_spatial(mut self, spatial: SpatialMetadata) -> Self {
        self.spatial = Some(spatial);
        self
    }

    pub fn is_self_loop(&self) -> bool {
        self.parent_hash == self.child_hash
    }
}

/// Returns `true` when the relation set contains no directed cycle.
pub fn is_acyclic(relations: &[AtomRelation]) -> bool {
    let mut edges: BTreeMap<ContentHash, BTreeSet<ContentHash>> = BTreeMap::new();
    for relation in relations {
        edges
            .entry(relation.parent_hash)
            .or_default()
            .insert(relation.child_hash);
    }

    // 0 = unvisited, 1 = on stack, 2 = done
    let mut state: BTreeMap<ContentHash, u8> = BTreeMap::new();
    for start in edges.keys() {
        if state.get(start).copied().unwrap_or(0) != 0 {
            continue;
        }
        let mut stack: Vec<(ContentHash, Vec<ContentHash>)> = vec![(
            *start,
            edges.get(start).map(|set| set.iter().copied().collect()).unwrap_or_default(),
        )];
        state.insert(*start, 1);

        while let Some((node, pending)) = stack.last_mut() {
            match pending.pop() {
                Some(next) => match state.get(&next).copied().unwrap_or(0) {
                    1 => return false,
                    2 => {}
                    _ => {
                        state.insert(next, 1);
                        let children = edges
                            .get(&next)
                            .map(|set| set.iter().copied().collect())
                            .unwrap_or_default();
                        stack.push((next, children));
                    }
                },
                None => {
                    state.insert(*node, 2);
                    stack.pop();
                }
            }
        }
    }
    true
}

/// Returns every hash reachable from `root` (inclusive).
pub fn reachable_from(root: ContentHash, relations: &[AtomRelation]) -> BTreeSet<ContentHash> {
    let mut edges: BTreeMap<ContentHash, Vec<ContentHash>> = BTreeMap::new();
    for relation in relations {
        edges
            .entry(relation.parent_hash)
            .or_default()
            .push(relation.child_hash);
    }

    let mut seen = BTreeSet::from([root]);
    let mut frontier = vec![root];
    while let Some(node) = frontier.pop() {
        for child in edges.get(&node).into_iter().flatten() {
            if seen.insert(*child) {
                frontier.push(*child);
            }
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::{is_acyclic, reachable_from, AtomRelation, RelationType, SpatialMetadata};
    use crate::hash::hash;

    #[test]
    fn detects_cycles_and_accepts_shared_children() {
        let (a, b, c) = (hash(b"a"), hash(b"b"), hash(b"c"));
        let diamond = vec![
            AtomRelation::new(a, b, RelationType::ParentChild),
            AtomRelation::new(a, c, RelationType::ParentChild),
            AtomRelation::new(b, c, RelationType::Sequence).at(0),
        ];
        assert!(is_acyclic(&diamond));
        assert_eq!(reachable_from(a, &diamond).len(), 3);

        let mut cyclic = diamond.clone();
        cyclic.push(AtomRelation::new(c, a, RelationType::Reference));
        assert!(!is_acyclic(&cyclic));
    }

    #[test]
    fn spatial_metadata_uses_tagged_wire_shape() {
        let value = serde_json::to_value(SpatialMetadata::Pixel { x: 3, y: 4 }).unwrap();
        assert_eq!(value["kind"], "pixel");
        assert_eq!(value["x"], 3);
    }
}
