//! Fallback atomizer: fixed-size byte chunks.

use crate::atomizer::{AtomizationOutput, AtomizeContext, AtomizeError, Atomizer, SourceMetadata};
use crate::model::atom::Modality;
use crate::model::relation::{AtomRelation, RelationType, SpatialMetadata};

#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryAtomizer;

impl Atomizer for BinaryAtomizer {
    fn name(&self) -> &str {
        "binary"
    }

    fn priority(&self) -> i32 {
        0
    }

    fn can_handle(&self, _content_type: &str, _extension: Option<&str>) -> bool {
        true
    }

    fn atomize(
        &self,
        ctx: &AtomizeContext<'_>,
        content: &[u8],
        _source: &SourceMetadata,
    ) -> Result<AtomizationOutput, AtomizeError> {
        let chunk_size = ctx.limits().max_atom_size;
        let root = ctx.file_root(content, Modality::Binary);
        let root_hash = root.content_hash;
        let mut output = AtomizationOutput::new(root);
        if content.len() <= chunk_size {
            return Ok(output);
        }

        for (index, chunk) in content.chunks(chunk_size).enumerate() {
            if index % 1024 == 0 && ctx.stop_if_cancelled(&mut output) {
                break;
            }
            let child = output.add_atom(ctx.draft(chunk, Modality::Binary, "chunk"));
            output.add_relation(
                AtomRelation::new(root_hash, child, RelationType::Sequence)
                    .at(index as u64)
                    .with_spatial(SpatialMetadata::ByteRange {
                        offset: (index * chunk_size) as u64,
                        length: chunk.len() as u64,
                    }),
            );
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::BinaryAtomizer;
    use crate::atomizer::{AtomizeLimits, AtomizerRegistry, SourceMetadata};
    use crate::cancel::CancellationToken;
    use crate::model::relation::SpatialMetadata;
    use std::sync::Arc;

    #[test]
    fn chunks_carry_byte_ranges() {
        let mut registry = AtomizerRegistry::new();
        registry.register(Arc::new(BinaryAtomizer)).unwrap();
        let content: Vec<u8> = (0..200_u32).map(|value| (value % 251) as u8 ^ 0x80).collect();

        let output = registry
            .atomize(&content, &SourceMetadata::default(), AtomizeLimits::default(), &CancellationToken::new())
            .unwrap();

        assert_eq!(output.atoms().len(), 1 + 4);
        assert!(!output.root().embeddable);
        assert_eq!(output.root().atomic_value.len(), 64);
        assert!(output.root().is_overflow());
        let last = output
            .relations()
            .iter()
            .find(|relation| relation.sequence_index == Some(3))
            .unwrap();
        assert_eq!(
            last.spatial,
            Some(SpatialMetadata::ByteRange { offset: 192, length: 8 })
        );
    }
}
