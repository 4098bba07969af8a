//! Text atomizer: word, whitespace and punctuation runs in source order.
//!
//! # Invariants
//! - Concatenating token atoms in sequence order reproduces the input bytes.
//! - Content that already fits one atom is not split.
//! - Tokens longer than the atom bound are cut into bound-sized pieces.

use crate::atomizer::detect::TEXT_PLAIN;
use crate::atomizer::{AtomizationOutput, AtomizeContext, AtomizeError, Atomizer, SourceMetadata};
use crate::model::atom::Modality;
use crate::model::relation::RelationType;
use once_cell::sync::Lazy;
use regex::bytes::Regex;

static TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\w+|\s+|[^\w\s]+").expect("valid token regex"));

/// Tokens between cancellation checks.
const CANCEL_CHECK_INTERVAL: usize = 1024;

#[derive(Debug, Clone, Copy, Default)]
pub struct TextAtomizer;

/// Token class, used as the atom subtype.
fn classify(token: &[u8]) -> &'static str {
    match std::str::from_utf8(token) {
        Ok(text) if text.chars().all(char::is_whitespace) => "whitespace",
        Ok(text) if text.chars().all(|c| c.is_alphanumeric() || c == '_') => "word",
        Ok(_) => "punctuation",
        Err(_) => "bytes",
    }
}

/// Splits `content` into contiguous spans; bytes no pattern matches (invalid
/// UTF-8) become their own spans so nothing is lost.
fn segments(content: &[u8]) -> Vec<&[u8]> {
    let mut spans = Vec::new();
    let mut cursor = 0;
    for found in TOKEN_RE.find_iter(content) {
        if found.start() > cursor {
            spans.push(&content[cursor..found.start()]);
        }
        spans.push(found.as_bytes());
        cursor = found.end();
    }
    if cursor < content.len() {
        spans.push(&content[cursor..]);
    }
    spans
}

impl Atomizer for TextAtomizer {
    fn name(&self) -> &str {
        "text"
    }

    fn priority(&self) -> i32 {
        50
    }

    fn can_handle(&self, content_type: &str, _extension: Option<&str>) -> bool {
        content_type.starts_with("text/") || content_type == TEXT_PLAIN
    }

    fn atomize(
        &self,
        ctx: &AtomizeContext<'_>,
        content: &[u8],
        _source: &SourceMetadata,
    ) -> Result<AtomizationOutput, AtomizeError> {
        let max_atom_size = ctx.limits().max_atom_size;
        let root = ctx.file_root(content, Modality::Text).with_embeddable(true);
        let root_hash = root.content_hash;
        let mut output = AtomizationOutput::new(root);
        if content.len() <= max_atom_size {
            return Ok(output);
        }

        let mut sequence = 0_u64;
        for (position, token) in segments(content).into_iter().enumerate() {
            if position % CANCEL_CHECK_INTERVAL == 0 && ctx.stop_if_cancelled(&mut output) {
                break;
            }
            let subtype = classify(token);
            for piece in token.chunks(max_atom_size) {
                output.attach(
                    root_hash,
                    ctx.draft(piece, Modality::Text, subtype),
                    RelationType::Sequence,
                    sequence,
                );
                sequence += 1;
            }
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::{segments, TextAtomizer};
    use crate::atomizer::{AtomizeLimits, AtomizerRegistry, SourceMetadata};
    use crate::cancel::CancellationToken;
    use std::sync::Arc;

    fn registry() -> AtomizerRegistry {
        let mut registry = AtomizerRegistry::new();
        registry.register(Arc::new(TextAtomizer)).unwrap();
        registry
    }

    #[test]
    fn segments_cover_input_including_invalid_utf8() {
        let content = b"hi, there \xff\xfe end";
        let joined: Vec<u8> = segments(content).concat();
        assert_eq!(joined, content.to_vec());
    }

    #[test]
    fn short_text_stays_a_single_embeddable_atom() {
        let output = registry()
            .atomize(
                b"0123456789",
                &SourceMetadata::named("a.txt"),
                AtomizeLimits::default(),
                &CancellationToken::new(),
            )
            .unwrap();
        assert_eq!(output.atoms().len(), 1);
        assert!(output.root().embeddable);
        assert!(output.relations().is_empty());
    }

    #[test]
    fn long_text_is_tokenized_in_order_and_deduplicated() {
        let content = "the cat and the dog and the bird ".repeat(4);
        let limits = AtomizeLimits {
            max_atom_size: 16,
            ..AtomizeLimits::default()
        };
        let output = registry()
            .atomize(content.as_bytes(), &SourceMetadata::named("a.txt"), limits, &CancellationToken::new())
            .unwrap();

        let mut sequence: Vec<_> = output.relations().to_vec();
        sequence.sort_by_key(|relation| relation.sequence_index);
        let rebuilt: Vec<u8> = sequence
            .iter()
            .flat_map(|relation| {
                output
                    .atoms()
                    .iter()
                    .find(|atom| atom.content_hash == relation.child_hash)
                    .map(|atom| atom.atomic_value.clone())
                    .unwrap_or_default()
            })
            .collect();
        assert_eq!(rebuilt, content.as_bytes());

        // root + distinct tokens: the cat and dog bird " "
        assert_eq!(output.atoms().len(), 7);
        assert!(output.atoms().iter().all(|atom| atom.atomic_value.len() <= 16));
    }

    #[test]
    fn cancelled_run_keeps_root_and_warns() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let output = registry()
            .atomize(
                "word ".repeat(100).as_bytes(),
                &SourceMetadata::named("a.txt"),
                AtomizeLimits::default(),
                &cancel,
            )
            .unwrap();
        assert_eq!(output.atoms().len(), 1);
        assert!(output.has_warning(crate::model::warning::WarningCode::Cancelled));
    }
}
