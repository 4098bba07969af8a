//! Deterministic feature-hashing embedder.
//!
//! Lowercased word tokens and their character trigrams are hashed into a
//! fixed number of signed buckets; the result is L2-normalized. Content with
//! no word characters falls back to raw byte trigrams, so every non-empty
//! input yields a non-zero vector.

use crate::cancel::CancellationToken;
use crate::embedding::{EmbedRequest, EmbeddingError, EmbeddingProvider};
use crate::vector::math::normalized;
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

static WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\w+").expect("valid word regex"));

const TRIGRAM_WEIGHT: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureHashEmbedder {
    dimension: usize,
}

impl FeatureHashEmbedder {
    /// `dimension` is clamped to at least one bucket.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    /// Embeds raw bytes; always returns a unit vector.
    pub fn embed_bytes(&self, content: &[u8]) -> Vec<f32> {
        let mut vector = vec![0.0_f32; self.dimension];
        let text = String::from_utf8_lossy(content).to_lowercase();
        let mut features = 0;
        for word in WORD_RE.find_iter(&text) {
            let word = word.as_str();
            self.add_feature(&mut vector, word.as_bytes(), 1.0);
            let padded: Vec<char> = format!("#{word}#").chars().collect();
            for window in padded.windows(3) {
                let trigram: String = window.iter().collect();
                self.add_feature(&mut vector, trigram.as_bytes(), TRIGRAM_WEIGHT);
            }
            features += 1;
        }
        if features == 0 {
            if content.len() < 3 {
                self.add_feature(&mut vector, content, 1.0);
            }
            for window in content.windows(3) {
                self.add_feature(&mut vector, window, TRIGRAM_WEIGHT);
            }
        }

        normalized(&vector).unwrap_or_else(|| {
            let mut fallback = vec![0.0_f32; self.dimension];
            fallback[self.bucket(content).0] = 1.0;
            fallback
        })
    }

    /// Convenience for query text.
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        self.embed_bytes(text.as_bytes())
    }

    fn bucket(&self, feature: &[u8]) -> (usize, f32) {
        let digest = Sha256::digest(feature);
        let mut head = [0_u8; 8];
        head.copy_from_slice(&digest[..8]);
        let index = (u64::from_le_bytes(head) % self.dimension as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        (index, sign)
    }

    fn add_feature(&self, vector: &mut [f32], feature: &[u8], weight: f32) {
        let (index, sign) = self.bucket(feature);
        vector[index] += sign * weight;
    }
}

impl EmbeddingProvider for FeatureHashEmbedder {
    fn name(&self) -> &str {
        "feature_hash"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed_batch(
        &self,
        requests: &[EmbedRequest],
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut out = Vec::with_capacity(requests.len());
        for request in requests {
            if cancel.is_cancelled() {
                return Err(EmbeddingError::Cancelled);
            }
            out.push(self.embed_bytes(&request.content));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::FeatureHashEmbedder;
    use crate::vector::math::{cosine_similarity, l2_norm};

    #[test]
    fn output_is_deterministic_and_unit_length() {
        let embedder = FeatureHashEmbedder::new(64);
        let a = embedder.embed_text("The quick brown fox");
        assert_eq!(a, embedder.embed_text("the QUICK brown fox"));
        assert!((l2_norm(&a) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn shared_words_score_higher_than_unrelated_text() {
        let embedder = FeatureHashEmbedder::new(256);
        let query = embedder.embed_text("rust borrow checker");
        let close = embedder.embed_text("the rust borrow checker rejects this");
        let far = embedder.embed_text("banana bread recipe");
        assert!(cosine_similarity(&query, &close) > cosine_similarity(&query, &far));
    }

    #[test]
    fn punctuation_and_short_binary_inputs_are_non_zero() {
        let embedder = FeatureHashEmbedder::new(16);
        for input in [b"!!".as_slice(), b"\x00".as_slice(), b"?!?!?".as_slice()] {
            assert!(l2_norm(&embedder.embed_bytes(input)) > 0.5);
        }
    }
}
