//! Cosine similarity and threshold-based match decisions.

use crate::types::Embedding;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SimilarityError {
    #[error("embedding dimensions differ: {left} vs {right} (were they produced by the same model?)")]
    DimensionMismatch { left: usize, right: usize },
    #[error("embedding has zero norm; cosine similarity is undefined")]
    DegenerateVector,
    #[error("threshold {0} is outside [0, 1]")]
    InvalidThreshold(f32),
}

/// Compute cosine similarity between two embeddings.
///
/// Returns a value in [-1, 1]. Higher = more similar. Fails rather than
/// returning a misleading score when the lengths differ or either vector
/// has zero norm.
///
/// Constant-time in the values: always processes all dimensions.
pub fn compare(a: &Embedding, b: &Embedding) -> Result<f32, SimilarityError> {
    cosine(a.values(), b.values())
}

/// [`compare`] over raw slices.
pub fn cosine(a: &[f32], b: &[f32]) -> Result<f32, SimilarityError> {
    if a.len() != b.len() {
        return Err(SimilarityError::DimensionMismatch {
            left: a.len(),
            right: b.len(),
        });
    }

    // Accumulate in f64 so tiny or huge components neither underflow nor
    // overflow the squared norms.
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (&x, &y) in a.iter().zip(b.iter()) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom <= 0.0 || !denom.is_finite() {
        return Err(SimilarityError::DegenerateVector);
    }

    Ok((dot / denom).clamp(-1.0, 1.0) as f32)
}

/// Threshold applied to a similarity score to produce a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchPolicy {
    threshold: f32,
}

impl MatchPolicy {
    /// `threshold` must lie in [0, 1].
    pub fn new(threshold: f32) -> Result<Self, SimilarityError> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(SimilarityError::InvalidThreshold(threshold));
        }
        Ok(Self { threshold })
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn is_match(&self, similarity: f32) -> bool {
        similarity >= self.threshold
    }
}

/// Result of comparing a probe embedding against one or more references.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub matched: bool,
    /// Cosine similarity of the best reference [-1, 1].
    pub similarity: f32,
    /// ID of the best-scoring reference, for gallery searches.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<String>,
}

/// 1:1 verification of a probe against a stored reference.
pub fn verify(
    probe: &Embedding,
    reference: &Embedding,
    policy: MatchPolicy,
) -> Result<MatchResult, SimilarityError> {
    let similarity = compare(probe, reference)?;
    Ok(MatchResult {
        matched: policy.is_match(similarity),
        similarity,
        reference_id: None,
    })
}

/// A stored reference embedding with an identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reference {
    pub id: String,
    pub embedding: Embedding,
}

/// 1:N search of a probe against a gallery of references.
///
/// Always iterates every entry, so timing does not leak gallery size or
/// match position. Returns a non-match with similarity 0.0 for an empty
/// gallery. A dimension mismatch or zero-norm entry anywhere in the gallery
/// is an error.
pub fn identify(
    probe: &Embedding,
    gallery: &[Reference],
    policy: MatchPolicy,
) -> Result<MatchResult, SimilarityError> {
    let mut best_sim = f32::NEG_INFINITY;
    let mut best_idx: Option<usize> = None;

    for (i, reference) in gallery.iter().enumerate() {
        let sim = compare(probe, &reference.embedding)?;
        if sim > best_sim {
            best_sim = sim;
            best_idx = Some(i);
        }
    }

    Ok(match best_idx {
        Some(idx) => MatchResult {
            matched: policy.is_match(best_sim),
            similarity: best_sim,
            reference_id: Some(gallery[idx].id.clone()),
        },
        None => MatchResult {
            matched: false,
            similarity: 0.0,
            reference_id: None,
        },
    })
}
