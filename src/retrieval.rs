//! Cosine-similarity retrieval over the embedding corpus.
//!
//! Retrieval is a full linear scan: every record is scored, results are
//! ordered by descending similarity and ties keep corpus order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::store::EmbeddingRecord;

pub const DEFAULT_TOP_K: usize = 3;
pub const DEFAULT_EMBEDDING_DIM: usize = 384;

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("degenerate vector: {0}")]
    DegenerateVector(String),
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredRecord {
    pub score: f64,
    pub text: String,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// `dot(a, b) / (|a| * |b|)`, or 0.0 when either side has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f64, RetrievalError> {
    if a.len() != b.len() {
        return Err(RetrievalError::DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }

    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }
    Ok(dot / (norm_a.sqrt() * norm_b.sqrt()))
}

/// The `k` corpus records most similar to `query`, best first.
///
/// Corpus records with a zero norm score 0.0. A zero-norm or non-finite query
/// has no direction to compare against and is rejected.
pub fn top_k_similar(
    query: &[f32],
    corpus: &[EmbeddingRecord],
    k: usize,
) -> Result<Vec<ScoredRecord>, RetrievalError> {
    if query.iter().any(|v| !v.is_finite()) {
        return Err(RetrievalError::DegenerateVector(
            "query has non-finite components".to_string(),
        ));
    }
    if query.iter().all(|v| *v == 0.0) {
        return Err(RetrievalError::DegenerateVector("query has zero norm".to_string()));
    }

    let mut scored = Vec::with_capacity(corpus.len());
    for record in corpus {
        let score = cosine_similarity(query, &record.embedding)?;
        scored.push((score, record));
    }
    // stable: equal scores keep corpus order
    scored.sort_by(|a, b| b.0.total_cmp(&a.0));

    Ok(scored
        .into_iter()
        .take(k)
        .map(|(score, record)| ScoredRecord {
            score,
            text: record.text.clone(),
            metadata: record.metadata.clone(),
        })
        .collect())
}

/// Turns text into a fixed-length embedding vector.
pub trait Embedder: Send + Sync {
    fn dimension(&self) -> usize;

    fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError>;
}

/// Offline embedder: hashes lowercase word tokens into signed buckets and
/// L2-normalises the result.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dim: usize,
}

impl HashingEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(1) }
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_EMBEDDING_DIM)
    }
}

impl Embedder for HashingEmbedder {
    fn dimension(&self) -> usize {
        self.dim
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError> {
        let mut vector = vec![0.0f32; self.dim];
        let mut tokens = 0usize;
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(token.to_lowercase().as_bytes());
            let mut bucket_bytes = [0u8; 8];
            bucket_bytes.copy_from_slice(&digest[..8]);
            let bucket = (u64::from_le_bytes(bucket_bytes) % self.dim as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
            tokens += 1;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if tokens == 0 || norm == 0.0 {
            return Err(RetrievalError::DegenerateVector(
                "text has no embeddable tokens".to_string(),
            ));
        }
        for v in &mut vector {
            *v /= norm;
        }
        Ok(vector)
    }
}
