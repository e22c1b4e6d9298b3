//! Text-to-vector providers
//!
//! The engine treats embeddings as an injectable collaborator. The default
//! provider is a deterministic seeded-projection embedder that needs no
//! model download, so the engine works fully offline; a real model can be
//! plugged in behind the same trait.

use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use moka::sync::Cache;
use std::sync::Arc;
use std::sync::OnceLock;
use tracing::info;

/// Dimension used by the default embedder (all-MiniLM class models)
pub const DEFAULT_EMBEDDING_DIM: usize = 384;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn dimension(&self) -> usize;

    fn model_name(&self) -> &str;

    /// Deterministic for identical input. Fails with
    /// `EngineError::EmbeddingUnavailable` when the backing model cannot be
    /// loaded; callers treat that as non-fatal and skip semantic stages.
    async fn embed(&self, text: &str) -> EngineResult<Vec<f32>>;
}

/// Deterministic hash-projection embedder with lazy initialization and a
/// bounded result cache. Token-based, so texts sharing words land near each
/// other — adequate for name similarity, not a substitute for a real model.
pub struct HashEmbedder {
    dimension: usize,
    projections: OnceLock<Vec<u64>>,
    cache: Cache<String, Arc<Vec<f32>>>,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        assert!(dimension > 0, "embedding dimension must be positive");
        Self {
            dimension,
            projections: OnceLock::new(),
            cache: Cache::builder().max_capacity(8_192).build(),
        }
    }

    /// Per-dimension mixing seeds, built on first use to keep construction
    /// free of startup cost.
    fn seeds(&self) -> &[u64] {
        self.projections.get_or_init(|| {
            info!("Initializing hash embedder ({} dims)", self.dimension);
            (0..self.dimension as u64)
                .map(|i| i.wrapping_mul(0x9e37_79b9_7f4a_7c15).rotate_left(17) | 1)
                .collect()
        })
    }

    fn embed_uncached(&self, text: &str) -> Vec<f32> {
        let seeds = self.seeds();
        let mut vector = vec![0.0f32; self.dimension];

        for token in text.to_lowercase().split(|c: char| !c.is_alphanumeric()) {
            if token.is_empty() {
                continue;
            }
            let mut token_hash: u64 = 0xcbf2_9ce4_8422_2325;
            for byte in token.bytes() {
                token_hash ^= byte as u64;
                token_hash = token_hash.wrapping_mul(0x0000_0100_0000_01b3);
            }
            for (value, seed) in vector.iter_mut().zip(seeds.iter()) {
                let mixed = token_hash.wrapping_mul(*seed);
                *value += ((mixed as i64) as f32) / (i64::MAX as f32);
            }
        }

        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value /= norm;
            }
        }
        vector
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_EMBEDDING_DIM)
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        "hash-projection"
    }

    async fn embed(&self, text: &str) -> EngineResult<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(EngineError::EmbeddingUnavailable("empty input".into()));
        }
        if let Some(cached) = self.cache.get(text) {
            return Ok(cached.as_ref().clone());
        }
        let vector = self.embed_uncached(text);
        self.cache.insert(text.to_string(), Arc::new(vector.clone()));
        Ok(vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::cosine_similarity;

    // ===== Determinism Tests =====

    #[tokio::test]
    async fn test_embed_deterministic() {
        let embedder = HashEmbedder::default();
        let a = embedder.embed("Acme Corporation").await.unwrap();
        let b = embedder.embed("Acme Corporation").await.unwrap();

        assert_eq!(a, b);
        assert_eq!(a.len(), DEFAULT_EMBEDDING_DIM);
    }

    #[tokio::test]
    async fn test_embed_unit_norm() {
        let embedder = HashEmbedder::default();
        let v = embedder.embed("hello world").await.unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();

        assert!((norm - 1.0).abs() < 1e-4);
    }

    // ===== Similarity Shape Tests =====

    #[tokio::test]
    async fn test_shared_tokens_more_similar() {
        let embedder = HashEmbedder::default();
        let a = embedder.embed("acme corporation").await.unwrap();
        let b = embedder.embed("acme corp corporation").await.unwrap();
        let c = embedder.embed("completely unrelated phrase").await.unwrap();

        assert!(cosine_similarity(&a, &b) > cosine_similarity(&a, &c));
    }

    #[tokio::test]
    async fn test_empty_input_unavailable() {
        let embedder = HashEmbedder::default();
        let err = embedder.embed("   ").await.unwrap_err();

        assert!(matches!(err, EngineError::EmbeddingUnavailable(_)));
    }
}
