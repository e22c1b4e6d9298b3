//! In-memory similarity index with HNSW acceleration
//!
//! Small sets are scanned linearly (rayon); past a size threshold an HNSW
//! index is built and swapped in atomically, so readers always see either
//! the previous complete index or the new one, never a partial build.

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use hora::core::ann_index::ANNIndex;
use hora::core::metrics::Metric;
use hora::index::hnsw_idx::HNSWIndex;
use hora::index::hnsw_params::HNSWParams;
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Below this many vectors a linear scan beats index maintenance
const ANN_BUILD_THRESHOLD: usize = 256;

pub struct EmbeddingIndex {
    dimension: usize,
    vectors: DashMap<i64, Arc<Vec<f32>>>,
    ann_index: ArcSwapOption<HNSWIndex<f32, i64>>,
    dirty: AtomicBool,
    rebuild_guard: Mutex<()>,
}

impl EmbeddingIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            vectors: DashMap::new(),
            ann_index: ArcSwapOption::const_empty(),
            dirty: AtomicBool::new(false),
            rebuild_guard: Mutex::new(()),
        }
    }

    pub fn insert(&self, key: i64, vector: Vec<f32>) {
        if vector.len() != self.dimension {
            warn!(
                "Dropping vector with wrong dimension: {} != {}",
                vector.len(),
                self.dimension
            );
            return;
        }
        self.vectors.insert(key, Arc::new(vector));
        self.dirty.store(true, Ordering::Relaxed);
    }

    pub fn remove(&self, key: i64) {
        if self.vectors.remove(&key).is_some() {
            self.dirty.store(true, Ordering::Relaxed);
        }
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Nearest neighbors above `threshold`, best first
    pub fn search(&self, query: &[f32], limit: usize, threshold: f32) -> Vec<(i64, f32)> {
        if query.len() != self.dimension || self.vectors.is_empty() {
            return Vec::new();
        }

        if self.vectors.len() >= ANN_BUILD_THRESHOLD {
            self.ensure_index();
            if let Some(index) = self.ann_index.load_full() {
                let hits = index.search(query, limit.max(8));
                let mut scored: Vec<(i64, f32)> = hits
                    .into_iter()
                    .filter_map(|id| {
                        self.vectors
                            .get(&id)
                            .map(|v| (id, cosine_similarity(query, v.as_ref())))
                    })
                    .filter(|(_, sim)| *sim >= threshold)
                    .collect();
                scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
                scored.truncate(limit);
                return scored;
            }
        }

        self.search_linear(query, limit, threshold)
    }

    fn search_linear(&self, query: &[f32], limit: usize, threshold: f32) -> Vec<(i64, f32)> {
        let entries: Vec<(i64, Arc<Vec<f32>>)> = self
            .vectors
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();

        let mut scored: Vec<(i64, f32)> = entries
            .par_iter()
            .map(|(id, vector)| (*id, cosine_similarity(query, vector.as_ref())))
            .filter(|(_, sim)| *sim >= threshold)
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        scored
    }

    /// Rebuild the HNSW snapshot if stale. One rebuild at a time; other
    /// searchers keep using the previous snapshot meanwhile.
    fn ensure_index(&self) {
        if !self.dirty.load(Ordering::Relaxed) {
            return;
        }
        let _guard = match self.rebuild_guard.try_lock() {
            Ok(guard) => guard,
            // Another thread is already rebuilding
            Err(_) => return,
        };
        if !self.dirty.swap(false, Ordering::Relaxed) {
            return;
        }

        let params = HNSWParams {
            n_neighbor: 16,
            ef_build: 100,
            ef_search: 50,
            ..Default::default()
        };
        let mut index = HNSWIndex::<f32, i64>::new(self.dimension, &params);

        for entry in self.vectors.iter() {
            let _ = index.add(entry.value().as_ref(), *entry.key());
        }

        match index.build(Metric::CosineSimilarity) {
            Ok(()) => {
                info!("ANN index rebuilt with {} vectors", self.vectors.len());
                self.ann_index.store(Some(Arc::new(index)));
            }
            Err(e) => {
                warn!("Failed to build ANN index, staying on linear search: {}", e);
                self.dirty.store(true, Ordering::Relaxed);
            }
        }
    }
}

/// Uuid-keyed facade over [`EmbeddingIndex`]; HNSW keys are integers, so a
/// bidirectional id map bridges entity ids to index keys.
pub struct EntityVectorIndex {
    index: EmbeddingIndex,
    key_of: DashMap<uuid::Uuid, i64>,
    id_of: DashMap<i64, uuid::Uuid>,
    next_key: std::sync::atomic::AtomicI64,
}

impl EntityVectorIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            index: EmbeddingIndex::new(dimension),
            key_of: DashMap::new(),
            id_of: DashMap::new(),
            next_key: std::sync::atomic::AtomicI64::new(1),
        }
    }

    pub fn insert(&self, id: uuid::Uuid, vector: Vec<f32>) {
        let key = *self
            .key_of
            .entry(id)
            .or_insert_with(|| self.next_key.fetch_add(1, Ordering::Relaxed));
        self.id_of.insert(key, id);
        self.index.insert(key, vector);
    }

    pub fn remove(&self, id: uuid::Uuid) {
        if let Some((_, key)) = self.key_of.remove(&id) {
            self.id_of.remove(&key);
            self.index.remove(key);
        }
    }

    pub fn search(&self, query: &[f32], limit: usize, threshold: f32) -> Vec<(uuid::Uuid, f32)> {
        self.index
            .search(query, limit, threshold)
            .into_iter()
            .filter_map(|(key, sim)| self.id_of.get(&key).map(|id| (*id, sim)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(parts: &[f32]) -> Vec<f32> {
        let norm: f32 = parts.iter().map(|v| v * v).sum::<f32>().sqrt();
        parts.iter().map(|v| v / norm).collect()
    }

    // ===== Cosine Tests =====

    #[test]
    fn test_cosine_similarity_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    // ===== Linear Search Tests =====

    #[test]
    fn test_search_ranks_by_similarity() {
        let index = EmbeddingIndex::new(3);
        index.insert(1, unit(&[1.0, 0.0, 0.0]));
        index.insert(2, unit(&[0.9, 0.1, 0.0]));
        index.insert(3, unit(&[0.0, 0.0, 1.0]));

        let hits = index.search(&unit(&[1.0, 0.0, 0.0]), 10, 0.5);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, 1);
        assert_eq!(hits[1].0, 2);
    }

    #[test]
    fn test_search_respects_threshold_and_limit() {
        let index = EmbeddingIndex::new(2);
        for i in 0..10 {
            index.insert(i, unit(&[1.0, i as f32 * 0.01]));
        }

        let hits = index.search(&unit(&[1.0, 0.0]), 3, 0.99);
        assert_eq!(hits.len(), 3);
    }

    #[test]
    fn test_remove_drops_vector() {
        let index = EmbeddingIndex::new(2);
        index.insert(1, unit(&[1.0, 0.0]));
        index.remove(1);

        assert!(index.search(&unit(&[1.0, 0.0]), 10, 0.0).is_empty());
        assert!(index.is_empty());
    }

    #[test]
    fn test_wrong_dimension_rejected() {
        let index = EmbeddingIndex::new(3);
        index.insert(1, vec![1.0, 0.0]);

        assert_eq!(index.len(), 0);
    }
}
