//! Progressive entity resolution
//!
//! Five stages, each more expensive than the last; the first to clear its
//! threshold wins. Exact equality runs against the indexed name lookup;
//! fuzzy, semantic and contextual scoring run over the filtered candidate
//! set (same type, recently seen, above the mention floor).

use crate::config::Config;
use crate::embedding::{cosine_similarity, EntityVectorIndex};
use crate::error::{EngineError, EngineResult};
use crate::graph_db::schema::*;
use crate::graph_db::GraphDatabase;
use crate::utils::TextUtils;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// A surface-form occurrence awaiting resolution
#[derive(Debug, Clone)]
pub struct Mention {
    pub text: String,
    pub entity_type: EntityType,
    pub embedding: Option<Vec<f32>>,
    pub event_id: Option<i64>,
}

/// Resolution outcome. `entity_id = None` means "create new".
#[derive(Debug, Clone)]
pub struct Resolution {
    pub entity_id: Option<Uuid>,
    pub confidence: f32,
    pub method: ResolutionMethod,
    /// Confidence landed in the provisional band: attribute the mention but
    /// do not commit the surface form as an alias yet.
    pub tentative: bool,
}

impl Resolution {
    fn new_entity() -> Self {
        Self {
            entity_id: None,
            confidence: 1.0,
            method: ResolutionMethod::New,
            tentative: false,
        }
    }
}

/// Optional last-resort disambiguator (an LLM in production). Batched and
/// invoked off the interactive path; never required for correctness.
#[async_trait]
pub trait Disambiguator: Send + Sync {
    async fn disambiguate(
        &self,
        mention: &str,
        candidates: &[(Uuid, String)],
    ) -> EngineResult<Option<Uuid>>;
}

/// Shared state for one extraction batch: the per-batch resolution cache
/// and the context signals used by stage 4.
#[derive(Default)]
pub struct BatchContext {
    pub session_key: String,
    /// Entities resolved earlier in this batch
    pub resolved: HashSet<Uuid>,
    /// Entities recently active in this session (provided by the caller)
    pub session_entities: HashSet<Uuid>,
    cache: HashMap<(String, EntityType), Resolution>,
}

impl BatchContext {
    pub fn new(session_key: &str) -> Self {
        Self {
            session_key: session_key.to_string(),
            ..Default::default()
        }
    }

    /// Record a just-created entity so a recurrence of the same mention in
    /// this batch resolves to it instead of creating another.
    pub fn note_created(&mut self, mention_text: &str, entity_type: EntityType, entity_id: Uuid) {
        let normalized = TextUtils::normalize_name(mention_text);
        self.cache.insert(
            (normalized, entity_type),
            Resolution {
                entity_id: Some(entity_id),
                confidence: 1.0,
                method: ResolutionMethod::Exact,
                tentative: false,
            },
        );
        self.resolved.insert(entity_id);
    }
}

pub struct EntityResolver {
    db: Arc<GraphDatabase>,
    config: Arc<Config>,
    entity_index: Arc<EntityVectorIndex>,
    disambiguator: Option<Arc<dyn Disambiguator>>,
}

impl EntityResolver {
    pub fn new(
        db: Arc<GraphDatabase>,
        config: Arc<Config>,
        entity_index: Arc<EntityVectorIndex>,
        disambiguator: Option<Arc<dyn Disambiguator>>,
    ) -> Self {
        Self {
            db,
            config,
            entity_index,
            disambiguator,
        }
    }

    pub async fn resolve(
        &self,
        mention: &Mention,
        batch: &mut BatchContext,
    ) -> EngineResult<Resolution> {
        let normalized = TextUtils::normalize_name(&mention.text);
        if normalized.is_empty() {
            return Ok(Resolution::new_entity());
        }

        let cache_key = (normalized.clone(), mention.entity_type);
        if let Some(cached) = batch.cache.get(&cache_key) {
            return Ok(cached.clone());
        }

        let resolution = self.resolve_uncached(mention, &normalized, batch).await?;

        self.db
            .metrics
            .record(resolution.method)
            .map_err(EngineError::storage)?;
        batch.cache.insert(cache_key, resolution.clone());
        if let Some(id) = resolution.entity_id {
            batch.resolved.insert(id);
        }
        Ok(resolution)
    }

    async fn resolve_uncached(
        &self,
        mention: &Mention,
        normalized: &str,
        batch: &BatchContext,
    ) -> EngineResult<Resolution> {
        // Stage 1: exact. Uses the indexed lookup directly, so an exact
        // repeat always converges regardless of the candidate floor.
        if let Some(entity) = self
            .db
            .entities
            .find_by_name(&mention.text)
            .map_err(EngineError::resolution)?
        {
            if entity.entity_type == mention.entity_type {
                debug!("Resolved '{}' exactly to {}", mention.text, entity.id);
                return Ok(Resolution {
                    entity_id: Some(entity.id),
                    confidence: 1.0,
                    method: ResolutionMethod::Exact,
                    tentative: false,
                });
            }
        }

        let candidates = self.candidates(mention.entity_type)?;
        if candidates.is_empty() {
            return Ok(Resolution::new_entity());
        }

        // Stage 2: fuzzy string similarity against names and aliases
        let fuzzy_threshold = self.config.fuzzy_threshold_for(&mention.entity_type);
        let mut fuzzy_best: Option<(&Entity, f32)> = None;
        for candidate in &candidates {
            let score = fuzzy_score(normalized, candidate);
            if score >= fuzzy_threshold
                && fuzzy_best.map(|(_, best)| score > best).unwrap_or(true)
            {
                fuzzy_best = Some((candidate, score));
            }
        }
        if let Some((entity, score)) = fuzzy_best {
            debug!("Resolved '{}' fuzzily to {} ({:.2})", mention.text, entity.id, score);
            return Ok(self.banded(entity.id, score, ResolutionMethod::Fuzzy));
        }

        // Stage 3: semantic similarity over name embeddings. Skipped when
        // the mention has no embedding (provider unavailable).
        if let Some(query) = &mention.embedding {
            if let Some((id, sim)) = self.semantic_best(query, &candidates) {
                if sim >= self.config.semantic_threshold {
                    debug!("Resolved '{}' semantically to {} ({:.2})", mention.text, id, sim);
                    return Ok(self.banded(id, sim, ResolutionMethod::Semantic));
                }
            }
        } else {
            warn!("No embedding for '{}', skipping semantic stage", mention.text);
        }

        // Stage 4: contextual scoring
        let mut scored: Vec<(&Entity, f32)> = candidates
            .iter()
            .map(|candidate| (candidate, self.contextual_score(candidate, batch)))
            .filter(|(_, score)| *score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        if let Some((entity, score)) = scored.first() {
            if *score >= self.config.contextual_threshold {
                debug!(
                    "Resolved '{}' contextually to {} ({:.2})",
                    mention.text, entity.id, score
                );
                return Ok(self.banded(entity.id, (*score).min(1.0), ResolutionMethod::Contextual));
            }
        }

        // Stage 5: optional disambiguation fallback, only with a small set
        // of viable candidates left
        if self.config.enable_disambiguation {
            if let Some(disambiguator) = &self.disambiguator {
                let viable: Vec<(Uuid, String)> = scored
                    .iter()
                    .take(5)
                    .map(|(entity, _)| (entity.id, entity.canonical_name.clone()))
                    .collect();
                if (2..=5).contains(&viable.len()) {
                    if let Some(id) = disambiguator.disambiguate(&mention.text, &viable).await? {
                        debug!("Resolved '{}' via fallback to {}", mention.text, id);
                        return Ok(self.banded(id, 0.75, ResolutionMethod::Fallback));
                    }
                }
            }
        }

        Ok(Resolution::new_entity())
    }

    /// Same type, recently seen, above the mention floor. The floor only
    /// gates the inexact stages; it is waived while the graph is too young
    /// for anything to have crossed it.
    fn candidates(&self, entity_type: EntityType) -> EngineResult<Vec<Entity>> {
        let candidates = self
            .db
            .entities
            .candidates(
                entity_type,
                self.config.recency_window_days,
                self.config.mention_count_floor,
            )
            .map_err(EngineError::resolution)?;
        if !candidates.is_empty() {
            return Ok(candidates);
        }
        self.db
            .entities
            .candidates(entity_type, self.config.recency_window_days, 1)
            .map_err(EngineError::resolution)
    }

    fn semantic_best(&self, query: &[f32], candidates: &[Entity]) -> Option<(Uuid, f32)> {
        // Large candidate sets go through the ANN index; small ones are
        // scored exhaustively.
        if candidates.len() > 64 && !self.entity_index.is_empty() {
            let candidate_ids: HashSet<Uuid> = candidates.iter().map(|c| c.id).collect();
            return self
                .entity_index
                .search(query, 16, self.config.semantic_threshold)
                .into_iter()
                .find(|(id, _)| candidate_ids.contains(id));
        }

        candidates
            .iter()
            .filter_map(|candidate| {
                candidate
                    .name_embedding
                    .as_ref()
                    .map(|embedding| (candidate.id, cosine_similarity(query, embedding)))
            })
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
    }

    fn contextual_score(&self, candidate: &Entity, batch: &BatchContext) -> f32 {
        let mut score = 0.0;

        if batch.session_entities.contains(&candidate.id) {
            score += 0.3;
        }

        if !batch.resolved.is_empty() {
            if let Ok(neighbors) = self.db.edges.neighbors(candidate.id) {
                let shared = neighbors
                    .iter()
                    .filter(|id| batch.resolved.contains(id))
                    .count();
                score += 0.2 * shared as f32;
            }
        }

        if candidate.last_seen >= Utc::now() - chrono::Duration::days(7) {
            score += 0.2;
        }

        score
    }

    /// Wrap a match, flagging it tentative when confidence falls inside the
    /// provisional band.
    fn banded(&self, id: Uuid, confidence: f32, method: ResolutionMethod) -> Resolution {
        let tentative = confidence >= self.config.tentative_band_low
            && confidence < self.config.tentative_band_high;
        Resolution {
            entity_id: Some(id),
            confidence,
            method,
            tentative,
        }
    }
}

/// Fuzzy score for a mention against a candidate's canonical name and
/// aliases. Plain normalized edit distance, plus a diminutive rule: a
/// shared prefix of three or more characters covering one whole string
/// scores as a near-match ("liz" / "lizzy").
fn fuzzy_score(normalized_mention: &str, candidate: &Entity) -> f32 {
    let mut best: f32 = 0.0;
    for surface in std::iter::once(candidate.normalized_name.as_str())
        .chain(candidate.aliases.iter().map(|a| a.as_str()))
    {
        let normalized_surface = TextUtils::normalize_name(surface);
        let mut score = TextUtils::edit_similarity(normalized_mention, &normalized_surface);

        let (short, long) = if normalized_mention.len() <= normalized_surface.len() {
            (normalized_mention, normalized_surface.as_str())
        } else {
            (normalized_surface.as_str(), normalized_mention)
        };
        if short.len() >= 3 && long.starts_with(short) {
            score = score.max(0.92);
        }

        best = best.max(score);
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{EmbeddingProvider, HashEmbedder};

    fn setup() -> (Arc<GraphDatabase>, EntityResolver) {
        let db = Arc::new(GraphDatabase::new_in_memory().unwrap());
        let config = Arc::new(Config::default());
        let index = Arc::new(EntityVectorIndex::new(config.embedding_dim));
        let resolver = EntityResolver::new(Arc::clone(&db), config, index, None);
        (db, resolver)
    }

    fn mention(text: &str, entity_type: EntityType) -> Mention {
        Mention {
            text: text.to_string(),
            entity_type,
            embedding: None,
            event_id: None,
        }
    }

    // ===== Stage 1: Exact =====

    #[tokio::test]
    async fn test_exact_match_on_canonical_name() {
        let (db, resolver) = setup();
        let entity = db.entities.insert("Acme Corp", EntityType::Organization, "", None).unwrap();

        let mut batch = BatchContext::new("s1");
        let resolution = resolver
            .resolve(&mention("acme corp.", EntityType::Organization), &mut batch)
            .await
            .unwrap();

        assert_eq!(resolution.entity_id, Some(entity.id));
        assert_eq!(resolution.method, ResolutionMethod::Exact);
        assert!(!resolution.tentative);
    }

    #[tokio::test]
    async fn test_exact_match_requires_same_type() {
        let (db, resolver) = setup();
        db.entities.insert("Mercury", EntityType::Person, "", None).unwrap();

        let mut batch = BatchContext::new("s1");
        let resolution = resolver
            .resolve(&mention("Mercury", EntityType::Concept), &mut batch)
            .await
            .unwrap();

        assert_eq!(resolution.entity_id, None);
    }

    // ===== Stage 2: Fuzzy =====

    #[tokio::test]
    async fn test_alias_convergence_via_fuzzy() {
        let (db, resolver) = setup();
        let entity = db.entities.insert("Elizabeth", EntityType::Person, "", None).unwrap();
        db.entities.add_alias(entity.id, "Liz").unwrap();

        let mut batch = BatchContext::new("s1");
        for text in ["Elizabeth", "Liz", "Lizzy"] {
            let resolution = resolver
                .resolve(&mention(text, EntityType::Person), &mut batch)
                .await
                .unwrap();
            assert_eq!(resolution.entity_id, Some(entity.id), "failed for {}", text);
        }
    }

    #[tokio::test]
    async fn test_no_false_positive_merge_for_distinct_persons() {
        let (db, resolver) = setup();
        let john = db.entities.insert("John Smith", EntityType::Person, "", None).unwrap();
        let jane = db.entities.insert("Jane Smith", EntityType::Person, "", None).unwrap();

        let mut batch = BatchContext::new("s1");
        let resolution = resolver
            .resolve(&mention("John Smith", EntityType::Person), &mut batch)
            .await
            .unwrap();
        assert_eq!(resolution.entity_id, Some(john.id));

        let mut batch = BatchContext::new("s2");
        let resolution = resolver
            .resolve(&mention("Jane Smith", EntityType::Person), &mut batch)
            .await
            .unwrap();
        assert_eq!(resolution.entity_id, Some(jane.id));

        // A typo'd variant of one must never land on the other
        let mut batch = BatchContext::new("s3");
        let resolution = resolver
            .resolve(&mention("Jon Smith", EntityType::Person), &mut batch)
            .await
            .unwrap();
        assert_ne!(resolution.entity_id, Some(jane.id));
    }

    #[tokio::test]
    async fn test_fuzzy_score_prefix_rule() {
        let (db, _) = setup();
        let entity = db.entities.insert("Elizabeth", EntityType::Person, "", None).unwrap();
        let mut with_alias = db.entities.get(entity.id).unwrap().unwrap();
        with_alias.aliases.push("Liz".to_string());

        assert!(fuzzy_score("lizzy", &with_alias) >= 0.90);
        assert!(fuzzy_score("zzz", &with_alias) < 0.5);
    }

    // ===== Stage 3: Semantic =====

    #[tokio::test]
    async fn test_semantic_match_with_embeddings() {
        let (db, resolver) = setup();
        let embedder = HashEmbedder::default();

        let vector = embedder.embed("Worldwide Widget Makers").await.unwrap();
        let entity = db
            .entities
            .insert("Worldwide Widget Makers", EntityType::Organization, "", Some(&vector))
            .unwrap();
        db.entities.record_mention(entity.id, "Worldwide Widget Makers", true).unwrap();

        // Token overlap keeps cosine high while edit distance stays low
        let query = embedder.embed("Widget Makers Worldwide").await.unwrap();
        let mut batch = BatchContext::new("s1");
        let resolution = resolver
            .resolve(
                &Mention {
                    text: "Widget Makers Worldwide".to_string(),
                    entity_type: EntityType::Organization,
                    embedding: Some(query),
                    event_id: None,
                },
                &mut batch,
            )
            .await
            .unwrap();

        assert_eq!(resolution.entity_id, Some(entity.id));
        assert_eq!(resolution.method, ResolutionMethod::Semantic);
    }

    #[tokio::test]
    async fn test_missing_embedding_skips_semantic_stage() {
        let (db, resolver) = setup();
        let embedder = HashEmbedder::default();
        let vector = embedder.embed("Worldwide Widget Makers").await.unwrap();
        db.entities
            .insert("Worldwide Widget Makers", EntityType::Organization, "", Some(&vector))
            .unwrap();

        let mut batch = BatchContext::new("s1");
        let resolution = resolver
            .resolve(&mention("Widget Makers Worldwide", EntityType::Organization), &mut batch)
            .await
            .unwrap();

        // Without an embedding the mention becomes a new entity
        assert_eq!(resolution.entity_id, None);
        assert_eq!(resolution.method, ResolutionMethod::New);
    }

    // ===== Stage 4: Contextual =====

    #[tokio::test]
    async fn test_contextual_match_from_session_and_recency() {
        let (db, resolver) = setup();
        let entity = db.entities.insert("The Initiative", EntityType::Concept, "", None).unwrap();
        db.entities.record_mention(entity.id, "The Initiative", true).unwrap();

        let mut batch = BatchContext::new("s1");
        batch.session_entities.insert(entity.id);

        // "Initiative Program" is too far for fuzzy, has no embedding, but
        // session activity (+0.3) and 7-day recency (+0.2) plus a shared
        // neighbor (+0.2) clear the 0.70 bar.
        let other = db.entities.insert("Program Office", EntityType::Concept, "", None).unwrap();
        db.edges.upsert(entity.id, other.id, "runs", "association", None).unwrap();
        batch.resolved.insert(other.id);

        let resolution = resolver
            .resolve(&mention("Initiative Program", EntityType::Concept), &mut batch)
            .await
            .unwrap();

        assert_eq!(resolution.entity_id, Some(entity.id));
        assert_eq!(resolution.method, ResolutionMethod::Contextual);
        assert!(resolution.tentative);
    }

    // ===== Batch Cache Tests =====

    #[tokio::test]
    async fn test_batch_cache_reuses_resolution() {
        let (db, resolver) = setup();
        db.entities.insert("Acme", EntityType::Organization, "", None).unwrap();

        let mut batch = BatchContext::new("s1");
        let first = resolver
            .resolve(&mention("Acme", EntityType::Organization), &mut batch)
            .await
            .unwrap();
        let second = resolver
            .resolve(&mention("ACME", EntityType::Organization), &mut batch)
            .await
            .unwrap();

        assert_eq!(first.entity_id, second.entity_id);
        // Only the first resolve hits the metrics table
        let dist = db.metrics.distribution().unwrap();
        assert_eq!(dist.get("exact"), Some(&1));
    }

    // ===== Stage 5: Fallback =====

    struct PickFirst;

    #[async_trait]
    impl Disambiguator for PickFirst {
        async fn disambiguate(
            &self,
            _mention: &str,
            candidates: &[(Uuid, String)],
        ) -> EngineResult<Option<Uuid>> {
            Ok(candidates.first().map(|(id, _)| *id))
        }
    }

    #[tokio::test]
    async fn test_disambiguation_fallback_when_enabled() {
        let db = Arc::new(GraphDatabase::new_in_memory().unwrap());
        let mut config = Config::default();
        config.enable_disambiguation = true;
        let config = Arc::new(config);
        let index = Arc::new(EntityVectorIndex::new(config.embedding_dim));
        let resolver = EntityResolver::new(Arc::clone(&db), config, index, Some(Arc::new(PickFirst)));

        let a = db.entities.insert("Aurora Project", EntityType::Concept, "", None).unwrap();
        let b = db.entities.insert("Borealis Project", EntityType::Concept, "", None).unwrap();
        db.entities.record_mention(a.id, "Aurora Project", true).unwrap();
        db.entities.record_mention(b.id, "Borealis Project", true).unwrap();

        let mut batch = BatchContext::new("s1");
        // Both candidates carry a weak recency signal, neither clears the
        // contextual bar, so the fallback sees exactly two viable options.
        let resolution = resolver
            .resolve(&mention("Polar Project", EntityType::Concept), &mut batch)
            .await
            .unwrap();

        assert_eq!(resolution.method, ResolutionMethod::Fallback);
        assert!(resolution.entity_id.is_some());
        assert!(resolution.tentative);
    }
}
