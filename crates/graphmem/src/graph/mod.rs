//! Knowledge graph facade: resolution-backed upserts, merge/forget, and
//! read-side queries
//!
//! All graph mutations for one extraction batch run on a single worker, so
//! mention counts and edge strengths never race. Readers go straight to the
//! storage snapshot.

use crate::config::Config;
use crate::embedding::{cosine_similarity, EmbeddingProvider, EntityVectorIndex};
use crate::error::{EngineError, EngineResult};
use crate::graph_db::tentative_store::TentativeOutcome;
use crate::graph_db::schema::*;
use crate::graph_db::GraphDatabase;
use crate::resolver::{BatchContext, Disambiguator, EntityResolver, Mention, Resolution};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long an entity counts as "recently active" in a session
const SESSION_RECENCY_MINUTES: i64 = 60;

#[derive(Debug, Clone)]
pub enum SearchHit {
    Entity { entity: Entity, score: f32 },
    Event { event: Event, score: f32 },
}

impl SearchHit {
    pub fn score(&self) -> f32 {
        match self {
            Self::Entity { score, .. } => *score,
            Self::Event { score, .. } => *score,
        }
    }
}

/// A bounded neighborhood around one entity
#[derive(Debug, Clone)]
pub struct EntityNetwork {
    pub entities: Vec<Entity>,
    pub edges: Vec<Edge>,
}

pub struct KnowledgeGraph {
    db: Arc<GraphDatabase>,
    config: Arc<Config>,
    embedder: Arc<dyn EmbeddingProvider>,
    entity_index: Arc<EntityVectorIndex>,
    resolver: EntityResolver,
    /// Per-session recency of resolved entities, feeding stage 4
    session_recent: DashMap<String, HashMap<Uuid, DateTime<Utc>>>,
}

impl KnowledgeGraph {
    pub fn new(
        db: Arc<GraphDatabase>,
        config: Arc<Config>,
        embedder: Arc<dyn EmbeddingProvider>,
        disambiguator: Option<Arc<dyn Disambiguator>>,
    ) -> anyhow::Result<Self> {
        let entity_index = Arc::new(EntityVectorIndex::new(config.embedding_dim));

        // Warm the similarity index from persisted name embeddings
        let mut loaded = 0;
        for entity in db.entities.all()? {
            if let Some(embedding) = entity.name_embedding {
                entity_index.insert(entity.id, embedding);
                loaded += 1;
            }
        }
        if loaded > 0 {
            info!("Entity vector index warmed with {} embeddings", loaded);
        }

        let resolver = EntityResolver::new(
            Arc::clone(&db),
            Arc::clone(&config),
            Arc::clone(&entity_index),
            disambiguator,
        );

        Ok(Self {
            db,
            config,
            embedder,
            entity_index,
            resolver,
            session_recent: DashMap::new(),
        })
    }

    pub fn database(&self) -> &Arc<GraphDatabase> {
        &self.db
    }

    /// Start a batch context seeded with this session's recently-resolved
    /// entities.
    pub fn begin_batch(&self, session_key: &str) -> BatchContext {
        let mut batch = BatchContext::new(session_key);
        if let Some(entry) = self.session_recent.get(session_key) {
            let cutoff = Utc::now() - chrono::Duration::minutes(SESSION_RECENCY_MINUTES);
            batch.session_entities = entry
                .iter()
                .filter(|(_, seen)| **seen >= cutoff)
                .map(|(id, _)| *id)
                .collect();
        }
        batch
    }

    /// Resolve a mention and update or create the matching entity.
    pub async fn upsert_entity(
        &self,
        mention: &Mention,
        batch: &mut BatchContext,
    ) -> EngineResult<(Entity, Resolution)> {
        let resolution = self.resolver.resolve(mention, batch).await?;

        let entity = match resolution.entity_id {
            Some(id) => {
                if resolution.tentative {
                    let outcome = self
                        .db
                        .tentative
                        .record(&mention.text, mention.entity_type, id, resolution.confidence)
                        .map_err(EngineError::storage)?;
                    if let TentativeOutcome::Conflict { kept, rejected_entity, .. } = &outcome {
                        let conflict = EngineError::MergeConflict {
                            mention: mention.text.clone(),
                            kept: kept.entity_id,
                            rejected: *rejected_entity,
                        };
                        warn!("{}", conflict);
                    }
                }
                self.db
                    .entities
                    .record_mention(id, &mention.text, !resolution.tentative)
                    .map_err(EngineError::storage)?
            }
            None => {
                let embedding = match &mention.embedding {
                    Some(v) => Some(v.clone()),
                    None => match self.embedder.embed(&mention.text).await {
                        Ok(v) => Some(v),
                        Err(EngineError::EmbeddingUnavailable(_)) => None,
                        Err(e) => return Err(e),
                    },
                };
                let entity = self
                    .db
                    .entities
                    .insert(&mention.text, mention.entity_type, "", embedding.as_deref())
                    .map_err(EngineError::storage)?;
                if let Some(embedding) = embedding {
                    self.entity_index.insert(entity.id, embedding);
                }
                batch.note_created(&mention.text, mention.entity_type, entity.id);
                entity
            }
        };

        self.touch_session(&batch.session_key, entity.id);
        Ok((entity, resolution))
    }

    fn touch_session(&self, session_key: &str, entity_id: Uuid) {
        let mut entry = self.session_recent.entry(session_key.to_string()).or_default();
        entry.insert(entity_id, Utc::now());
        if entry.len() > 128 {
            let cutoff = Utc::now() - chrono::Duration::minutes(SESSION_RECENCY_MINUTES);
            entry.retain(|_, seen| *seen >= cutoff);
        }
    }

    pub fn upsert_edge(
        &self,
        source: Uuid,
        target: Uuid,
        relation_label: &str,
        relation_type: &str,
        source_event_id: Option<i64>,
    ) -> EngineResult<Edge> {
        self.db
            .edges
            .upsert(source, target, relation_label, relation_type, source_event_id)
            .map_err(EngineError::storage)
    }

    pub fn upsert_fact(
        &self,
        subject: Uuid,
        predicate: &str,
        object_text: &str,
        object_id: Option<Uuid>,
        fact_type: &str,
        confidence: f32,
        source_event_id: Option<i64>,
    ) -> EngineResult<Fact> {
        self.db
            .facts
            .upsert(subject, predicate, object_text, object_id, fact_type, confidence, source_event_id)
            .map_err(EngineError::storage)
    }

    /// Promote tentative merges that reached the confirmation count into
    /// permanent aliases.
    pub fn promote_ready_tentative(&self) -> EngineResult<usize> {
        let ready = self
            .db
            .tentative
            .ready(self.config.tentative_confirmations)
            .map_err(EngineError::storage)?;

        let mut promoted = 0;
        for merge in ready {
            self.db
                .entities
                .add_alias(merge.entity_id, &merge.mention_text)
                .map_err(EngineError::storage)?;
            self.db.tentative.remove(merge.id).map_err(EngineError::storage)?;
            promoted += 1;
        }
        if promoted > 0 {
            info!("Promoted {} tentative merges to aliases", promoted);
        }
        Ok(promoted)
    }

    /// Fold entity `b` into `a`: edges, facts, aliases and counters move
    /// over, then `b` is deleted. Irreversible; an audit row records it.
    pub fn merge_entities(&self, a: Uuid, b: Uuid, reason: &str) -> EngineResult<()> {
        if a == b {
            return Ok(());
        }
        let removed = self
            .db
            .entities
            .get(b)
            .map_err(EngineError::storage)?
            .ok_or_else(|| EngineError::StorageUnavailable(format!("entity not found: {}", b)))?;

        self.db.edges.reassign(b, a).map_err(EngineError::storage)?;
        self.db.facts.reassign_subject(b, a).map_err(EngineError::storage)?;
        self.db.entities.absorb(a, &removed).map_err(EngineError::storage)?;
        self.db.tentative.remove_for_entity(b).map_err(EngineError::storage)?;
        self.db
            .summaries
            .delete_by(SummaryNodeType::Entity, &b.to_string())
            .map_err(EngineError::storage)?;
        self.db.entities.delete(b).map_err(EngineError::storage)?;
        self.entity_index.remove(b);
        self.db
            .entities
            .record_merge_audit(a, b, reason)
            .map_err(EngineError::storage)?;
        Ok(())
    }

    /// Administrative "forget": drops the entity and everything it owns.
    pub fn forget(&self, entity_id: Uuid) -> EngineResult<bool> {
        let existed = self.db.entities.delete(entity_id).map_err(EngineError::storage)?;
        if existed {
            // Edges and facts cascade through foreign keys
            self.db.tentative.remove_for_entity(entity_id).map_err(EngineError::storage)?;
            self.db
                .summaries
                .delete_by(SummaryNodeType::Entity, &entity_id.to_string())
                .map_err(EngineError::storage)?;
            self.entity_index.remove(entity_id);
            for mut entry in self.session_recent.iter_mut() {
                entry.remove(&entity_id);
            }
            info!("Forgot entity {}", entity_id);
        }
        Ok(existed)
    }

    pub fn find_entity(&self, name: &str) -> EngineResult<Option<Entity>> {
        self.db.entities.find_by_name(name).map_err(EngineError::storage)
    }

    pub fn get_entity(&self, id: Uuid) -> EngineResult<Option<Entity>> {
        self.db.entities.get(id).map_err(EngineError::storage)
    }

    /// Semantic nearest-neighbor search over entities and events. Falls
    /// back to substring matching when no embedding can be produced.
    pub async fn search(&self, query_text: &str, limit: usize) -> EngineResult<Vec<SearchHit>> {
        let query = match self.embedder.embed(query_text).await {
            Ok(v) => v,
            Err(EngineError::EmbeddingUnavailable(reason)) => {
                warn!("Search degraded to keyword matching: {}", reason);
                return self.search_keyword(query_text, limit);
            }
            Err(e) => return Err(e),
        };

        let mut hits = Vec::new();

        for (id, score) in self.entity_index.search(&query, limit, 0.3) {
            if let Some(entity) = self.db.entities.get(id).map_err(EngineError::storage)? {
                hits.push(SearchHit::Entity { entity, score });
            }
        }

        let event_vectors = self.db.events.all_embeddings().map_err(EngineError::storage)?;
        let mut event_scores: Vec<(i64, f32)> = event_vectors
            .iter()
            .map(|(id, vector)| (*id, cosine_similarity(&query, vector)))
            .filter(|(_, score)| *score >= 0.3)
            .collect();
        event_scores.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        event_scores.truncate(limit);

        let touched: Vec<i64> = event_scores.iter().map(|(id, _)| *id).collect();
        for event in self.db.events.get_many(&touched).map_err(EngineError::storage)? {
            let score = event_scores
                .iter()
                .find(|(id, _)| *id == event.id)
                .map(|(_, s)| *s)
                .unwrap_or(0.0);
            hits.push(SearchHit::Event { event, score });
        }
        self.db.events.touch_accessed(&touched).map_err(EngineError::storage)?;

        hits.sort_by(|a, b| b.score().partial_cmp(&a.score()).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);
        Ok(hits)
    }

    fn search_keyword(&self, query_text: &str, limit: usize) -> EngineResult<Vec<SearchHit>> {
        let mut hits = Vec::new();
        if let Some(entity) = self.find_entity(query_text)? {
            hits.push(SearchHit::Entity { entity, score: 1.0 });
        }
        for event in self
            .db
            .events
            .mentioning(query_text, limit)
            .map_err(EngineError::storage)?
        {
            hits.push(SearchHit::Event { event, score: 0.5 });
        }
        hits.truncate(limit);
        Ok(hits)
    }

    /// BFS over edge ids out to `depth` hops.
    pub fn entity_network(&self, entity_id: Uuid, depth: usize) -> EngineResult<EntityNetwork> {
        let mut seen: HashSet<Uuid> = HashSet::new();
        let mut entities = Vec::new();
        let mut edges_out = Vec::new();
        let mut edge_ids: HashSet<Uuid> = HashSet::new();
        let mut frontier: VecDeque<(Uuid, usize)> = VecDeque::new();

        frontier.push_back((entity_id, 0));
        seen.insert(entity_id);

        while let Some((current, hops)) = frontier.pop_front() {
            if let Some(entity) = self.db.entities.get(current).map_err(EngineError::storage)? {
                entities.push(entity);
            } else {
                continue;
            }
            if hops >= depth {
                continue;
            }

            for edge in self.db.edges.edges_for(current).map_err(EngineError::storage)? {
                let other = if edge.source_id == current { edge.target_id } else { edge.source_id };
                if edge_ids.insert(edge.id) {
                    edges_out.push(edge);
                }
                if seen.insert(other) {
                    frontier.push_back((other, hops + 1));
                }
            }
        }

        debug!(
            "Network for {}: {} entities, {} edges at depth {}",
            entity_id,
            entities.len(),
            edges_out.len(),
            depth
        );
        Ok(EntityNetwork { entities, edges: edges_out })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;

    async fn setup() -> KnowledgeGraph {
        let db = Arc::new(GraphDatabase::new_in_memory().unwrap());
        let config = Arc::new(Config::default());
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(HashEmbedder::new(config.embedding_dim));
        KnowledgeGraph::new(db, config, embedder, None).unwrap()
    }

    fn mention(text: &str, entity_type: EntityType) -> Mention {
        Mention {
            text: text.to_string(),
            entity_type,
            embedding: None,
            event_id: None,
        }
    }

    // ===== Upsert Tests =====

    #[tokio::test]
    async fn test_upsert_creates_then_dedups() {
        let graph = setup().await;
        let mut batch = graph.begin_batch("s1");

        let (first, r1) = graph
            .upsert_entity(&mention("Acme Corp", EntityType::Organization), &mut batch)
            .await
            .unwrap();
        assert_eq!(r1.method, ResolutionMethod::New);

        let (second, r2) = graph
            .upsert_entity(&mention("Acme Corp", EntityType::Organization), &mut batch)
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.mention_count, 2);
        assert_eq!(r2.entity_id, Some(first.id));
    }

    #[tokio::test]
    async fn test_repeated_mentions_accumulate_count() {
        let graph = setup().await;
        let mut batch = graph.begin_batch("s1");

        let mut last_count = 0;
        for _ in 0..12 {
            let (entity, _) = graph
                .upsert_entity(&mention("Acme Corp", EntityType::Organization), &mut batch)
                .await
                .unwrap();
            last_count = entity.mention_count;
        }
        assert_eq!(last_count, 12);
        assert_eq!(graph.database().entities.count().unwrap(), 1);
    }

    // ===== Merge Tests =====

    #[tokio::test]
    async fn test_merge_entities_moves_everything() {
        let graph = setup().await;
        let db = graph.database();

        let a = db.entities.insert("Robert", EntityType::Person, "", None).unwrap();
        let b = db.entities.insert("Bob", EntityType::Person, "", None).unwrap();
        let acme = db.entities.insert("Acme", EntityType::Organization, "", None).unwrap();

        db.edges.upsert(b.id, acme.id, "works at", "professional", Some(1)).unwrap();
        db.facts.upsert(b.id, "home_city", "Boston", None, "biographical", 0.9, None).unwrap();

        graph.merge_entities(a.id, b.id, "manual merge").unwrap();

        assert!(db.entities.get(b.id).unwrap().is_none());
        let merged = db.entities.get(a.id).unwrap().unwrap();
        assert!(merged.aliases.contains(&"Bob".to_string()));
        assert_eq!(db.edges.edges_for(a.id).unwrap().len(), 1);
        assert_eq!(db.facts.active_for(a.id).unwrap().len(), 1);
    }

    // ===== Forget Tests =====

    #[tokio::test]
    async fn test_forget_cascades() {
        let graph = setup().await;
        let db = graph.database();

        let person = db.entities.insert("Target", EntityType::Person, "", None).unwrap();
        let other = db.entities.insert("Other", EntityType::Person, "", None).unwrap();
        db.edges.upsert(person.id, other.id, "knows", "personal", None).unwrap();
        db.facts.upsert(person.id, "home_city", "Boston", None, "biographical", 0.9, None).unwrap();

        assert!(graph.forget(person.id).unwrap());
        assert!(db.entities.get(person.id).unwrap().is_none());
        assert_eq!(db.edges.count().unwrap(), 0);
        assert_eq!(db.facts.count().unwrap(), 0);
        assert!(!graph.forget(person.id).unwrap());
    }

    // ===== Network Tests =====

    #[tokio::test]
    async fn test_entity_network_bounded_by_depth() {
        let graph = setup().await;
        let db = graph.database();

        let a = db.entities.insert("A", EntityType::Person, "", None).unwrap();
        let b = db.entities.insert("B", EntityType::Person, "", None).unwrap();
        let c = db.entities.insert("C", EntityType::Person, "", None).unwrap();
        db.edges.upsert(a.id, b.id, "knows", "personal", None).unwrap();
        db.edges.upsert(b.id, c.id, "knows", "personal", None).unwrap();

        let one_hop = graph.entity_network(a.id, 1).unwrap();
        assert_eq!(one_hop.entities.len(), 2);
        assert_eq!(one_hop.edges.len(), 1);

        let two_hops = graph.entity_network(a.id, 2).unwrap();
        assert_eq!(two_hops.entities.len(), 3);
        assert_eq!(two_hops.edges.len(), 2);
    }

    // ===== Search Tests =====

    #[tokio::test]
    async fn test_search_finds_entities_semantically() {
        let graph = setup().await;
        let mut batch = graph.begin_batch("s1");
        graph
            .upsert_entity(&mention("Quantum Widget Factory", EntityType::Organization), &mut batch)
            .await
            .unwrap();

        let hits = graph.search("widget factory", 5).await.unwrap();
        assert!(!hits.is_empty());
        assert!(matches!(hits[0], SearchHit::Entity { .. }));
    }

    // ===== Tentative Promotion Tests =====

    #[tokio::test]
    async fn test_tentative_promotion_commits_alias() {
        let graph = setup().await;
        let db = graph.database();
        let entity = db.entities.insert("Elizabeth", EntityType::Person, "", None).unwrap();

        for _ in 0..3 {
            db.tentative.record("Beth", EntityType::Person, entity.id, 0.75).unwrap();
        }
        let promoted = graph.promote_ready_tentative().unwrap();

        assert_eq!(promoted, 1);
        let updated = db.entities.get(entity.id).unwrap().unwrap();
        assert!(updated.aliases.contains(&"Beth".to_string()));
        assert_eq!(db.tentative.count().unwrap(), 0);
    }
}
