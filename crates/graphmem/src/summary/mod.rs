//! Hierarchical, staleness-driven summaries over the graph and log
//!
//! Leaves (entity, topic, preferences) read their own sources plus their
//! previous text; branches (channel, root) synthesize from child summaries
//! only, which bounds refresh cost at any depth. Refresh is the single call
//! site for the text-generation collaborator and the single path that
//! resets staleness.

use crate::config::Config;
use crate::embedding::EmbeddingProvider;
use crate::error::{EngineError, EngineResult};
use crate::graph_db::schema::*;
use crate::graph_db::GraphDatabase;
use crate::utils::TextUtils;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Text-generation collaborator. Only `SummaryTree::refresh_stale` calls
/// this, batched per cycle and rate-limited; it is never on the
/// interactive path.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, source_texts: &[String], previous_summary: &str) -> EngineResult<String>;
}

/// Model-free default: stitches the leading sentences of the most recent
/// sources onto the carried summary, token-capped. Keeps the engine fully
/// functional offline.
pub struct ExtractiveSummarizer {
    max_tokens: usize,
}

impl ExtractiveSummarizer {
    pub fn new(max_tokens: usize) -> Self {
        Self { max_tokens }
    }
}

impl Default for ExtractiveSummarizer {
    fn default() -> Self {
        Self::new(160)
    }
}

#[async_trait]
impl Summarizer for ExtractiveSummarizer {
    async fn summarize(&self, source_texts: &[String], previous_summary: &str) -> EngineResult<String> {
        let mut parts: Vec<String> = Vec::new();
        if !previous_summary.trim().is_empty() {
            parts.push(TextUtils::first_sentence(previous_summary, 240).to_string());
        }
        for source in source_texts {
            let sentence = TextUtils::first_sentence(source, 160);
            if !sentence.is_empty() && !parts.iter().any(|p| p.as_str() == sentence) {
                parts.push(sentence.to_string());
            }
        }
        let joined = parts.join(" ");
        Ok(TextUtils::truncate_to_tokens(&joined, self.max_tokens).into_owned())
    }
}

#[derive(Debug, Default, Clone)]
pub struct RefreshReport {
    pub nodes_refreshed: usize,
    pub nodes_failed: usize,
    pub nodes_pending: usize,
}

pub struct SummaryTree {
    db: Arc<GraphDatabase>,
    config: Arc<Config>,
    summarizer: Arc<dyn Summarizer>,
    embedder: Arc<dyn EmbeddingProvider>,
    last_cycle: Mutex<Option<Instant>>,
}

impl SummaryTree {
    pub fn new(
        db: Arc<GraphDatabase>,
        config: Arc<Config>,
        summarizer: Arc<dyn Summarizer>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> anyhow::Result<Self> {
        let tree = Self {
            db,
            config,
            summarizer,
            embedder,
            last_cycle: Mutex::new(None),
        };
        tree.ensure_roots()?;
        Ok(tree)
    }

    /// The root and preferences nodes always exist; preferences is included
    /// in every context read regardless of staleness.
    fn ensure_roots(&self) -> anyhow::Result<()> {
        let root = self.db.summaries.get_or_create(SummaryNodeType::Root, "root", None)?;
        self.db
            .summaries
            .get_or_create(SummaryNodeType::Preferences, "preferences", Some(root.id))?;
        Ok(())
    }

    /// Refresh every node past the staleness threshold, leaves before
    /// branches so parents synthesize current children. Rate-limited per
    /// cycle; individual node failures leave that node stale and move on.
    pub async fn refresh_stale(&self) -> EngineResult<RefreshReport> {
        {
            let mut last = self.last_cycle.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(at) = *last {
                let min_interval = std::time::Duration::from_secs(self.config.summary_refresh_min_interval_secs);
                if at.elapsed() < min_interval {
                    debug!("Summary refresh cycle skipped (rate limit)");
                    return Ok(RefreshReport::default());
                }
            }
            *last = Some(Instant::now());
        }

        let mut stale = self
            .db
            .summaries
            .stale_nodes(self.config.staleness_threshold)
            .map_err(EngineError::storage)?;
        if stale.is_empty() {
            return Ok(RefreshReport::default());
        }

        stale.sort_by_key(|node| node.node_type.is_branch());

        let mut report = RefreshReport::default();
        for node in stale {
            match self.refresh_node(&node).await {
                Ok(()) => report.nodes_refreshed += 1,
                Err(e) => {
                    // The node keeps its staleness and is retried next cycle
                    warn!("Refresh failed for summary node {}: {}", node.key, e);
                    report.nodes_failed += 1;
                }
            }
        }

        report.nodes_pending = self
            .db
            .summaries
            .stale_nodes(self.config.staleness_threshold)
            .map_err(EngineError::storage)?
            .len();
        info!(
            "Summary refresh cycle: {} refreshed, {} failed",
            report.nodes_refreshed, report.nodes_failed
        );
        Ok(report)
    }

    async fn refresh_node(&self, node: &SummaryNode) -> EngineResult<()> {
        let sources = self.collect_sources(node)?;
        let text = self.summarizer.summarize(&sources, &node.text).await?;

        let embedding = if text.trim().is_empty() {
            None
        } else {
            match self.embedder.embed(&text).await {
                Ok(vector) => Some(vector),
                Err(EngineError::EmbeddingUnavailable(_)) => None,
                Err(e) => return Err(e),
            }
        };

        self.db
            .summaries
            .apply_refresh(node.id, &text, embedding.as_deref())
            .map_err(EngineError::storage)
    }

    fn collect_sources(&self, node: &SummaryNode) -> EngineResult<Vec<String>> {
        match node.node_type {
            // Branches never read raw events
            SummaryNodeType::Root | SummaryNodeType::Channel => {
                let children = self
                    .db
                    .summaries
                    .children_of(node.id)
                    .map_err(EngineError::storage)?;
                Ok(children
                    .into_iter()
                    .filter(|child| !child.text.trim().is_empty())
                    .map(|child| child.text)
                    .collect())
            }
            SummaryNodeType::Entity => {
                let entity_id = crate::graph_db::parse_uuid(&node.key).map_err(EngineError::storage)?;
                let entity = self
                    .db
                    .entities
                    .get(entity_id)
                    .map_err(EngineError::storage)?;
                let Some(entity) = entity else {
                    return Ok(Vec::new());
                };

                let mut sources: Vec<String> = self
                    .db
                    .facts
                    .active_for(entity.id)
                    .map_err(EngineError::storage)?
                    .into_iter()
                    .map(|fact| format!("{} {} {}.", entity.canonical_name, fact.predicate, fact.object_text))
                    .collect();
                sources.extend(
                    self.db
                        .events
                        .mentioning(&entity.canonical_name, self.config.summary_max_sources)
                        .map_err(EngineError::storage)?
                        .into_iter()
                        .map(|event| event.text),
                );
                sources.truncate(self.config.summary_max_sources);
                Ok(sources)
            }
            SummaryNodeType::Topic => Ok(self
                .db
                .events
                .mentioning(&node.key, self.config.summary_max_sources)
                .map_err(EngineError::storage)?
                .into_iter()
                .map(|event| event.text)
                .collect()),
            SummaryNodeType::Preferences => Ok(self
                .db
                .facts
                .active_by_type("preference", self.config.summary_max_sources)
                .map_err(EngineError::storage)?
                .into_iter()
                .map(|fact| format!("{}: {}.", fact.predicate.replace('_', " "), fact.object_text))
                .collect()),
        }
    }

    /// Preferences summary for context assembly, present even if empty
    pub fn preferences(&self) -> EngineResult<Option<SummaryNode>> {
        self.db
            .summaries
            .get_by(SummaryNodeType::Preferences, "preferences")
            .map_err(EngineError::storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;

    fn setup() -> (Arc<GraphDatabase>, SummaryTree) {
        let db = Arc::new(GraphDatabase::new_in_memory().unwrap());
        let mut config = Config::default();
        config.summary_refresh_min_interval_secs = 0;
        let config = Arc::new(config);
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(HashEmbedder::new(config.embedding_dim));
        let tree = SummaryTree::new(
            Arc::clone(&db),
            config,
            Arc::new(ExtractiveSummarizer::default()),
            embedder,
        )
        .unwrap();
        (db, tree)
    }

    // ===== Structure Tests =====

    #[test]
    fn test_roots_exist_after_init() {
        let (db, _tree) = setup();

        assert!(db.summaries.get_by(SummaryNodeType::Root, "root").unwrap().is_some());
        assert!(db.summaries.get_by(SummaryNodeType::Preferences, "preferences").unwrap().is_some());
    }

    // ===== Refresh Tests =====

    #[tokio::test]
    async fn test_refresh_resets_only_stale_nodes() {
        let (db, tree) = setup();
        let entity = db.entities.insert("Acme", EntityType::Organization, "", None).unwrap();
        db.events
            .append(&NewEvent::inbound("general", "s1", "Acme shipped the new release. Later detail."))
            .unwrap();

        let node = db
            .summaries
            .get_or_create(SummaryNodeType::Entity, &entity.id.to_string(), None)
            .unwrap();
        for _ in 0..11 {
            db.summaries.bump_staleness(node.id).unwrap();
        }
        let fresh_node = db
            .summaries
            .get_or_create(SummaryNodeType::Entity, "untouched", None)
            .unwrap();

        let report = tree.refresh_stale().await.unwrap();
        assert_eq!(report.nodes_refreshed, 1);

        let refreshed = db.summaries.get(node.id).unwrap().unwrap();
        assert_eq!(refreshed.events_since_update, 0);
        assert!(refreshed.text.contains("Acme shipped the new release."));

        let untouched = db.summaries.get(fresh_node.id).unwrap().unwrap();
        assert_eq!(untouched.events_since_update, 0);
        assert!(untouched.text.is_empty());
    }

    #[tokio::test]
    async fn test_branch_refresh_reads_children_only() {
        let (db, tree) = setup();
        let root = db.summaries.get_by(SummaryNodeType::Root, "root").unwrap().unwrap();
        let channel = db
            .summaries
            .get_or_create(SummaryNodeType::Channel, "general", Some(root.id))
            .unwrap();
        let leaf = db
            .summaries
            .get_or_create(SummaryNodeType::Topic, "planning", Some(channel.id))
            .unwrap();
        db.summaries.apply_refresh(leaf.id, "Planning is on track.", None).unwrap();

        for _ in 0..11 {
            db.summaries.bump_staleness(channel.id).unwrap();
        }
        tree.refresh_stale().await.unwrap();

        let refreshed = db.summaries.get(channel.id).unwrap().unwrap();
        assert!(refreshed.text.contains("Planning is on track."));
    }

    #[tokio::test]
    async fn test_preferences_summary_from_facts() {
        let (db, tree) = setup();
        let owner = db.entities.insert("User", EntityType::Person, "", None).unwrap();
        db.facts.upsert(owner.id, "favorite_color", "blue", None, "preference", 0.9, None).unwrap();

        let preferences = tree.preferences().unwrap().unwrap();
        for _ in 0..11 {
            db.summaries.bump_staleness(preferences.id).unwrap();
        }
        tree.refresh_stale().await.unwrap();

        let refreshed = tree.preferences().unwrap().unwrap();
        assert!(refreshed.text.contains("favorite color"));
        assert!(refreshed.text.contains("blue"));
    }

    // ===== Rate Limit Tests =====

    #[tokio::test]
    async fn test_rate_limit_skips_back_to_back_cycles() {
        let db = Arc::new(GraphDatabase::new_in_memory().unwrap());
        let mut config = Config::default();
        config.summary_refresh_min_interval_secs = 3_600;
        let config = Arc::new(config);
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(HashEmbedder::new(config.embedding_dim));
        let tree = SummaryTree::new(
            Arc::clone(&db),
            config,
            Arc::new(ExtractiveSummarizer::default()),
            embedder,
        )
        .unwrap();

        let node = db.summaries.get_or_create(SummaryNodeType::Topic, "x", None).unwrap();
        for _ in 0..11 {
            db.summaries.bump_staleness(node.id).unwrap();
        }

        let first = tree.refresh_stale().await.unwrap();
        assert_eq!(first.nodes_refreshed, 1);

        for _ in 0..11 {
            db.summaries.bump_staleness(node.id).unwrap();
        }
        let second = tree.refresh_stale().await.unwrap();
        assert_eq!(second.nodes_refreshed, 0);
    }

    // ===== Summarizer Tests =====

    #[tokio::test]
    async fn test_extractive_summarizer_carries_previous() {
        let summarizer = ExtractiveSummarizer::default();
        let text = summarizer
            .summarize(
                &["New information arrived. Trailing detail.".to_string()],
                "Old summary here.",
            )
            .await
            .unwrap();

        assert!(text.contains("Old summary here."));
        assert!(text.contains("New information arrived."));
        assert!(!text.contains("Trailing detail"));
    }
}
