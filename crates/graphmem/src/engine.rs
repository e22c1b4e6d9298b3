//! Engine facade: wires the log, graph, summaries, scheduler and assembler
//!
//! `ingest` is the only write entry point for collaborators; everything
//! else the engine does happens off the interactive path through the
//! scheduler. Reads (`assemble_context`, queries, status) go straight to
//! the committed storage snapshot and never wait on background work.

use crate::config::Config;
use crate::context::{Context, ContextAssembler};
use crate::embedding::{EmbeddingProvider, HashEmbedder};
use crate::error::{EngineError, EngineResult};
use crate::extraction::ExtractionJob;
use crate::graph::{EntityNetwork, KnowledgeGraph, SearchHit};
use crate::graph_db::schema::*;
use crate::graph_db::GraphDatabase;
use crate::resolver::Disambiguator;
use crate::scheduler::{ActivityTracker, SchedulerStatus, TaskExecutor, TaskKind, TaskScheduler};
use crate::summary::{ExtractiveSummarizer, Summarizer, SummaryTree};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

/// Health and introspection snapshot
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub scheduler: SchedulerStatus,
    pub pending_events: i64,
    pub resolution_methods: HashMap<String, i64>,
    pub last_refresh: Vec<(String, DateTime<Utc>)>,
    pub graph: GraphStats,
}

/// Injectable collaborators; defaults keep the engine fully offline.
pub struct EngineComponents {
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub summarizer: Arc<dyn Summarizer>,
    pub disambiguator: Option<Arc<dyn Disambiguator>>,
}

impl Default for EngineComponents {
    fn default() -> Self {
        Self {
            embedder: Arc::new(HashEmbedder::default()),
            summarizer: Arc::new(ExtractiveSummarizer::default()),
            disambiguator: None,
        }
    }
}

struct EngineExecutor {
    extraction: Arc<ExtractionJob>,
    summary_tree: Arc<SummaryTree>,
    db: Arc<GraphDatabase>,
    config: Arc<Config>,
}

#[async_trait]
impl TaskExecutor for EngineExecutor {
    async fn execute(&self, kind: &TaskKind) -> EngineResult<()> {
        match kind {
            TaskKind::ExtractPending { limit } => {
                self.extraction.run(*limit).await?;
                Ok(())
            }
            TaskKind::RefreshSummaries => {
                self.summary_tree.refresh_stale().await?;
                Ok(())
            }
            TaskKind::DecayRelevance => {
                self.db
                    .events
                    .decay_relevance(self.config.decay_idle_days, self.config.decay_factor)
                    .map_err(EngineError::task)?;
                self.db
                    .apply_retention(self.config.retention_days)
                    .map_err(EngineError::task)?;
                Ok(())
            }
        }
    }
}

pub struct MemoryEngine {
    config: Arc<Config>,
    db: Arc<GraphDatabase>,
    graph: Arc<KnowledgeGraph>,
    summary_tree: Arc<SummaryTree>,
    assembler: ContextAssembler,
    activity: Arc<ActivityTracker>,
    scheduler: TaskScheduler,
}

impl MemoryEngine {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let db = Arc::new(GraphDatabase::new(&config.db_path)?);
        Self::with_components(config, db, EngineComponents::default())
    }

    pub fn new_in_memory(config: Config) -> anyhow::Result<Self> {
        let db = Arc::new(GraphDatabase::new_in_memory()?);
        Self::with_components(config, db, EngineComponents::default())
    }

    pub fn with_components(
        config: Config,
        db: Arc<GraphDatabase>,
        components: EngineComponents,
    ) -> anyhow::Result<Self> {
        let config = Arc::new(config);

        let graph = Arc::new(KnowledgeGraph::new(
            Arc::clone(&db),
            Arc::clone(&config),
            Arc::clone(&components.embedder),
            components.disambiguator.clone(),
        )?);

        let summary_tree = Arc::new(SummaryTree::new(
            Arc::clone(&db),
            Arc::clone(&config),
            Arc::clone(&components.summarizer),
            Arc::clone(&components.embedder),
        )?);

        let extraction = Arc::new(ExtractionJob::new(
            Arc::clone(&graph),
            Arc::clone(&components.embedder),
            Arc::clone(&config),
        ));

        let activity = Arc::new(ActivityTracker::new(Duration::from_secs(
            config.quiet_threshold_secs,
        )));

        let executor = Arc::new(EngineExecutor {
            extraction,
            summary_tree: Arc::clone(&summary_tree),
            db: Arc::clone(&db),
            config: Arc::clone(&config),
        });

        let scheduler = TaskScheduler::new(
            Arc::clone(&config),
            Arc::clone(&activity),
            executor,
        );

        let assembler = ContextAssembler::new(Arc::clone(&db));

        info!("Memory engine initialized");
        Ok(Self {
            config,
            db,
            graph,
            summary_tree,
            assembler,
            activity,
            scheduler,
        })
    }

    /// Start the background workers. Idempotent.
    pub fn start(&self) {
        self.scheduler.start();
    }

    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }

    /// Append an interaction to the log and queue background maintenance.
    /// Returns the event id; a retried delivery returns the original id.
    pub fn ingest(&self, event: &NewEvent) -> EngineResult<i64> {
        let id = self.db.events.append(event).map_err(EngineError::storage)?;
        self.activity.mark_activity();

        self.scheduler.schedule(TaskKind::ExtractPending {
            limit: self.config.extraction_batch_size,
        });
        self.scheduler.schedule(TaskKind::RefreshSummaries);
        self.scheduler.schedule(TaskKind::DecayRelevance);
        Ok(id)
    }

    /// Token-budgeted context for prompt construction. Read-only.
    pub fn assemble_context(
        &self,
        budget_tokens: usize,
        channel: Option<&str>,
        entity_hint: Option<&str>,
    ) -> EngineResult<Context> {
        self.activity.mark_activity();
        self.assembler.assemble(budget_tokens, channel, entity_hint)
    }

    pub fn find_entity(&self, name: &str) -> EngineResult<Option<Entity>> {
        self.graph.find_entity(name)
    }

    pub async fn search(&self, query: &str, limit: usize) -> EngineResult<Vec<SearchHit>> {
        self.graph.search(query, limit).await
    }

    pub fn entity_network(&self, entity_id: Uuid, depth: usize) -> EngineResult<EntityNetwork> {
        self.graph.entity_network(entity_id, depth)
    }

    pub fn forget(&self, entity_id: Uuid) -> EngineResult<bool> {
        self.graph.forget(entity_id)
    }

    pub fn merge_entities(&self, keep: Uuid, remove: Uuid, reason: &str) -> EngineResult<()> {
        self.graph.merge_entities(keep, remove, reason)
    }

    pub fn status(&self) -> EngineResult<EngineStatus> {
        Ok(EngineStatus {
            scheduler: self.scheduler.status(),
            pending_events: self.db.events.count_pending().map_err(EngineError::storage)?,
            resolution_methods: self.db.metrics.distribution().map_err(EngineError::storage)?,
            last_refresh: self
                .db
                .summaries
                .latest_refresh_per_type()
                .map_err(EngineError::storage)?,
            graph: self.db.get_stats().map_err(EngineError::storage)?,
        })
    }

    pub fn graph(&self) -> &Arc<KnowledgeGraph> {
        &self.graph
    }

    pub fn summary_tree(&self) -> &Arc<SummaryTree> {
        &self.summary_tree
    }

    pub fn database(&self) -> &Arc<GraphDatabase> {
        &self.db
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_config() -> Config {
        let mut config = Config::default();
        config.quiet_threshold_secs = 0;
        config.worker_count = 2;
        config.summary_refresh_min_interval_secs = 0;
        config.retry_base_delay_ms = 20;
        config
    }

    async fn wait_until(deadline_ms: u64, mut check: impl FnMut() -> bool) -> bool {
        let deadline = std::time::Instant::now() + Duration::from_millis(deadline_ms);
        while std::time::Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        check()
    }

    // ===== Ingest Tests =====

    #[tokio::test]
    async fn test_ingest_is_idempotent_for_retried_delivery() {
        let engine = MemoryEngine::new_in_memory(quiet_config()).unwrap();

        let mut event = NewEvent::inbound("general", "s1", "Acme Corp released v2");
        event.timestamp = Some(Utc::now());

        let first = engine.ingest(&event).unwrap();
        let second = engine.ingest(&event).unwrap();

        assert_eq!(first, second);
        assert_eq!(engine.status().unwrap().graph.total_events, 1);
    }

    #[tokio::test]
    async fn test_end_to_end_extraction_builds_graph() {
        let engine = MemoryEngine::new_in_memory(quiet_config()).unwrap();
        engine.start();

        for i in 0..5 {
            engine
                .ingest(&NewEvent::inbound(
                    "general",
                    "s1",
                    &format!("Acme Corp update {}: John Smith works at Acme Corp", i),
                ))
                .unwrap();
        }

        assert!(
            wait_until(10_000, || {
                engine.status().map(|s| s.pending_events == 0).unwrap_or(false)
            })
            .await
        );

        let acme = engine.find_entity("Acme Corp").unwrap().expect("Acme missing");
        assert!(acme.mention_count >= 5);

        let network = engine.entity_network(acme.id, 1).unwrap();
        assert!(network.entities.len() >= 2);

        let status = engine.status().unwrap();
        assert!(status.resolution_methods.values().sum::<i64>() > 0);
        engine.shutdown().await;
    }

    // ===== Context Tests =====

    #[tokio::test]
    async fn test_assemble_context_respects_budget() {
        let engine = MemoryEngine::new_in_memory(quiet_config()).unwrap();
        engine
            .ingest(&NewEvent::inbound("general", "s1", "I love hiking"))
            .unwrap();

        let context = engine.assemble_context(50, Some("general"), None).unwrap();
        assert!(context.total_tokens <= 50);
    }

    // ===== Status Tests =====

    #[tokio::test]
    async fn test_status_reports_queue_and_pending() {
        let engine = MemoryEngine::new_in_memory(quiet_config()).unwrap();
        engine
            .ingest(&NewEvent::inbound("general", "s1", "Acme Corp shipped"))
            .unwrap();

        // Scheduler not started: tasks stay queued, event stays pending
        let status = engine.status().unwrap();
        assert_eq!(status.pending_events, 1);
        assert!(status.scheduler.queue_depth >= 1);
    }

    // ===== Forget Tests =====

    #[tokio::test]
    async fn test_forget_removes_entity_everywhere() {
        let engine = MemoryEngine::new_in_memory(quiet_config()).unwrap();
        let entity = engine
            .database()
            .entities
            .insert("Secret Person", EntityType::Person, "", None)
            .unwrap();

        assert!(engine.forget(entity.id).unwrap());
        assert!(engine.find_entity("Secret Person").unwrap().is_none());
    }
}
