//! Schema definitions for the knowledge-graph store
//!
//! Four logical relations (events, entities, edges+facts, summary nodes)
//! plus resolution metrics and audit tables. Timestamps are RFC-3339 TEXT,
//! vectors are bincode BLOBs, string lists are JSON TEXT.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "outbound" => Self::Outbound,
            _ => Self::Inbound,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtractionStatus {
    Pending,
    Extracted,
    Skipped,
    Failed,
}

impl ExtractionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Extracted => "extracted",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "extracted" => Self::Extracted,
            "skipped" => Self::Skipped,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// Immutable interaction record. `text` is never mutated after append; only
/// extraction status, relevance and access bookkeeping change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub channel: String,
    pub direction: Direction,
    pub kind: String,
    pub text: String,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
    pub session_key: String,
    pub parent_event_id: Option<i64>,
    pub extraction_status: ExtractionStatus,
    pub relevance_score: f32,
    pub last_accessed: DateTime<Utc>,
}

/// Input shape for appending to the log
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub channel: String,
    pub direction: Direction,
    pub kind: String,
    pub text: String,
    pub session_key: String,
    pub parent_event_id: Option<i64>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl NewEvent {
    pub fn inbound(channel: &str, session_key: &str, text: &str) -> Self {
        Self {
            channel: channel.to_string(),
            direction: Direction::Inbound,
            kind: "message".to_string(),
            text: text.to_string(),
            session_key: session_key.to_string(),
            parent_event_id: None,
            timestamp: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityType {
    Person,
    Organization,
    Location,
    Product,
    Concept,
    Other,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Person => "person",
            Self::Organization => "organization",
            Self::Location => "location",
            Self::Product => "product",
            Self::Concept => "concept",
            Self::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "person" => Self::Person,
            "organization" => Self::Organization,
            "location" => Self::Location,
            "product" => Self::Product,
            "concept" => Self::Concept,
            _ => Self::Other,
        }
    }
}

/// Deduplicated real-world referent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: Uuid,
    pub canonical_name: String,
    pub normalized_name: String,
    pub entity_type: EntityType,
    pub aliases: Vec<String>,
    pub description: String,
    #[serde(skip)]
    pub name_embedding: Option<Vec<f32>>,
    pub mention_count: i64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Directed, strength-weighted relation between two entities. Edges hold
/// ids, never references, so the graph stays an arena without ownership
/// cycles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub id: Uuid,
    pub source_id: Uuid,
    pub target_id: Uuid,
    pub relation_label: String,
    pub relation_type: String,
    pub strength: f32,
    pub source_event_ids: Vec<i64>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Subject-predicate-object triple with temporal validity. A superseded
/// fact keeps its row with `valid_to` set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    pub id: Uuid,
    pub subject_id: Uuid,
    pub predicate: String,
    pub object_text: String,
    pub normalized_object: String,
    pub object_id: Option<Uuid>,
    pub fact_type: String,
    pub confidence: f32,
    pub strength: f32,
    pub source_event_ids: Vec<i64>,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_to: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SummaryNodeType {
    Root,
    Channel,
    Entity,
    Topic,
    Preferences,
}

impl SummaryNodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Root => "root",
            Self::Channel => "channel",
            Self::Entity => "entity",
            Self::Topic => "topic",
            Self::Preferences => "preferences",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "root" => Self::Root,
            "channel" => Self::Channel,
            "entity" => Self::Entity,
            "topic" => Self::Topic,
            _ => Self::Preferences,
        }
    }

    /// Branch nodes synthesize from child summaries only; leaves read their
    /// own source events.
    pub fn is_branch(&self) -> bool {
        matches!(self, Self::Root | Self::Channel)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryNode {
    pub id: Uuid,
    pub node_type: SummaryNodeType,
    pub key: String,
    pub parent_id: Option<Uuid>,
    pub text: String,
    #[serde(skip)]
    pub text_embedding: Option<Vec<f32>>,
    pub events_since_update: i64,
    pub last_updated: DateTime<Utc>,
}

/// Provisional resolution pending repeated confirmation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TentativeMerge {
    pub id: i64,
    pub mention_text: String,
    pub mention_norm: String,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub confidence: f32,
    pub confirmation_count: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResolutionMethod {
    Exact,
    Fuzzy,
    Semantic,
    Contextual,
    Fallback,
    New,
}

impl ResolutionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Fuzzy => "fuzzy",
            Self::Semantic => "semantic",
            Self::Contextual => "contextual",
            Self::Fallback => "fallback",
            Self::New => "new",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "exact" => Self::Exact,
            "fuzzy" => Self::Fuzzy,
            "semantic" => Self::Semantic,
            "contextual" => Self::Contextual,
            "fallback" => Self::Fallback,
            _ => Self::New,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GraphStats {
    pub total_events: i64,
    pub pending_events: i64,
    pub total_entities: i64,
    pub total_edges: i64,
    pub total_facts: i64,
    pub total_summary_nodes: i64,
    pub database_size_bytes: i64,
}

pub const SCHEMA_SQL: &str = "
-- Event log: append-only source of truth
CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TIMESTAMP NOT NULL,
    channel TEXT NOT NULL,
    direction TEXT NOT NULL,
    kind TEXT NOT NULL,
    text TEXT NOT NULL,
    embedding BLOB,
    session_key TEXT NOT NULL,
    parent_event_id INTEGER,
    extraction_status TEXT NOT NULL DEFAULT 'pending',
    relevance_score REAL NOT NULL DEFAULT 0.5,
    last_accessed TIMESTAMP NOT NULL,
    content_hash TEXT NOT NULL,
    FOREIGN KEY (parent_event_id) REFERENCES events(id)
);
-- Entities
CREATE TABLE IF NOT EXISTS entities (
    id TEXT PRIMARY KEY,
    canonical_name TEXT NOT NULL,
    normalized_name TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    aliases TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    name_embedding BLOB,
    mention_count INTEGER NOT NULL DEFAULT 1,
    first_seen TIMESTAMP NOT NULL,
    last_seen TIMESTAMP NOT NULL
);
-- Edges
CREATE TABLE IF NOT EXISTS edges (
    id TEXT PRIMARY KEY,
    source_id TEXT NOT NULL,
    target_id TEXT NOT NULL,
    relation_label TEXT NOT NULL,
    relation_type TEXT NOT NULL,
    strength REAL NOT NULL,
    source_event_ids TEXT NOT NULL,
    first_seen TIMESTAMP NOT NULL,
    last_seen TIMESTAMP NOT NULL,
    FOREIGN KEY (source_id) REFERENCES entities(id) ON DELETE CASCADE,
    FOREIGN KEY (target_id) REFERENCES entities(id) ON DELETE CASCADE,
    UNIQUE(source_id, target_id, relation_type)
);
-- Facts
CREATE TABLE IF NOT EXISTS facts (
    id TEXT PRIMARY KEY,
    subject_id TEXT NOT NULL,
    predicate TEXT NOT NULL,
    object_text TEXT NOT NULL,
    normalized_object TEXT NOT NULL,
    object_id TEXT,
    fact_type TEXT NOT NULL,
    confidence REAL NOT NULL,
    strength REAL NOT NULL,
    source_event_ids TEXT NOT NULL,
    valid_from TIMESTAMP,
    valid_to TIMESTAMP,
    FOREIGN KEY (subject_id) REFERENCES entities(id) ON DELETE CASCADE
);
-- Summary tree
CREATE TABLE IF NOT EXISTS summary_nodes (
    id TEXT PRIMARY KEY,
    node_type TEXT NOT NULL,
    key TEXT NOT NULL,
    parent_id TEXT,
    text TEXT NOT NULL DEFAULT '',
    text_embedding BLOB,
    events_since_update INTEGER NOT NULL DEFAULT 0,
    last_updated TIMESTAMP NOT NULL,
    UNIQUE(node_type, key)
);
-- Tentative merges
CREATE TABLE IF NOT EXISTS tentative_merges (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    mention_text TEXT NOT NULL,
    mention_norm TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    confidence REAL NOT NULL,
    confirmation_count INTEGER NOT NULL DEFAULT 1,
    created_at TIMESTAMP NOT NULL,
    UNIQUE(mention_norm, entity_type)
);
-- Resolution metrics
CREATE TABLE IF NOT EXISTS resolution_metrics (
    method TEXT PRIMARY KEY,
    count INTEGER NOT NULL DEFAULT 0
);
-- Merge audit trail
CREATE TABLE IF NOT EXISTS merge_audit (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kept_id TEXT NOT NULL,
    removed_id TEXT NOT NULL,
    reason TEXT NOT NULL,
    merged_at TIMESTAMP NOT NULL
);
-- Indexes for performance
CREATE UNIQUE INDEX IF NOT EXISTS idx_events_content_hash ON events (content_hash);
CREATE INDEX IF NOT EXISTS idx_events_status ON events (extraction_status, id);
CREATE INDEX IF NOT EXISTS idx_events_channel ON events (channel, timestamp);
CREATE INDEX IF NOT EXISTS idx_events_session ON events (session_key);
CREATE INDEX IF NOT EXISTS idx_entities_normalized ON entities (normalized_name);
CREATE INDEX IF NOT EXISTS idx_entities_type_seen ON entities (entity_type, last_seen);
CREATE INDEX IF NOT EXISTS idx_edges_source ON edges (source_id);
CREATE INDEX IF NOT EXISTS idx_edges_target ON edges (target_id);
CREATE INDEX IF NOT EXISTS idx_facts_subject ON facts (subject_id, predicate);
CREATE INDEX IF NOT EXISTS idx_summary_parent ON summary_nodes (parent_id);
";
