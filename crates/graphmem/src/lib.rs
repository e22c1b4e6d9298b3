// graphmem/crates/graphmem/src/lib.rs

pub mod config;
pub mod context;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod extraction;
pub mod graph;
pub mod graph_db;
pub mod resolver;
pub mod scheduler;
pub mod summary;
pub mod telemetry;
pub mod utils;

// Public API exports
pub use config::Config;
pub use engine::{EngineComponents, EngineStatus, MemoryEngine};
pub use error::{EngineError, EngineResult};
pub use telemetry::init_tracing;

// Component exports
pub use context::{Context, ContextAssembler, ContextSection};
pub use embedding::{EmbeddingProvider, HashEmbedder};
pub use extraction::{ExtractionJob, ExtractionReport, MentionExtractor};
pub use graph::{EntityNetwork, KnowledgeGraph, SearchHit};
pub use graph_db::schema::{
    Direction, Edge, Entity, EntityType, Event, ExtractionStatus, Fact, NewEvent,
    ResolutionMethod, SummaryNode, SummaryNodeType, TentativeMerge,
};
pub use graph_db::GraphDatabase;
pub use resolver::{BatchContext, Disambiguator, EntityResolver, Mention, Resolution};
pub use scheduler::{ActivityTracker, Priority, TaskKind, TaskScheduler, TaskState};
pub use summary::{ExtractiveSummarizer, Summarizer, SummaryTree};
