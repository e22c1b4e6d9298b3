//! SQLite storage layer for the memory engine
//!
//! One database, several per-concern stores sharing an r2d2 pool. WAL mode
//! gives concurrent readers a committed snapshot while the single logical
//! writer appends and mutates.

pub mod schema;
pub mod migration;
pub mod event_log;
pub mod entity_store;
pub mod edge_store;
pub mod fact_store;
pub mod summary_store;
pub mod tentative_store;
pub mod metrics_store;

pub use event_log::EventLog;
pub use migration::MigrationManager;
pub use entity_store::EntityStore;
pub use edge_store::EdgeStore;
pub use fact_store::FactStore;
pub use summary_store::SummaryStore;
pub use tentative_store::TentativeStore;
pub use metrics_store::MetricsStore;
pub use schema::*;

use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub struct GraphDatabase {
    pub events: EventLog,
    pub entities: EntityStore,
    pub edges: EdgeStore,
    pub facts: FactStore,
    pub summaries: SummaryStore,
    pub tentative: TentativeStore,
    pub metrics: MetricsStore,
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl GraphDatabase {
    pub fn new(db_path: &Path) -> anyhow::Result<Self> {
        info!("Opening graph database at: {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let manager = SqliteConnectionManager::file(db_path)
            .with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
            );
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| anyhow::anyhow!("Failed to create connection pool: {}", e))?;

        {
            let mut conn = pool.get()?;
            let mut migrator = migration::MigrationManager::new(&mut conn);
            migrator.initialize_database()?;
            conn.execute_batch(
                "PRAGMA foreign_keys = ON;
                 PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA busy_timeout = 5000;",
            )?;
        }
        let pool = Arc::new(pool);
        info!("Graph database initialized successfully");
        Ok(Self::from_pool(pool))
    }

    pub fn new_in_memory() -> anyhow::Result<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)?;
        {
            let conn = pool.get()?;
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            conn.execute_batch(schema::SCHEMA_SQL)?;
        }
        Ok(Self::from_pool(Arc::new(pool)))
    }

    fn from_pool(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self {
            events: EventLog::new(Arc::clone(&pool)),
            entities: EntityStore::new(Arc::clone(&pool)),
            edges: EdgeStore::new(Arc::clone(&pool)),
            facts: FactStore::new(Arc::clone(&pool)),
            summaries: SummaryStore::new(Arc::clone(&pool)),
            tentative: TentativeStore::new(Arc::clone(&pool)),
            metrics: MetricsStore::new(Arc::clone(&pool)),
            pool,
        }
    }

    pub fn get_stats(&self) -> anyhow::Result<GraphStats> {
        let conn = self.pool.get()?;

        fn table_count(conn: &rusqlite::Connection, table: &str) -> i64 {
            conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
                .unwrap_or(0)
        }

        let pending_events: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM events WHERE extraction_status = 'pending'",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        let database_size_bytes: i64 = conn
            .query_row(
                "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        Ok(GraphStats {
            total_events: table_count(&conn, "events"),
            pending_events,
            total_entities: table_count(&conn, "entities"),
            total_edges: table_count(&conn, "edges"),
            total_facts: table_count(&conn, "facts"),
            total_summary_nodes: table_count(&conn, "summary_nodes"),
            database_size_bytes,
        })
    }

    /// Explicit retention policy is the only delete path for events
    pub fn apply_retention(&self, older_than_days: i64) -> anyhow::Result<usize> {
        if older_than_days <= 0 {
            return Ok(0);
        }
        let deleted = self.events.apply_retention(older_than_days)?;
        if deleted > 0 {
            let conn = self.pool.get()?;
            conn.execute_batch("PRAGMA incremental_vacuum(100);")?;
        }
        Ok(deleted)
    }
}

impl Drop for GraphDatabase {
    fn drop(&mut self) {
        if let Ok(conn) = self.pool.get() {
            let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
        }
    }
}

// Shared row-conversion helpers for the per-concern stores

pub(crate) fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

pub(crate) fn parse_ts(s: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .map_err(|e| anyhow::anyhow!("Failed to parse timestamp: {}", e))?
        .with_timezone(&Utc))
}

pub(crate) fn encode_vec(v: &[f32]) -> anyhow::Result<Vec<u8>> {
    Ok(bincode::serialize(v)?)
}

pub(crate) fn decode_vec(bytes: &[u8]) -> anyhow::Result<Vec<f32>> {
    bincode::deserialize(bytes).map_err(|e| anyhow::anyhow!("Deserialization error: {}", e))
}

pub(crate) fn encode_json<T: serde::Serialize>(value: &T) -> anyhow::Result<String> {
    Ok(serde_json::to_string(value)?)
}

pub(crate) fn decode_json<T: serde::de::DeserializeOwned>(s: &str) -> anyhow::Result<T> {
    serde_json::from_str(s).map_err(|e| anyhow::anyhow!("Failed to parse JSON column: {}", e))
}

pub(crate) fn parse_uuid(s: &str) -> anyhow::Result<uuid::Uuid> {
    uuid::Uuid::parse_str(s).map_err(|e| anyhow::anyhow!("Invalid id: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_database_initializes() {
        let db = GraphDatabase::new_in_memory().unwrap();
        let stats = db.get_stats().unwrap();

        assert_eq!(stats.total_events, 0);
        assert_eq!(stats.total_entities, 0);
    }

    #[test]
    fn test_on_disk_database_initializes() {
        let dir = tempfile::tempdir().unwrap();
        let db = GraphDatabase::new(&dir.path().join("graph.db")).unwrap();

        assert_eq!(db.get_stats().unwrap().total_events, 0);
    }

    #[test]
    fn test_retention_noop_when_disabled() {
        let db = GraphDatabase::new_in_memory().unwrap();
        assert_eq!(db.apply_retention(0).unwrap(), 0);
    }
}
