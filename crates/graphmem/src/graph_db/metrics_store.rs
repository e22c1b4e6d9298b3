//! Resolution-method counters for status introspection

use crate::graph_db::schema::ResolutionMethod;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use std::collections::HashMap;
use std::sync::Arc;

pub struct MetricsStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl MetricsStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get()
            .map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    pub fn record(&self, method: ResolutionMethod) -> anyhow::Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO resolution_metrics (method, count) VALUES (?1, 1)
             ON CONFLICT(method) DO UPDATE SET count = count + 1",
            params![method.as_str()],
        )?;
        Ok(())
    }

    /// How often each resolution stage has decided the outcome
    pub fn distribution(&self) -> anyhow::Result<HashMap<String, i64>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare("SELECT method, count FROM resolution_metrics")?;
        let mut rows = stmt.query([])?;
        let mut distribution = HashMap::new();
        while let Some(row) = rows.next()? {
            let method: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            distribution.insert(method, count);
        }
        Ok(distribution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph_db::GraphDatabase;

    #[test]
    fn test_record_and_distribution() {
        let db = GraphDatabase::new_in_memory().unwrap();

        db.metrics.record(ResolutionMethod::Exact).unwrap();
        db.metrics.record(ResolutionMethod::Exact).unwrap();
        db.metrics.record(ResolutionMethod::New).unwrap();

        let dist = db.metrics.distribution().unwrap();
        assert_eq!(dist.get("exact"), Some(&2));
        assert_eq!(dist.get("new"), Some(&1));
        assert_eq!(dist.get("fuzzy"), None);
    }
}
