//! Summary node storage with staleness tracking
//!
//! `events_since_update` only returns to zero through `apply_refresh`; every
//! other mutation path moves it upward.

use crate::graph_db::schema::*;
use crate::graph_db::{format_ts, parse_ts, parse_uuid};
use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Row};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

pub struct SummaryStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl SummaryStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get()
            .map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    pub fn get_or_create(
        &self,
        node_type: SummaryNodeType,
        key: &str,
        parent_id: Option<Uuid>,
    ) -> anyhow::Result<SummaryNode> {
        if let Some(existing) = self.get_by(node_type, key)? {
            return Ok(existing);
        }

        let node = SummaryNode {
            id: Uuid::new_v4(),
            node_type,
            key: key.to_string(),
            parent_id,
            text: String::new(),
            text_embedding: None,
            events_since_update: 0,
            last_updated: Utc::now(),
        };

        let conn = self.get_conn()?;
        // A concurrent creator may win the race; the unique key makes the
        // second insert a no-op and the reread returns the winner.
        conn.execute(
            "INSERT OR IGNORE INTO summary_nodes
             (id, node_type, key, parent_id, text, events_since_update, last_updated)
             VALUES (?1, ?2, ?3, ?4, '', 0, ?5)",
            params![
                node.id.to_string(),
                node_type.as_str(),
                key,
                parent_id.map(|id| id.to_string()),
                format_ts(&node.last_updated),
            ],
        )?;

        self.get_by(node_type, key)?
            .ok_or_else(|| anyhow::anyhow!("Summary node vanished after insert: {}", key))
    }

    pub fn get(&self, id: Uuid) -> anyhow::Result<Option<SummaryNode>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!("{} WHERE id = ?1", SELECT_NODE))?;
        let mut rows = stmt.query([id.to_string()])?;
        if let Some(row) = rows.next()? {
            Ok(Some(row_to_node(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn get_by(&self, node_type: SummaryNodeType, key: &str) -> anyhow::Result<Option<SummaryNode>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE node_type = ?1 AND key = ?2",
            SELECT_NODE
        ))?;
        let mut rows = stmt.query(params![node_type.as_str(), key])?;
        if let Some(row) = rows.next()? {
            Ok(Some(row_to_node(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn bump_staleness(&self, id: Uuid) -> anyhow::Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE summary_nodes SET events_since_update = events_since_update + 1 WHERE id = ?1",
            [id.to_string()],
        )?;
        Ok(())
    }

    /// Nodes whose staleness exceeds the refresh threshold
    pub fn stale_nodes(&self, threshold: i64) -> anyhow::Result<Vec<SummaryNode>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE events_since_update > ?1 ORDER BY events_since_update DESC",
            SELECT_NODE
        ))?;
        let mut rows = stmt.query([threshold])?;
        let mut nodes = Vec::new();
        while let Some(row) = rows.next()? {
            nodes.push(row_to_node(row)?);
        }
        Ok(nodes)
    }

    /// The only path that resets staleness, applied after a successful
    /// refresh.
    pub fn apply_refresh(&self, id: Uuid, text: &str, embedding: Option<&[f32]>) -> anyhow::Result<()> {
        let conn = self.get_conn()?;
        let embedding_blob = match embedding {
            Some(v) => Some(crate::graph_db::encode_vec(v)?),
            None => None,
        };
        conn.execute(
            "UPDATE summary_nodes
             SET text = ?2, text_embedding = ?3, events_since_update = 0, last_updated = ?4
             WHERE id = ?1",
            params![id.to_string(), text, embedding_blob, format_ts(&Utc::now())],
        )?;
        debug!("Refreshed summary node {}", id);
        Ok(())
    }

    pub fn children_of(&self, parent_id: Uuid) -> anyhow::Result<Vec<SummaryNode>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!("{} WHERE parent_id = ?1", SELECT_NODE))?;
        let mut rows = stmt.query([parent_id.to_string()])?;
        let mut nodes = Vec::new();
        while let Some(row) = rows.next()? {
            nodes.push(row_to_node(row)?);
        }
        Ok(nodes)
    }

    pub fn by_type(&self, node_type: SummaryNodeType) -> anyhow::Result<Vec<SummaryNode>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!("{} WHERE node_type = ?1", SELECT_NODE))?;
        let mut rows = stmt.query([node_type.as_str()])?;
        let mut nodes = Vec::new();
        while let Some(row) = rows.next()? {
            nodes.push(row_to_node(row)?);
        }
        Ok(nodes)
    }

    pub fn delete_by(&self, node_type: SummaryNodeType, key: &str) -> anyhow::Result<bool> {
        let conn = self.get_conn()?;
        let deleted = conn.execute(
            "DELETE FROM summary_nodes WHERE node_type = ?1 AND key = ?2",
            params![node_type.as_str(), key],
        )?;
        Ok(deleted > 0)
    }

    /// Latest refresh time per node type, for status introspection
    pub fn latest_refresh_per_type(&self) -> anyhow::Result<Vec<(String, DateTime<Utc>)>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT node_type, MAX(last_updated) FROM summary_nodes GROUP BY node_type",
        )?;
        let mut rows = stmt.query([])?;
        let mut result = Vec::new();
        while let Some(row) = rows.next()? {
            let node_type: String = row.get(0)?;
            let ts: String = row.get(1)?;
            result.push((node_type, parse_ts(&ts)?));
        }
        Ok(result)
    }
}

const SELECT_NODE: &str =
    "SELECT id, node_type, key, parent_id, text, text_embedding, events_since_update, last_updated
     FROM summary_nodes";

fn row_to_node(row: &Row) -> anyhow::Result<SummaryNode> {
    let id_str: String = row.get(0)?;
    let type_str: String = row.get(1)?;
    let parent_str: Option<String> = row.get(3)?;
    let embedding_bytes: Option<Vec<u8>> = row.get(5)?;
    let last_updated_str: String = row.get(7)?;

    let text_embedding = match embedding_bytes {
        Some(bytes) => Some(crate::graph_db::decode_vec(&bytes)?),
        None => None,
    };

    Ok(SummaryNode {
        id: parse_uuid(&id_str)?,
        node_type: SummaryNodeType::parse(&type_str),
        key: row.get(2)?,
        parent_id: parent_str.as_deref().map(parse_uuid).transpose()?,
        text: row.get(4)?,
        text_embedding,
        events_since_update: row.get(6)?,
        last_updated: parse_ts(&last_updated_str)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph_db::GraphDatabase;

    // ===== Creation Tests =====

    #[test]
    fn test_get_or_create_is_idempotent() {
        let db = GraphDatabase::new_in_memory().unwrap();
        let first = db.summaries.get_or_create(SummaryNodeType::Root, "root", None).unwrap();
        let second = db.summaries.get_or_create(SummaryNodeType::Root, "root", None).unwrap();

        assert_eq!(first.id, second.id);
    }

    #[test]
    fn test_children_linked_to_parent() {
        let db = GraphDatabase::new_in_memory().unwrap();
        let root = db.summaries.get_or_create(SummaryNodeType::Root, "root", None).unwrap();
        db.summaries.get_or_create(SummaryNodeType::Channel, "general", Some(root.id)).unwrap();

        let children = db.summaries.children_of(root.id).unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].key, "general");
    }

    // ===== Staleness Tests =====

    #[test]
    fn test_staleness_monotonic_until_refresh() {
        let db = GraphDatabase::new_in_memory().unwrap();
        let node = db.summaries.get_or_create(SummaryNodeType::Entity, "acme", None).unwrap();

        for _ in 0..3 {
            db.summaries.bump_staleness(node.id).unwrap();
        }
        let stale = db.summaries.get(node.id).unwrap().unwrap();
        assert_eq!(stale.events_since_update, 3);

        db.summaries.apply_refresh(node.id, "Acme is a company.", None).unwrap();
        let fresh = db.summaries.get(node.id).unwrap().unwrap();
        assert_eq!(fresh.events_since_update, 0);
        assert_eq!(fresh.text, "Acme is a company.");
        assert!(fresh.last_updated >= stale.last_updated);
    }

    #[test]
    fn test_stale_nodes_respects_threshold() {
        let db = GraphDatabase::new_in_memory().unwrap();
        let a = db.summaries.get_or_create(SummaryNodeType::Entity, "a", None).unwrap();
        let b = db.summaries.get_or_create(SummaryNodeType::Entity, "b", None).unwrap();

        for _ in 0..11 {
            db.summaries.bump_staleness(a.id).unwrap();
        }
        db.summaries.bump_staleness(b.id).unwrap();

        let stale = db.summaries.stale_nodes(10).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, a.id);
    }
}
