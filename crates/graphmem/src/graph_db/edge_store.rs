//! Typed relation storage between entities
//!
//! Edges are deduplicated on (source, target, relation_type). Strength only
//! grows, saturating at 1.0; re-observation extends `last_seen` and records
//! the supporting event.

use crate::graph_db::schema::*;
use crate::graph_db::{decode_json, encode_json, format_ts, parse_ts, parse_uuid};
use chrono::Utc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Row};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

const INITIAL_STRENGTH: f32 = 0.3;
const REINFORCEMENT: f32 = 0.1;

pub struct EdgeStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl EdgeStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get()
            .map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    pub fn upsert(
        &self,
        source_id: Uuid,
        target_id: Uuid,
        relation_label: &str,
        relation_type: &str,
        source_event_id: Option<i64>,
    ) -> anyhow::Result<Edge> {
        let now = Utc::now();

        if let Some(mut existing) = self.find(source_id, target_id, relation_type)? {
            existing.strength = (existing.strength + REINFORCEMENT).min(1.0);
            existing.last_seen = now;
            if let Some(event_id) = source_event_id {
                if !existing.source_event_ids.contains(&event_id) {
                    existing.source_event_ids.push(event_id);
                }
            }

            let conn = self.get_conn()?;
            conn.execute(
                "UPDATE edges SET strength = ?2, last_seen = ?3, source_event_ids = ?4 WHERE id = ?1",
                params![
                    existing.id.to_string(),
                    existing.strength,
                    format_ts(&now),
                    encode_json(&existing.source_event_ids)?,
                ],
            )?;
            debug!("Reinforced edge {} ({} -> {})", existing.id, source_id, target_id);
            return Ok(existing);
        }

        let edge = Edge {
            id: Uuid::new_v4(),
            source_id,
            target_id,
            relation_label: relation_label.to_string(),
            relation_type: relation_type.to_string(),
            strength: INITIAL_STRENGTH,
            source_event_ids: source_event_id.into_iter().collect(),
            first_seen: now,
            last_seen: now,
        };

        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO edges
             (id, source_id, target_id, relation_label, relation_type, strength,
              source_event_ids, first_seen, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                edge.id.to_string(),
                source_id.to_string(),
                target_id.to_string(),
                &edge.relation_label,
                &edge.relation_type,
                edge.strength,
                encode_json(&edge.source_event_ids)?,
                format_ts(&now),
            ],
        )?;
        debug!("Created edge {} -> {} [{}]", source_id, target_id, relation_label);
        Ok(edge)
    }

    pub fn find(
        &self,
        source_id: Uuid,
        target_id: Uuid,
        relation_type: &str,
    ) -> anyhow::Result<Option<Edge>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE source_id = ?1 AND target_id = ?2 AND relation_type = ?3",
            SELECT_EDGE
        ))?;
        let mut rows = stmt.query(params![
            source_id.to_string(),
            target_id.to_string(),
            relation_type
        ])?;
        if let Some(row) = rows.next()? {
            Ok(Some(row_to_edge(row)?))
        } else {
            Ok(None)
        }
    }

    /// All edges touching an entity, either direction
    pub fn edges_for(&self, entity_id: Uuid) -> anyhow::Result<Vec<Edge>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE source_id = ?1 OR target_id = ?1 ORDER BY strength DESC",
            SELECT_EDGE
        ))?;
        let mut rows = stmt.query([entity_id.to_string()])?;
        let mut edges = Vec::new();
        while let Some(row) = rows.next()? {
            edges.push(row_to_edge(row)?);
        }
        Ok(edges)
    }

    /// Ids of entities one hop away
    pub fn neighbors(&self, entity_id: Uuid) -> anyhow::Result<Vec<Uuid>> {
        let edges = self.edges_for(entity_id)?;
        let mut ids = Vec::new();
        for edge in edges {
            let other = if edge.source_id == entity_id { edge.target_id } else { edge.source_id };
            if !ids.contains(&other) {
                ids.push(other);
            }
        }
        Ok(ids)
    }

    /// Move every edge endpoint from `old` to `new`, merging rows that
    /// collide with an existing (source, target, relation_type) key and
    /// dropping self-loops produced by the rewrite.
    pub fn reassign(&self, old: Uuid, new: Uuid) -> anyhow::Result<usize> {
        let edges = self.edges_for(old)?;
        let conn = self.get_conn()?;
        let mut moved = 0;

        for edge in edges {
            let source = if edge.source_id == old { new } else { edge.source_id };
            let target = if edge.target_id == old { new } else { edge.target_id };

            if source == target {
                conn.execute("DELETE FROM edges WHERE id = ?1", [edge.id.to_string()])?;
                continue;
            }

            if let Some(mut existing) = self.find(source, target, &edge.relation_type)? {
                existing.strength = existing.strength.max(edge.strength);
                existing.first_seen = existing.first_seen.min(edge.first_seen);
                existing.last_seen = existing.last_seen.max(edge.last_seen);
                for event_id in &edge.source_event_ids {
                    if !existing.source_event_ids.contains(event_id) {
                        existing.source_event_ids.push(*event_id);
                    }
                }
                conn.execute(
                    "UPDATE edges SET strength = ?2, first_seen = ?3, last_seen = ?4, source_event_ids = ?5
                     WHERE id = ?1",
                    params![
                        existing.id.to_string(),
                        existing.strength,
                        format_ts(&existing.first_seen),
                        format_ts(&existing.last_seen),
                        encode_json(&existing.source_event_ids)?,
                    ],
                )?;
                conn.execute("DELETE FROM edges WHERE id = ?1", [edge.id.to_string()])?;
            } else {
                conn.execute(
                    "UPDATE edges SET source_id = ?2, target_id = ?3 WHERE id = ?1",
                    params![edge.id.to_string(), source.to_string(), target.to_string()],
                )?;
            }
            moved += 1;
        }
        Ok(moved)
    }

    pub fn count(&self) -> anyhow::Result<i64> {
        let conn = self.get_conn()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM edges", [], |row| row.get(0))?)
    }
}

const SELECT_EDGE: &str =
    "SELECT id, source_id, target_id, relation_label, relation_type, strength,
            source_event_ids, first_seen, last_seen
     FROM edges";

fn row_to_edge(row: &Row) -> anyhow::Result<Edge> {
    let id_str: String = row.get(0)?;
    let source_str: String = row.get(1)?;
    let target_str: String = row.get(2)?;
    let events_json: String = row.get(6)?;
    let first_seen_str: String = row.get(7)?;
    let last_seen_str: String = row.get(8)?;

    Ok(Edge {
        id: parse_uuid(&id_str)?,
        source_id: parse_uuid(&source_str)?,
        target_id: parse_uuid(&target_str)?,
        relation_label: row.get(3)?,
        relation_type: row.get(4)?,
        strength: row.get(5)?,
        source_event_ids: decode_json(&events_json)?,
        first_seen: parse_ts(&first_seen_str)?,
        last_seen: parse_ts(&last_seen_str)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph_db::GraphDatabase;

    fn two_entities(db: &GraphDatabase) -> (Uuid, Uuid) {
        let a = db.entities.insert("Alice", EntityType::Person, "", None).unwrap();
        let b = db.entities.insert("Acme", EntityType::Organization, "", None).unwrap();
        (a.id, b.id)
    }

    // ===== Upsert Tests =====

    #[test]
    fn test_upsert_creates_then_reinforces() {
        let db = GraphDatabase::new_in_memory().unwrap();
        let (a, b) = two_entities(&db);

        let first = db.edges.upsert(a, b, "works at", "professional", Some(1)).unwrap();
        assert_eq!(first.strength, INITIAL_STRENGTH);

        let second = db.edges.upsert(a, b, "works at", "professional", Some(2)).unwrap();
        assert_eq!(second.id, first.id);
        assert!(second.strength > first.strength);
        assert_eq!(second.source_event_ids, vec![1, 2]);
    }

    #[test]
    fn test_strength_saturates_at_one() {
        let db = GraphDatabase::new_in_memory().unwrap();
        let (a, b) = two_entities(&db);

        for i in 0..20 {
            db.edges.upsert(a, b, "works at", "professional", Some(i)).unwrap();
        }
        let edge = db.edges.find(a, b, "professional").unwrap().unwrap();
        assert!(edge.strength <= 1.0);
    }

    #[test]
    fn test_distinct_relation_types_not_merged() {
        let db = GraphDatabase::new_in_memory().unwrap();
        let (a, b) = two_entities(&db);

        db.edges.upsert(a, b, "works at", "professional", None).unwrap();
        db.edges.upsert(a, b, "visited", "spatial", None).unwrap();

        assert_eq!(db.edges.count().unwrap(), 2);
    }

    // ===== Neighbor Tests =====

    #[test]
    fn test_neighbors_both_directions() {
        let db = GraphDatabase::new_in_memory().unwrap();
        let (a, b) = two_entities(&db);
        let c = db.entities.insert("Boston", EntityType::Location, "", None).unwrap();

        db.edges.upsert(a, b, "works at", "professional", None).unwrap();
        db.edges.upsert(c.id, a, "home of", "spatial", None).unwrap();

        let neighbors = db.edges.neighbors(a).unwrap();
        assert_eq!(neighbors.len(), 2);
        assert!(neighbors.contains(&b));
        assert!(neighbors.contains(&c.id));
    }

    // ===== Reassignment Tests =====

    #[test]
    fn test_reassign_merges_colliding_edges() {
        let db = GraphDatabase::new_in_memory().unwrap();
        let (a, b) = two_entities(&db);
        let dup = db.entities.insert("Alyce", EntityType::Person, "", None).unwrap();

        db.edges.upsert(a, b, "works at", "professional", Some(1)).unwrap();
        db.edges.upsert(dup.id, b, "works at", "professional", Some(2)).unwrap();

        db.edges.reassign(dup.id, a).unwrap();

        assert_eq!(db.edges.count().unwrap(), 1);
        let merged = db.edges.find(a, b, "professional").unwrap().unwrap();
        assert_eq!(merged.source_event_ids.len(), 2);
    }

    #[test]
    fn test_reassign_drops_self_loops() {
        let db = GraphDatabase::new_in_memory().unwrap();
        let (a, _) = two_entities(&db);
        let dup = db.entities.insert("Alyce", EntityType::Person, "", None).unwrap();

        db.edges.upsert(a, dup.id, "same as", "association", None).unwrap();
        db.edges.reassign(dup.id, a).unwrap();

        assert_eq!(db.edges.count().unwrap(), 0);
    }
}
