//! Provisional mention-to-entity mappings awaiting confirmation
//!
//! A match in the mid-confidence band is not committed as an alias right
//! away; it accumulates confirmations here first, bounding the damage of a
//! wrong early guess.

use crate::graph_db::schema::*;
use crate::graph_db::{format_ts, parse_ts, parse_uuid};
use chrono::Utc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Row};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// Outcome of recording a tentative resolution
#[derive(Debug, Clone)]
pub enum TentativeOutcome {
    Recorded(TentativeMerge),
    /// A different entity was already tentatively mapped for this mention;
    /// the higher-confidence mapping wins.
    Conflict {
        kept: TentativeMerge,
        rejected_entity: Uuid,
        rejected_confidence: f32,
    },
}

impl TentativeOutcome {
    pub fn merge(&self) -> &TentativeMerge {
        match self {
            Self::Recorded(m) => m,
            Self::Conflict { kept, .. } => kept,
        }
    }
}

pub struct TentativeStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl TentativeStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get()
            .map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    pub fn record(
        &self,
        mention_text: &str,
        entity_type: EntityType,
        entity_id: Uuid,
        confidence: f32,
    ) -> anyhow::Result<TentativeOutcome> {
        let mention_norm = crate::utils::TextUtils::normalize_name(mention_text);
        let mention_norm = mention_norm.as_str();
        if let Some(existing) = self.get(mention_norm, entity_type)? {
            if existing.entity_id == entity_id {
                let conn = self.get_conn()?;
                conn.execute(
                    "UPDATE tentative_merges
                     SET confirmation_count = confirmation_count + 1, confidence = MAX(confidence, ?2)
                     WHERE id = ?1",
                    params![existing.id, confidence],
                )?;
                let updated = self
                    .get(mention_norm, entity_type)?
                    .ok_or_else(|| anyhow::anyhow!("Tentative merge vanished"))?;
                return Ok(TentativeOutcome::Recorded(updated));
            }

            // Disagreement: keep the higher-confidence mapping, log the loser
            if confidence > existing.confidence {
                let conn = self.get_conn()?;
                conn.execute(
                    "UPDATE tentative_merges
                     SET entity_id = ?2, confidence = ?3, confirmation_count = 1, created_at = ?4
                     WHERE id = ?1",
                    params![existing.id, entity_id.to_string(), confidence, format_ts(&Utc::now())],
                )?;
                let kept = self
                    .get(mention_norm, entity_type)?
                    .ok_or_else(|| anyhow::anyhow!("Tentative merge vanished"))?;
                warn!(
                    "Tentative merge conflict for '{}': replaced {} ({:.2}) with {} ({:.2})",
                    mention_norm, existing.entity_id, existing.confidence, entity_id, confidence
                );
                return Ok(TentativeOutcome::Conflict {
                    kept,
                    rejected_entity: existing.entity_id,
                    rejected_confidence: existing.confidence,
                });
            }

            warn!(
                "Tentative merge conflict for '{}': kept {} ({:.2}), rejected {} ({:.2})",
                mention_norm, existing.entity_id, existing.confidence, entity_id, confidence
            );
            return Ok(TentativeOutcome::Conflict {
                kept: existing,
                rejected_entity: entity_id,
                rejected_confidence: confidence,
            });
        }

        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO tentative_merges
             (mention_text, mention_norm, entity_type, entity_id, confidence, confirmation_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)",
            params![
                mention_text,
                mention_norm,
                entity_type.as_str(),
                entity_id.to_string(),
                confidence,
                format_ts(&Utc::now()),
            ],
        )?;
        let created = self
            .get(mention_norm, entity_type)?
            .ok_or_else(|| anyhow::anyhow!("Tentative merge vanished after insert"))?;
        Ok(TentativeOutcome::Recorded(created))
    }

    pub fn get(&self, mention_norm: &str, entity_type: EntityType) -> anyhow::Result<Option<TentativeMerge>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE mention_norm = ?1 AND entity_type = ?2",
            SELECT_TENTATIVE
        ))?;
        let mut rows = stmt.query(params![mention_norm, entity_type.as_str()])?;
        if let Some(row) = rows.next()? {
            Ok(Some(row_to_tentative(row)?))
        } else {
            Ok(None)
        }
    }

    /// Merges that have reached the confirmation count and are ready to be
    /// promoted to permanent aliases
    pub fn ready(&self, confirmations: i64) -> anyhow::Result<Vec<TentativeMerge>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE confirmation_count >= ?1",
            SELECT_TENTATIVE
        ))?;
        let mut rows = stmt.query([confirmations])?;
        let mut merges = Vec::new();
        while let Some(row) = rows.next()? {
            merges.push(row_to_tentative(row)?);
        }
        Ok(merges)
    }

    pub fn remove(&self, id: i64) -> anyhow::Result<()> {
        let conn = self.get_conn()?;
        conn.execute("DELETE FROM tentative_merges WHERE id = ?1", [id])?;
        Ok(())
    }

    pub fn remove_for_entity(&self, entity_id: Uuid) -> anyhow::Result<usize> {
        let conn = self.get_conn()?;
        Ok(conn.execute(
            "DELETE FROM tentative_merges WHERE entity_id = ?1",
            [entity_id.to_string()],
        )?)
    }

    pub fn count(&self) -> anyhow::Result<i64> {
        let conn = self.get_conn()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM tentative_merges", [], |row| row.get(0))?)
    }
}

const SELECT_TENTATIVE: &str =
    "SELECT id, mention_text, mention_norm, entity_type, entity_id, confidence, confirmation_count, created_at
     FROM tentative_merges";

fn row_to_tentative(row: &Row) -> anyhow::Result<TentativeMerge> {
    let type_str: String = row.get(3)?;
    let entity_str: String = row.get(4)?;
    let created_str: String = row.get(7)?;

    Ok(TentativeMerge {
        id: row.get(0)?,
        mention_text: row.get(1)?,
        mention_norm: row.get(2)?,
        entity_type: EntityType::parse(&type_str),
        entity_id: parse_uuid(&entity_str)?,
        confidence: row.get(5)?,
        confirmation_count: row.get(6)?,
        created_at: parse_ts(&created_str)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph_db::GraphDatabase;

    // ===== Confirmation Tests =====

    #[test]
    fn test_repeated_confirmation_increments() {
        let db = GraphDatabase::new_in_memory().unwrap();
        let entity = Uuid::new_v4();

        db.tentative.record("liz", EntityType::Person, entity, 0.75).unwrap();
        db.tentative.record("liz", EntityType::Person, entity, 0.78).unwrap();
        let outcome = db.tentative.record("liz", EntityType::Person, entity, 0.72).unwrap();

        let merge = outcome.merge();
        assert_eq!(merge.confirmation_count, 3);
        assert_eq!(merge.confidence, 0.78);
    }

    #[test]
    fn test_ready_after_threshold() {
        let db = GraphDatabase::new_in_memory().unwrap();
        let entity = Uuid::new_v4();

        for _ in 0..3 {
            db.tentative.record("liz", EntityType::Person, entity, 0.75).unwrap();
        }
        let ready = db.tentative.ready(3).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].entity_id, entity);

        assert!(db.tentative.ready(4).unwrap().is_empty());
    }

    // ===== Conflict Tests =====

    #[test]
    fn test_conflict_keeps_higher_confidence() {
        let db = GraphDatabase::new_in_memory().unwrap();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        db.tentative.record("liz", EntityType::Person, first, 0.72).unwrap();
        let outcome = db.tentative.record("liz", EntityType::Person, second, 0.80).unwrap();

        match outcome {
            TentativeOutcome::Conflict { kept, rejected_entity, .. } => {
                assert_eq!(kept.entity_id, second);
                assert_eq!(kept.confirmation_count, 1);
                assert_eq!(rejected_entity, first);
            }
            other => panic!("Expected conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_conflict_rejects_lower_confidence() {
        let db = GraphDatabase::new_in_memory().unwrap();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        db.tentative.record("liz", EntityType::Person, first, 0.82).unwrap();
        let outcome = db.tentative.record("liz", EntityType::Person, second, 0.71).unwrap();

        match outcome {
            TentativeOutcome::Conflict { kept, rejected_entity, .. } => {
                assert_eq!(kept.entity_id, first);
                assert_eq!(rejected_entity, second);
            }
            other => panic!("Expected conflict, got {:?}", other),
        }
    }
}
