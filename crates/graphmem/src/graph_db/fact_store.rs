//! Subject-predicate-object facts with temporal validity
//!
//! A new object for an existing (subject, predicate) never overwrites: the
//! prior fact is closed with `valid_to` and a new row is inserted, keeping
//! history for audit and contradiction resolution.

use crate::graph_db::schema::*;
use crate::graph_db::{decode_json, encode_json, format_ts, parse_ts, parse_uuid};
use crate::utils::TextUtils;
use chrono::Utc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Row};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

const REINFORCEMENT: f32 = 0.1;

pub struct FactStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl FactStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get()
            .map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn upsert(
        &self,
        subject_id: Uuid,
        predicate: &str,
        object_text: &str,
        object_id: Option<Uuid>,
        fact_type: &str,
        confidence: f32,
        source_event_id: Option<i64>,
    ) -> anyhow::Result<Fact> {
        let now = Utc::now();
        let normalized_object = TextUtils::normalize_name(object_text);

        if let Some(mut active) = self.active(subject_id, predicate)? {
            if active.normalized_object == normalized_object {
                // Re-observation of the same value reinforces it
                active.strength = (active.strength + REINFORCEMENT).min(1.0);
                active.confidence = active.confidence.max(confidence);
                if let Some(event_id) = source_event_id {
                    if !active.source_event_ids.contains(&event_id) {
                        active.source_event_ids.push(event_id);
                    }
                }
                let conn = self.get_conn()?;
                conn.execute(
                    "UPDATE facts SET strength = ?2, confidence = ?3, source_event_ids = ?4 WHERE id = ?1",
                    params![
                        active.id.to_string(),
                        active.strength,
                        active.confidence,
                        encode_json(&active.source_event_ids)?,
                    ],
                )?;
                return Ok(active);
            }

            // Contradicting value: supersede, keep the old row for history
            let conn = self.get_conn()?;
            conn.execute(
                "UPDATE facts SET valid_to = ?2 WHERE id = ?1",
                params![active.id.to_string(), format_ts(&now)],
            )?;
            debug!(
                "Superseded fact ({} {}) '{}' -> '{}'",
                subject_id, predicate, active.object_text, object_text
            );
        }

        let fact = Fact {
            id: Uuid::new_v4(),
            subject_id,
            predicate: predicate.to_string(),
            object_text: object_text.to_string(),
            normalized_object,
            object_id,
            fact_type: fact_type.to_string(),
            confidence,
            strength: 0.3,
            source_event_ids: source_event_id.into_iter().collect(),
            valid_from: Some(now),
            valid_to: None,
        };

        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO facts
             (id, subject_id, predicate, object_text, normalized_object, object_id,
              fact_type, confidence, strength, source_event_ids, valid_from, valid_to)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, NULL)",
            params![
                fact.id.to_string(),
                subject_id.to_string(),
                &fact.predicate,
                &fact.object_text,
                &fact.normalized_object,
                fact.object_id.map(|id| id.to_string()),
                &fact.fact_type,
                fact.confidence,
                fact.strength,
                encode_json(&fact.source_event_ids)?,
                format_ts(&now),
            ],
        )?;
        Ok(fact)
    }

    /// The currently-valid fact for (subject, predicate), if any
    pub fn active(&self, subject_id: Uuid, predicate: &str) -> anyhow::Result<Option<Fact>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE subject_id = ?1 AND predicate = ?2 AND valid_to IS NULL
             ORDER BY valid_from DESC LIMIT 1",
            SELECT_FACT
        ))?;
        let mut rows = stmt.query(params![subject_id.to_string(), predicate])?;
        if let Some(row) = rows.next()? {
            Ok(Some(row_to_fact(row)?))
        } else {
            Ok(None)
        }
    }

    /// All currently-valid facts about a subject
    pub fn active_for(&self, subject_id: Uuid) -> anyhow::Result<Vec<Fact>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE subject_id = ?1 AND valid_to IS NULL ORDER BY strength DESC",
            SELECT_FACT
        ))?;
        let mut rows = stmt.query([subject_id.to_string()])?;
        let mut facts = Vec::new();
        while let Some(row) = rows.next()? {
            facts.push(row_to_fact(row)?);
        }
        Ok(facts)
    }

    /// Full history for (subject, predicate), superseded rows included
    pub fn history(&self, subject_id: Uuid, predicate: &str) -> anyhow::Result<Vec<Fact>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE subject_id = ?1 AND predicate = ?2 ORDER BY valid_from ASC",
            SELECT_FACT
        ))?;
        let mut rows = stmt.query(params![subject_id.to_string(), predicate])?;
        let mut facts = Vec::new();
        while let Some(row) = rows.next()? {
            facts.push(row_to_fact(row)?);
        }
        Ok(facts)
    }

    /// Currently-valid facts of one type across all subjects
    pub fn active_by_type(&self, fact_type: &str, limit: usize) -> anyhow::Result<Vec<Fact>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE fact_type = ?1 AND valid_to IS NULL ORDER BY strength DESC LIMIT ?2",
            SELECT_FACT
        ))?;
        let mut rows = stmt.query(params![fact_type, limit as i64])?;
        let mut facts = Vec::new();
        while let Some(row) = rows.next()? {
            facts.push(row_to_fact(row)?);
        }
        Ok(facts)
    }

    /// Move facts from `old` to `new` (entity merge). Duplicate active
    /// facts created by the move are closed in favor of the newest.
    pub fn reassign_subject(&self, old: Uuid, new: Uuid) -> anyhow::Result<usize> {
        let conn = self.get_conn()?;
        let moved = conn.execute(
            "UPDATE facts SET subject_id = ?2 WHERE subject_id = ?1",
            params![old.to_string(), new.to_string()],
        )?;
        conn.execute(
            "UPDATE facts SET object_id = ?2 WHERE object_id = ?1",
            params![old.to_string(), new.to_string()],
        )?;

        // Close older duplicates among now-colliding active facts. SQLite's
        // bare-column-with-MAX idiom picks the id of the newest row per group.
        let now = format_ts(&Utc::now());
        conn.execute(
            "UPDATE facts SET valid_to = ?2
             WHERE subject_id = ?1 AND valid_to IS NULL AND id NOT IN (
                 SELECT id FROM (
                     SELECT id, MAX(valid_from) AS newest
                     FROM facts
                     WHERE subject_id = ?1 AND valid_to IS NULL
                     GROUP BY predicate, normalized_object
                 )
             )",
            params![new.to_string(), now],
        )?;
        Ok(moved)
    }

    pub fn count(&self) -> anyhow::Result<i64> {
        let conn = self.get_conn()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM facts", [], |row| row.get(0))?)
    }
}

const SELECT_FACT: &str =
    "SELECT id, subject_id, predicate, object_text, normalized_object, object_id,
            fact_type, confidence, strength, source_event_ids, valid_from, valid_to
     FROM facts";

fn row_to_fact(row: &Row) -> anyhow::Result<Fact> {
    let id_str: String = row.get(0)?;
    let subject_str: String = row.get(1)?;
    let object_id_str: Option<String> = row.get(5)?;
    let events_json: String = row.get(9)?;
    let valid_from_str: Option<String> = row.get(10)?;
    let valid_to_str: Option<String> = row.get(11)?;

    Ok(Fact {
        id: parse_uuid(&id_str)?,
        subject_id: parse_uuid(&subject_str)?,
        predicate: row.get(2)?,
        object_text: row.get(3)?,
        normalized_object: row.get(4)?,
        object_id: object_id_str.as_deref().map(parse_uuid).transpose()?,
        fact_type: row.get(6)?,
        confidence: row.get(7)?,
        strength: row.get(8)?,
        source_event_ids: decode_json(&events_json)?,
        valid_from: valid_from_str.as_deref().map(parse_ts).transpose()?,
        valid_to: valid_to_str.as_deref().map(parse_ts).transpose()?,
    })
}
