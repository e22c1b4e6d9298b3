//! Append-only event log, the source of truth for extraction
//!
//! Rows are immutable once written: only extraction status, relevance and
//! access bookkeeping are updated in place. Retried deliveries of the same
//! logical event are collapsed through a content-hash unique index.

use crate::graph_db::schema::*;
use crate::graph_db::{format_ts, parse_ts};
use chrono::Utc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Row};
use std::sync::Arc;
use tracing::debug;

pub struct EventLog {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl EventLog {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get()
            .map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    /// Append an event, returning its id. Re-delivery of the same logical
    /// event (identical channel, session, direction, kind, text and
    /// timestamp) returns the existing row id instead of inserting twice.
    pub fn append(&self, event: &NewEvent) -> anyhow::Result<i64> {
        let conn = self.get_conn()?;
        let timestamp = event.timestamp.unwrap_or_else(Utc::now);
        let content_hash = Self::content_hash(event, &timestamp);
        let now = format_ts(&Utc::now());

        let inserted = conn.execute(
            "INSERT OR IGNORE INTO events
             (timestamp, channel, direction, kind, text, session_key,
              parent_event_id, extraction_status, relevance_score, last_accessed, content_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', 0.5, ?8, ?9)",
            params![
                format_ts(&timestamp),
                &event.channel,
                event.direction.as_str(),
                &event.kind,
                &event.text,
                &event.session_key,
                event.parent_event_id,
                &now,
                &content_hash,
            ],
        )?;

        if inserted > 0 {
            let id = conn.last_insert_rowid();
            debug!("Appended event {} on channel {}", id, event.channel);
            return Ok(id);
        }

        // Duplicate delivery: hand back the existing row
        let id: i64 = conn.query_row(
            "SELECT id FROM events WHERE content_hash = ?1",
            [&content_hash],
            |row| row.get(0),
        )?;
        debug!("Duplicate event delivery collapsed into {}", id);
        Ok(id)
    }

    fn content_hash(event: &NewEvent, timestamp: &chrono::DateTime<Utc>) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(event.channel.as_bytes());
        hasher.update(event.session_key.as_bytes());
        hasher.update(event.direction.as_str().as_bytes());
        hasher.update(event.kind.as_bytes());
        hasher.update(event.text.as_bytes());
        hasher.update(format_ts(timestamp).as_bytes());
        hasher.finalize().to_string()
    }

    /// Oldest-first events still awaiting extraction
    pub fn get_pending(&self, limit: usize) -> anyhow::Result<Vec<Event>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, channel, direction, kind, text, embedding, session_key,
                    parent_event_id, extraction_status, relevance_score, last_accessed
             FROM events WHERE extraction_status = 'pending'
             ORDER BY id ASC LIMIT ?1",
        )?;

        let mut rows = stmt.query([limit as i64])?;
        let mut events = Vec::new();
        while let Some(row) = rows.next()? {
            events.push(row_to_event(row)?);
        }
        Ok(events)
    }

    pub fn mark_extracted(&self, id: i64, status: ExtractionStatus) -> anyhow::Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE events SET extraction_status = ?2 WHERE id = ?1",
            params![id, status.as_str()],
        )?;
        Ok(())
    }

    pub fn get(&self, id: i64) -> anyhow::Result<Option<Event>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, channel, direction, kind, text, embedding, session_key,
                    parent_event_id, extraction_status, relevance_score, last_accessed
             FROM events WHERE id = ?1",
        )?;
        let mut rows = stmt.query([id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(row_to_event(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn get_many(&self, ids: &[i64]) -> anyhow::Result<Vec<Event>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.get_conn()?;
        let placeholders = vec!["?"; ids.len()].join(",");
        let query = format!(
            "SELECT id, timestamp, channel, direction, kind, text, embedding, session_key,
                    parent_event_id, extraction_status, relevance_score, last_accessed
             FROM events WHERE id IN ({}) ORDER BY id ASC",
            placeholders
        );
        let mut stmt = conn.prepare(&query)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(ids))?;
        let mut events = Vec::new();
        while let Some(row) = rows.next()? {
            events.push(row_to_event(row)?);
        }
        Ok(events)
    }

    /// Most recent events, optionally restricted to one channel
    pub fn recent(&self, channel: Option<&str>, limit: usize) -> anyhow::Result<Vec<Event>> {
        let conn = self.get_conn()?;
        let mut events = Vec::new();

        if let Some(channel) = channel {
            let mut stmt = conn.prepare(
                "SELECT id, timestamp, channel, direction, kind, text, embedding, session_key,
                        parent_event_id, extraction_status, relevance_score, last_accessed
                 FROM events WHERE channel = ?1 ORDER BY id DESC LIMIT ?2",
            )?;
            let mut rows = stmt.query(params![channel, limit as i64])?;
            while let Some(row) = rows.next()? {
                events.push(row_to_event(row)?);
            }
        } else {
            let mut stmt = conn.prepare(
                "SELECT id, timestamp, channel, direction, kind, text, embedding, session_key,
                        parent_event_id, extraction_status, relevance_score, last_accessed
                 FROM events ORDER BY id DESC LIMIT ?1",
            )?;
            let mut rows = stmt.query([limit as i64])?;
            while let Some(row) = rows.next()? {
                events.push(row_to_event(row)?);
            }
        }

        events.reverse();
        Ok(events)
    }

    /// Events whose text mentions a name, newest first. Used by summary
    /// leaves as their source set.
    pub fn mentioning(&self, name: &str, limit: usize) -> anyhow::Result<Vec<Event>> {
        let conn = self.get_conn()?;
        let pattern = format!("%{}%", name);
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, channel, direction, kind, text, embedding, session_key,
                    parent_event_id, extraction_status, relevance_score, last_accessed
             FROM events WHERE text LIKE ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let mut rows = stmt.query(params![pattern, limit as i64])?;
        let mut events = Vec::new();
        while let Some(row) = rows.next()? {
            events.push(row_to_event(row)?);
        }
        Ok(events)
    }

    pub fn set_embedding(&self, id: i64, embedding: &[f32]) -> anyhow::Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE events SET embedding = ?2 WHERE id = ?1",
            params![id, crate::graph_db::encode_vec(embedding)?],
        )?;
        Ok(())
    }

    /// All stored event embeddings for linear similarity scans
    pub fn all_embeddings(&self) -> anyhow::Result<Vec<(i64, Vec<f32>)>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare("SELECT id, embedding FROM events WHERE embedding IS NOT NULL")?;
        let mut rows = stmt.query([])?;
        let mut result = Vec::new();
        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            let bytes: Vec<u8> = row.get(1)?;
            result.push((id, crate::graph_db::decode_vec(&bytes)?));
        }
        Ok(result)
    }

    pub fn touch_accessed(&self, ids: &[i64]) -> anyhow::Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let conn = self.get_conn()?;
        let now = format_ts(&Utc::now());
        let placeholders = vec!["?"; ids.len()].join(",");
        let query = format!("UPDATE events SET last_accessed = ? WHERE id IN ({})", placeholders);
        let mut stmt = conn.prepare(&query)?;
        let mut all_params: Vec<&dyn rusqlite::ToSql> = vec![&now];
        for id in ids {
            all_params.push(id);
        }
        stmt.execute(rusqlite::params_from_iter(all_params))?;
        Ok(())
    }

    pub fn set_relevance(&self, id: i64, score: f32) -> anyhow::Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE events SET relevance_score = ?2 WHERE id = ?1",
            params![id, score],
        )?;
        Ok(())
    }

    /// Multiply relevance of events untouched for `idle_days` by `factor`.
    /// Decay never deletes.
    pub fn decay_relevance(&self, idle_days: i64, factor: f32) -> anyhow::Result<usize> {
        let conn = self.get_conn()?;
        let cutoff = format_ts(&(Utc::now() - chrono::Duration::days(idle_days)));
        let updated = conn.execute(
            "UPDATE events SET relevance_score = relevance_score * ?1
             WHERE last_accessed < ?2",
            params![factor, cutoff],
        )?;
        Ok(updated)
    }

    pub fn count_pending(&self) -> anyhow::Result<i64> {
        let conn = self.get_conn()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM events WHERE extraction_status = 'pending'",
            [],
            |row| row.get(0),
        )?)
    }

    pub(crate) fn apply_retention(&self, older_than_days: i64) -> anyhow::Result<usize> {
        let conn = self.get_conn()?;
        let cutoff = format_ts(&(Utc::now() - chrono::Duration::days(older_than_days)));
        let deleted = conn.execute("DELETE FROM events WHERE timestamp < ?1", [&cutoff])?;
        Ok(deleted)
    }
}

fn row_to_event(row: &Row) -> anyhow::Result<Event> {
    let direction: String = row.get(3)?;
    let status: String = row.get(9)?;
    let timestamp_str: String = row.get(1)?;
    let last_accessed_str: String = row.get(11)?;
    let embedding_bytes: Option<Vec<u8>> = row.get(6)?;
    let embedding = match embedding_bytes {
        Some(bytes) => Some(crate::graph_db::decode_vec(&bytes)?),
        None => None,
    };

    Ok(Event {
        id: row.get(0)?,
        timestamp: parse_ts(&timestamp_str)?,
        channel: row.get(2)?,
        direction: Direction::parse(&direction),
        kind: row.get(4)?,
        text: row.get(5)?,
        embedding,
        session_key: row.get(7)?,
        parent_event_id: row.get(8)?,
        extraction_status: ExtractionStatus::parse(&status),
        relevance_score: row.get(10)?,
        last_accessed: parse_ts(&last_accessed_str)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph_db::GraphDatabase;

    fn test_event(text: &str) -> NewEvent {
        NewEvent::inbound("general", "session-1", text)
    }

    // ===== Append Tests =====

    #[test]
    fn test_append_and_get() {
        let db = GraphDatabase::new_in_memory().unwrap();
        let id = db.events.append(&test_event("hello")).unwrap();

        let event = db.events.get(id).unwrap().unwrap();
        assert_eq!(event.text, "hello");
        assert_eq!(event.extraction_status, ExtractionStatus::Pending);
    }

    #[test]
    fn test_duplicate_delivery_collapses() {
        let db = GraphDatabase::new_in_memory().unwrap();
        let mut event = test_event("retried message");
        event.timestamp = Some(chrono::Utc::now());

        let first = db.events.append(&event).unwrap();
        let second = db.events.append(&event).unwrap();

        assert_eq!(first, second);
        assert_eq!(db.get_stats().unwrap().total_events, 1);
    }

    #[test]
    fn test_distinct_events_not_collapsed() {
        let db = GraphDatabase::new_in_memory().unwrap();
        let a = db.events.append(&test_event("first")).unwrap();
        let b = db.events.append(&test_event("second")).unwrap();

        assert_ne!(a, b);
    }

    // ===== Pending Queue Tests =====

    #[test]
    fn test_get_pending_oldest_first() {
        let db = GraphDatabase::new_in_memory().unwrap();
        let first = db.events.append(&test_event("one")).unwrap();
        let second = db.events.append(&test_event("two")).unwrap();

        let pending = db.events.get_pending(10).unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, first);
        assert_eq!(pending[1].id, second);
    }

    #[test]
    fn test_mark_extracted_removes_from_pending() {
        let db = GraphDatabase::new_in_memory().unwrap();
        let id = db.events.append(&test_event("done")).unwrap();

        db.events.mark_extracted(id, ExtractionStatus::Extracted).unwrap();
        assert!(db.events.get_pending(10).unwrap().is_empty());
        assert_eq!(db.events.count_pending().unwrap(), 0);
    }

    // ===== Relevance and Decay Tests =====

    #[test]
    fn test_decay_relevance_only_idle_events() {
        let db = GraphDatabase::new_in_memory().unwrap();
        let id = db.events.append(&test_event("fresh")).unwrap();

        // Nothing is older than 30 days yet
        assert_eq!(db.events.decay_relevance(30, 0.5).unwrap(), 0);
        assert_eq!(db.events.get(id).unwrap().unwrap().relevance_score, 0.5);

        // With a zero-day horizon everything decays
        let decayed = db.events.decay_relevance(0, 0.5).unwrap();
        assert_eq!(decayed, 1);
        assert!(db.events.get(id).unwrap().unwrap().relevance_score < 0.5);
    }

    // ===== Query Tests =====

    #[test]
    fn test_recent_per_channel() {
        let db = GraphDatabase::new_in_memory().unwrap();
        db.events.append(&NewEvent::inbound("alpha", "s", "a1")).unwrap();
        db.events.append(&NewEvent::inbound("beta", "s", "b1")).unwrap();
        db.events.append(&NewEvent::inbound("alpha", "s", "a2")).unwrap();

        let recent = db.events.recent(Some("alpha"), 10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].text, "a1");
        assert_eq!(recent[1].text, "a2");
    }

    #[test]
    fn test_mentioning_filters_by_text() {
        let db = GraphDatabase::new_in_memory().unwrap();
        db.events.append(&test_event("Acme shipped a release")).unwrap();
        db.events.append(&test_event("unrelated chatter")).unwrap();

        let hits = db.events.mentioning("Acme", 10).unwrap();
        assert_eq!(hits.len(), 1);
    }
}
