//! Entity storage and candidate retrieval

use crate::graph_db::schema::*;
use crate::graph_db::{decode_json, encode_json, format_ts, parse_ts, parse_uuid};
use crate::utils::TextUtils;
use chrono::Utc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Row};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

pub struct EntityStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl EntityStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get()
            .map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    pub fn insert(
        &self,
        canonical_name: &str,
        entity_type: EntityType,
        description: &str,
        name_embedding: Option<&[f32]>,
    ) -> anyhow::Result<Entity> {
        let conn = self.get_conn()?;
        let now = Utc::now();
        let entity = Entity {
            id: Uuid::new_v4(),
            canonical_name: canonical_name.to_string(),
            normalized_name: TextUtils::normalize_name(canonical_name),
            entity_type,
            aliases: Vec::new(),
            description: description.to_string(),
            name_embedding: name_embedding.map(|v| v.to_vec()),
            mention_count: 1,
            first_seen: now,
            last_seen: now,
        };

        let embedding_blob = match name_embedding {
            Some(v) => Some(crate::graph_db::encode_vec(v)?),
            None => None,
        };

        conn.execute(
            "INSERT INTO entities
             (id, canonical_name, normalized_name, entity_type, aliases, description,
              name_embedding, mention_count, first_seen, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, ?8)",
            params![
                entity.id.to_string(),
                &entity.canonical_name,
                &entity.normalized_name,
                entity.entity_type.as_str(),
                encode_json(&entity.aliases)?,
                &entity.description,
                embedding_blob,
                format_ts(&now),
            ],
        )?;

        debug!("Created entity '{}' ({})", entity.canonical_name, entity.id);
        Ok(entity)
    }

    pub fn get(&self, id: Uuid) -> anyhow::Result<Option<Entity>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!("{} WHERE id = ?1", SELECT_ENTITY))?;
        let mut rows = stmt.query([id.to_string()])?;
        if let Some(row) = rows.next()? {
            Ok(Some(row_to_entity(row)?))
        } else {
            Ok(None)
        }
    }

    /// Exact lookup against the canonical name, falling back to a scan of
    /// alias lists. Name is normalized before comparison.
    pub fn find_by_name(&self, name: &str) -> anyhow::Result<Option<Entity>> {
        let normalized = TextUtils::normalize_name(name);
        let conn = self.get_conn()?;

        let mut stmt = conn.prepare(&format!("{} WHERE normalized_name = ?1 ORDER BY mention_count DESC", SELECT_ENTITY))?;
        let mut rows = stmt.query([&normalized])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(row_to_entity(row)?));
        }
        drop(rows);
        drop(stmt);

        // Alias lists are small JSON arrays; narrow with LIKE, then verify
        // the normalized form in Rust.
        let pattern = format!("%{}%", normalized.replace('%', ""));
        let mut stmt = conn.prepare(&format!("{} WHERE aliases LIKE ?1", SELECT_ENTITY))?;
        let mut rows = stmt.query([&pattern])?;
        while let Some(row) = rows.next()? {
            let entity = row_to_entity(row)?;
            if entity.aliases.iter().any(|a| TextUtils::normalize_name(a) == normalized) {
                return Ok(Some(entity));
            }
        }
        Ok(None)
    }

    /// Candidate filter for resolution: same type, recently seen, above the
    /// mention floor. Bounds matching cost for large graphs.
    pub fn candidates(
        &self,
        entity_type: EntityType,
        recency_window_days: i64,
        mention_count_floor: i64,
    ) -> anyhow::Result<Vec<Entity>> {
        let conn = self.get_conn()?;
        let cutoff = format_ts(&(Utc::now() - chrono::Duration::days(recency_window_days)));

        let mut stmt = conn.prepare(&format!(
            "{} WHERE entity_type = ?1 AND last_seen >= ?2 AND mention_count >= ?3
             ORDER BY mention_count DESC",
            SELECT_ENTITY
        ))?;
        let mut rows = stmt.query(params![entity_type.as_str(), cutoff, mention_count_floor])?;
        let mut entities = Vec::new();
        while let Some(row) = rows.next()? {
            entities.push(row_to_entity(row)?);
        }
        Ok(entities)
    }

    /// Register a re-mention: bump the count, extend `last_seen`, and record
    /// a novel surface form as an alias. Tentative resolutions pass
    /// `commit_alias = false` so the surface form waits for promotion.
    pub fn record_mention(&self, id: Uuid, surface_form: &str, commit_alias: bool) -> anyhow::Result<Entity> {
        let mut entity = self
            .get(id)?
            .ok_or_else(|| anyhow::anyhow!("Entity not found: {}", id))?;

        let normalized = TextUtils::normalize_name(surface_form);
        let known = entity.normalized_name == normalized
            || entity.aliases.iter().any(|a| TextUtils::normalize_name(a) == normalized);
        if commit_alias && !known && !normalized.is_empty() {
            entity.aliases.push(surface_form.to_string());
        }

        entity.mention_count += 1;
        entity.last_seen = Utc::now();

        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE entities SET mention_count = ?2, last_seen = ?3, aliases = ?4 WHERE id = ?1",
            params![
                id.to_string(),
                entity.mention_count,
                format_ts(&entity.last_seen),
                encode_json(&entity.aliases)?,
            ],
        )?;
        Ok(entity)
    }

    pub fn add_alias(&self, id: Uuid, alias: &str) -> anyhow::Result<()> {
        let mut entity = self
            .get(id)?
            .ok_or_else(|| anyhow::anyhow!("Entity not found: {}", id))?;

        let normalized = TextUtils::normalize_name(alias);
        let known = entity.normalized_name == normalized
            || entity.aliases.iter().any(|a| TextUtils::normalize_name(a) == normalized);
        if known {
            return Ok(());
        }
        entity.aliases.push(alias.to_string());

        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE entities SET aliases = ?2 WHERE id = ?1",
            params![id.to_string(), encode_json(&entity.aliases)?],
        )?;
        info!("Promoted alias '{}' for entity {}", alias, id);
        Ok(())
    }

    pub fn set_description(&self, id: Uuid, description: &str) -> anyhow::Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE entities SET description = ?2 WHERE id = ?1",
            params![id.to_string(), description],
        )?;
        Ok(())
    }

    pub fn set_embedding(&self, id: Uuid, embedding: &[f32]) -> anyhow::Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE entities SET name_embedding = ?2 WHERE id = ?1",
            params![id.to_string(), crate::graph_db::encode_vec(embedding)?],
        )?;
        Ok(())
    }

    pub fn all(&self) -> anyhow::Result<Vec<Entity>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!("{} ORDER BY mention_count DESC", SELECT_ENTITY))?;
        let mut rows = stmt.query([])?;
        let mut entities = Vec::new();
        while let Some(row) = rows.next()? {
            entities.push(row_to_entity(row)?);
        }
        Ok(entities)
    }

    pub fn count(&self) -> anyhow::Result<i64> {
        let conn = self.get_conn()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM entities", [], |row| row.get(0))?)
    }

    /// Fold the counters and surface forms of `removed` into `kept`; the
    /// caller is responsible for reassigning edges and facts first.
    pub fn absorb(&self, kept: Uuid, removed: &Entity) -> anyhow::Result<()> {
        let mut target = self
            .get(kept)?
            .ok_or_else(|| anyhow::anyhow!("Entity not found: {}", kept))?;

        let mut known: Vec<String> = target
            .aliases
            .iter()
            .map(|a| TextUtils::normalize_name(a))
            .collect();
        known.push(target.normalized_name.clone());

        for surface in std::iter::once(&removed.canonical_name).chain(removed.aliases.iter()) {
            let normalized = TextUtils::normalize_name(surface);
            if !known.contains(&normalized) {
                target.aliases.push(surface.clone());
                known.push(normalized);
            }
        }

        target.mention_count += removed.mention_count;
        target.last_seen = target.last_seen.max(removed.last_seen);
        target.first_seen = target.first_seen.min(removed.first_seen);

        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE entities SET aliases = ?2, mention_count = ?3, first_seen = ?4, last_seen = ?5
             WHERE id = ?1",
            params![
                kept.to_string(),
                encode_json(&target.aliases)?,
                target.mention_count,
                format_ts(&target.first_seen),
                format_ts(&target.last_seen),
            ],
        )?;
        Ok(())
    }

    pub fn delete(&self, id: Uuid) -> anyhow::Result<bool> {
        let conn = self.get_conn()?;
        let deleted = conn.execute("DELETE FROM entities WHERE id = ?1", [id.to_string()])?;
        Ok(deleted > 0)
    }

    pub fn record_merge_audit(&self, kept: Uuid, removed: Uuid, reason: &str) -> anyhow::Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO merge_audit (kept_id, removed_id, reason, merged_at) VALUES (?1, ?2, ?3, ?4)",
            params![kept.to_string(), removed.to_string(), reason, format_ts(&Utc::now())],
        )?;
        info!("Merged entity {} into {} ({})", removed, kept, reason);
        Ok(())
    }

    /// Entities missing a name embedding, for backfill after the embedder
    /// becomes available.
    pub fn missing_embeddings(&self, limit: usize) -> anyhow::Result<Vec<Entity>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE name_embedding IS NULL LIMIT ?1",
            SELECT_ENTITY
        ))?;
        let mut rows = stmt.query([limit as i64])?;
        let mut entities = Vec::new();
        while let Some(row) = rows.next()? {
            entities.push(row_to_entity(row)?);
        }
        Ok(entities)
    }
}

const SELECT_ENTITY: &str =
    "SELECT id, canonical_name, normalized_name, entity_type, aliases, description,
            name_embedding, mention_count, first_seen, last_seen
     FROM entities";

fn row_to_entity(row: &Row) -> anyhow::Result<Entity> {
    let id_str: String = row.get(0)?;
    let type_str: String = row.get(3)?;
    let aliases_json: String = row.get(4)?;
    let embedding_bytes: Option<Vec<u8>> = row.get(6)?;
    let first_seen_str: String = row.get(8)?;
    let last_seen_str: String = row.get(9)?;

    let name_embedding = match embedding_bytes {
        Some(bytes) => Some(crate::graph_db::decode_vec(&bytes)?),
        None => None,
    };

    Ok(Entity {
        id: parse_uuid(&id_str)?,
        canonical_name: row.get(1)?,
        normalized_name: row.get(2)?,
        entity_type: EntityType::parse(&type_str),
        aliases: decode_json(&aliases_json)?,
        description: row.get(5)?,
        name_embedding,
        mention_count: row.get(7)?,
        first_seen: parse_ts(&first_seen_str)?,
        last_seen: parse_ts(&last_seen_str)?,
    })
}
