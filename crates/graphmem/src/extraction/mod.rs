//! Rule-based mention extraction and the background extraction job
//!
//! Extraction is the HIGH-priority background task: it drains pending
//! events, resolves mentions through the graph, records relations and
//! preference facts, and bumps summary staleness for everything touched.

use crate::config::Config;
use crate::embedding::EmbeddingProvider;
use crate::error::{EngineError, EngineResult};
use crate::graph::KnowledgeGraph;
use crate::graph_db::schema::*;
use crate::resolver::{BatchContext, Mention};
use crate::utils::TextUtils;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

lazy_static! {
    static ref RELATION_PATTERNS: Vec<(Regex, &'static str, &'static str)> = vec![
        (
            Regex::new(r"(?P<s>[A-Z][\w'.-]*(?:\s+[A-Z][\w'.-]*)*)\s+works?\s+(?:at|for)\s+(?P<o>[A-Z][\w'.-]*(?:\s+[A-Z][\w'.-]*)*)").unwrap(),
            "works at",
            "professional",
        ),
        (
            Regex::new(r"(?P<s>[A-Z][\w'.-]*(?:\s+[A-Z][\w'.-]*)*)\s+lives?\s+in\s+(?P<o>[A-Z][\w'.-]*(?:\s+[A-Z][\w'.-]*)*)").unwrap(),
            "lives in",
            "personal",
        ),
        (
            Regex::new(r"(?P<s>[A-Z][\w'.-]*(?:\s+[A-Z][\w'.-]*)*)\s+(?:visited|moved\s+to)\s+(?P<o>[A-Z][\w'.-]*(?:\s+[A-Z][\w'.-]*)*)").unwrap(),
            "visited",
            "spatial",
        ),
    ];
    static ref PREFERENCE_PATTERN: Regex =
        Regex::new(r"(?i)\bI\s+(?:really\s+|absolutely\s+)?(?P<verb>like|love|prefer|enjoy|hate|dislike)\s+(?P<obj>[\w][\w '-]{0,48}?)(?:\s+(?:in|at|on|with|because|since|when|during|for|over)\b|[.,!?;:]|$)").unwrap();
    static ref FAVORITE_PATTERN: Regex =
        Regex::new(r"(?i)\bmy\s+favorite\s+(?P<cat>[a-z][a-z ]{1,28}?)\s+is\s+(?P<obj>[\w][\w '-]{0,48}?)(?:\s+(?:because|since|when|though)\b|[.,!?;:]|$)").unwrap();
    static ref TOPIC_PATTERN: Regex =
        Regex::new(r"(?i)\b(?:about|regarding|discussing)\s+(?P<topic>[\w][\w '-]{2,40})").unwrap();
}

const ORG_SUFFIXES: &[&str] = &[
    "corp", "corporation", "inc", "incorporated", "llc", "ltd", "company", "co",
    "labs", "systems", "technologies", "industries", "group", "foundation",
];

const PERSON_TITLES: &[&str] = &["mr", "mrs", "ms", "dr", "prof", "professor"];

const LOCATION_PREPOSITIONS: &[&str] = &["in", "at", "near", "from", "to"];

/// Words that look capitalized only because they start a sentence, plus
/// pronouns, which are never mentions
const SENTENCE_NOISE: &[&str] = &[
    "the", "this", "that", "these", "those", "what", "how", "why", "when",
    "where", "who", "which", "yes", "no", "ok", "okay", "hello", "hi",
    "thanks", "please", "today", "tomorrow", "yesterday", "i", "he", "she",
    "it", "we", "they", "you", "my", "his", "her", "its", "our", "their",
];

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedMention {
    pub text: String,
    pub entity_type: EntityType,
}

#[derive(Debug, Clone)]
pub struct ExtractedRelation {
    pub source_text: String,
    pub target_text: String,
    pub label: String,
    pub relation_type: String,
}

#[derive(Debug, Clone)]
pub struct ExtractedPreference {
    pub predicate: String,
    pub object: String,
}

/// Heuristic mention extractor: capitalized runs with light type inference.
/// Deliberately rule-based so extraction stays deterministic and offline;
/// pronouns are never mentions.
#[derive(Default)]
pub struct MentionExtractor;

impl MentionExtractor {
    pub fn extract(&self, text: &str) -> Vec<ExtractedMention> {
        let tokens: Vec<&str> = text.split_whitespace().collect();
        let mut mentions: Vec<ExtractedMention> = Vec::new();
        let mut index = 0;

        while index < tokens.len() {
            let word = clean_token(tokens[index]);
            if !is_name_token(&word) {
                index += 1;
                continue;
            }

            // Grow a run of capitalized tokens, allowing short connectors
            let start = index;
            let mut run = vec![word];
            let mut end = index + 1;
            while end < tokens.len() {
                let next = clean_token(tokens[end]);
                if is_name_token(&next) {
                    run.push(next);
                    end += 1;
                } else if matches!(next.to_lowercase().as_str(), "of" | "and" | "&")
                    && end + 1 < tokens.len()
                    && is_name_token(&clean_token(tokens[end + 1]))
                {
                    run.push(next);
                    end += 1;
                } else {
                    break;
                }
            }

            // Drop lone sentence-initial noise words
            if run.len() == 1 && SENTENCE_NOISE.contains(&run[0].to_lowercase().as_str()) {
                index = end;
                continue;
            }

            let surface = run.join(" ");
            let preceding = if start > 0 {
                clean_token(tokens[start - 1]).to_lowercase()
            } else {
                String::new()
            };
            let following = if end < tokens.len() {
                clean_token(tokens[end]).to_lowercase()
            } else {
                String::new()
            };
            let entity_type = infer_type(&run, &preceding, &following);

            let mention = ExtractedMention { text: surface, entity_type };
            if !mentions.contains(&mention) {
                mentions.push(mention);
            }
            index = end;
        }

        mentions
    }

    pub fn extract_relations(&self, text: &str) -> Vec<ExtractedRelation> {
        let mut relations = Vec::new();
        for (pattern, label, relation_type) in RELATION_PATTERNS.iter() {
            for captures in pattern.captures_iter(text) {
                let source = captures.name("s").map(|m| m.as_str().trim());
                let target = captures.name("o").map(|m| m.as_str().trim());
                if let (Some(source), Some(target)) = (source, target) {
                    relations.push(ExtractedRelation {
                        source_text: source.to_string(),
                        target_text: target.to_string(),
                        label: label.to_string(),
                        relation_type: relation_type.to_string(),
                    });
                }
            }
        }
        relations
    }

    pub fn extract_preferences(&self, text: &str) -> Vec<ExtractedPreference> {
        let mut preferences = Vec::new();

        for captures in PREFERENCE_PATTERN.captures_iter(text) {
            let verb = captures["verb"].to_lowercase();
            let predicate = match verb.as_str() {
                "hate" | "dislike" => "dislikes",
                _ => "likes",
            };
            preferences.push(ExtractedPreference {
                predicate: predicate.to_string(),
                object: trim_object(&captures["obj"]),
            });
        }

        for captures in FAVORITE_PATTERN.captures_iter(text) {
            let category = captures["cat"].trim().replace(' ', "_");
            preferences.push(ExtractedPreference {
                predicate: format!("favorite_{}", category),
                object: trim_object(&captures["obj"]),
            });
        }

        preferences
    }

    pub fn extract_topics(&self, text: &str) -> Vec<String> {
        let mut topics = Vec::new();
        for captures in TOPIC_PATTERN.captures_iter(text) {
            let topic = TextUtils::normalize_name(captures["topic"].trim());
            let significant: Vec<&str> = topic
                .split(' ')
                .filter(|word| TextUtils::is_significant_word(word, 3))
                .take(3)
                .collect();
            if !significant.is_empty() {
                topics.push(significant.join(" "));
            }
        }
        topics.sort();
        topics.dedup();
        topics.truncate(3);
        topics
    }
}

fn clean_token(token: &str) -> String {
    token
        .trim_matches(|c: char| !c.is_alphanumeric() && c != '\'')
        .to_string()
}

fn is_name_token(word: &str) -> bool {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) if first.is_uppercase() => word.len() > 1 || word == "I",
        _ => false,
    }
}

fn infer_type(run: &[String], preceding: &str, following: &str) -> EntityType {
    let last = run.last().map(|w| w.to_lowercase()).unwrap_or_default();
    if ORG_SUFFIXES.contains(&last.trim_end_matches('.')) {
        return EntityType::Organization;
    }
    if PERSON_TITLES.contains(&preceding.trim_end_matches('.')) {
        return EntityType::Person;
    }
    if LOCATION_PREPOSITIONS.contains(&preceding) && run.len() <= 3 {
        return EntityType::Location;
    }
    if matches!(following, "said" | "says" | "met" | "told" | "asked" | "thinks") {
        return EntityType::Person;
    }
    if run.len() == 2 {
        // Two capitalized tokens with no other signal: usually a full name
        return EntityType::Person;
    }
    EntityType::Concept
}

fn trim_object(raw: &str) -> String {
    let cut = raw
        .find(|c: char| matches!(c, '.' | ',' | '!' | '?' | ';'))
        .unwrap_or(raw.len());
    raw[..cut]
        .trim()
        .trim_end_matches("and")
        .trim()
        .to_string()
}

/// Canonical name of the conversation owner, the subject of preference
/// facts.
pub const SELF_ENTITY_NAME: &str = "User";

#[derive(Debug, Default, Clone)]
pub struct ExtractionReport {
    pub events_processed: usize,
    pub events_skipped: usize,
    pub events_failed: usize,
    pub mentions_resolved: usize,
    pub new_entities: usize,
    pub edges_upserted: usize,
    pub facts_upserted: usize,
    pub merges_promoted: usize,
}

/// Drains pending events into the graph. One job instance runs at a time
/// (the scheduler serializes HIGH tasks), so graph mutations within a batch
/// never race.
pub struct ExtractionJob {
    graph: Arc<KnowledgeGraph>,
    embedder: Arc<dyn EmbeddingProvider>,
    config: Arc<Config>,
    extractor: MentionExtractor,
}

impl ExtractionJob {
    pub fn new(
        graph: Arc<KnowledgeGraph>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            graph,
            embedder,
            config,
            extractor: MentionExtractor,
        }
    }

    pub async fn run(&self, limit: usize) -> EngineResult<ExtractionReport> {
        let limit = if limit == 0 { self.config.extraction_batch_size } else { limit };
        let db = self.graph.database();
        let events = db
            .events
            .get_pending(limit)
            .map_err(EngineError::storage)?;
        if events.is_empty() {
            return Ok(ExtractionReport::default());
        }
        debug!("Extraction batch: {} pending events", events.len());

        let mut report = ExtractionReport::default();
        let mut batches: HashMap<String, BatchContext> = HashMap::new();

        for event in events {
            let batch = batches
                .entry(event.session_key.clone())
                .or_insert_with(|| self.graph.begin_batch(&event.session_key));

            match self.process_event(&event, batch, &mut report).await {
                Ok(had_mentions) => {
                    let status = if had_mentions {
                        ExtractionStatus::Extracted
                    } else {
                        report.events_skipped += 1;
                        ExtractionStatus::Skipped
                    };
                    db.events
                        .mark_extracted(event.id, status)
                        .map_err(EngineError::storage)?;
                    report.events_processed += 1;
                }
                Err(EngineError::ResolutionFailed(reason)) => {
                    // Leave the event pending; the next cycle retries it
                    warn!("Resolution failed for event {}: {}", event.id, reason);
                    report.events_failed += 1;
                }
                Err(e @ EngineError::StorageUnavailable(_)) => return Err(e),
                Err(e) => {
                    warn!("Extraction failed for event {}: {}", event.id, e);
                    db.events
                        .mark_extracted(event.id, ExtractionStatus::Failed)
                        .map_err(EngineError::storage)?;
                    report.events_failed += 1;
                }
            }
        }

        report.merges_promoted = self.graph.promote_ready_tentative()?;
        info!(
            "Extraction done: {} processed, {} skipped, {} failed, {} new entities",
            report.events_processed, report.events_skipped, report.events_failed, report.new_entities
        );
        Ok(report)
    }

    async fn process_event(
        &self,
        event: &Event,
        batch: &mut BatchContext,
        report: &mut ExtractionReport,
    ) -> EngineResult<bool> {
        let db = self.graph.database();

        // Event embedding feeds semantic search; unavailable is non-fatal
        match self.embedder.embed(&event.text).await {
            Ok(vector) => {
                db.events
                    .set_embedding(event.id, &vector)
                    .map_err(EngineError::storage)?;
            }
            Err(EngineError::EmbeddingUnavailable(_)) => {}
            Err(e) => return Err(e),
        }

        let mentions = self.extractor.extract(&event.text);
        if mentions.is_empty() {
            return Ok(false);
        }

        let mut resolved: Vec<(String, Uuid)> = Vec::new();
        for extracted in &mentions {
            let embedding = match self.embedder.embed(&extracted.text).await {
                Ok(vector) => Some(vector),
                Err(EngineError::EmbeddingUnavailable(_)) => None,
                Err(e) => return Err(e),
            };
            let mention = Mention {
                text: extracted.text.clone(),
                entity_type: extracted.entity_type,
                embedding,
                event_id: Some(event.id),
            };
            let (entity, resolution) = self.graph.upsert_entity(&mention, batch).await?;
            report.mentions_resolved += 1;
            if resolution.method == ResolutionMethod::New {
                report.new_entities += 1;
            }
            resolved.push((TextUtils::normalize_name(&extracted.text), entity.id));
        }

        // Pattern relations, matched back to resolved entities by name
        for relation in self.extractor.extract_relations(&event.text) {
            let source = lookup(&resolved, &relation.source_text);
            let target = lookup(&resolved, &relation.target_text);
            if let (Some(source), Some(target)) = (source, target) {
                if source != target {
                    self.graph.upsert_edge(
                        source,
                        target,
                        &relation.label,
                        &relation.relation_type,
                        Some(event.id),
                    )?;
                    report.edges_upserted += 1;
                }
            }
        }

        // Co-mention association for entities sharing this event
        let distinct: Vec<Uuid> = {
            let mut seen = Vec::new();
            for (_, id) in &resolved {
                if !seen.contains(id) {
                    seen.push(*id);
                }
            }
            seen
        };
        for pair in distinct.windows(2) {
            self.graph
                .upsert_edge(pair[0], pair[1], "mentioned with", "association", Some(event.id))?;
            report.edges_upserted += 1;
        }

        // Preference facts attach to the conversation owner
        let preferences = self.extractor.extract_preferences(&event.text);
        let has_preferences = !preferences.is_empty();
        if has_preferences {
            let owner = self.ensure_self_entity().await?;
            for preference in preferences {
                let object_id = lookup(&resolved, &preference.object);
                self.graph.upsert_fact(
                    owner,
                    &preference.predicate,
                    &preference.object,
                    object_id,
                    "preference",
                    0.8,
                    Some(event.id),
                )?;
                report.facts_upserted += 1;
            }
        }

        self.bump_staleness(event, &distinct, has_preferences)?;
        Ok(true)
    }

    async fn ensure_self_entity(&self) -> EngineResult<Uuid> {
        if let Some(existing) = self.graph.find_entity(SELF_ENTITY_NAME)? {
            return Ok(existing.id);
        }
        let mut batch = self.graph.begin_batch("self");
        let mention = Mention {
            text: SELF_ENTITY_NAME.to_string(),
            entity_type: EntityType::Person,
            embedding: None,
            event_id: None,
        };
        let (entity, _) = self.graph.upsert_entity(&mention, &mut batch).await?;
        Ok(entity.id)
    }

    /// Staleness propagation: every summary node whose scope gained events
    /// moves further from fresh. Resets happen only in the refresh path.
    fn bump_staleness(
        &self,
        event: &Event,
        entities: &[Uuid],
        preference_touched: bool,
    ) -> EngineResult<()> {
        let db = self.graph.database();
        let summaries = &db.summaries;

        let root = summaries
            .get_or_create(SummaryNodeType::Root, "root", None)
            .map_err(EngineError::storage)?;
        summaries.bump_staleness(root.id).map_err(EngineError::storage)?;

        let channel = summaries
            .get_or_create(SummaryNodeType::Channel, &event.channel, Some(root.id))
            .map_err(EngineError::storage)?;
        summaries.bump_staleness(channel.id).map_err(EngineError::storage)?;

        for entity_id in entities {
            let node = summaries
                .get_or_create(SummaryNodeType::Entity, &entity_id.to_string(), Some(channel.id))
                .map_err(EngineError::storage)?;
            summaries.bump_staleness(node.id).map_err(EngineError::storage)?;
        }

        for topic in self.extractor.extract_topics(&event.text) {
            let node = summaries
                .get_or_create(SummaryNodeType::Topic, &topic, Some(channel.id))
                .map_err(EngineError::storage)?;
            summaries.bump_staleness(node.id).map_err(EngineError::storage)?;
        }

        if preference_touched {
            let node = summaries
                .get_or_create(SummaryNodeType::Preferences, "preferences", Some(root.id))
                .map_err(EngineError::storage)?;
            summaries.bump_staleness(node.id).map_err(EngineError::storage)?;
        }

        Ok(())
    }
}

fn lookup(resolved: &[(String, Uuid)], surface: &str) -> Option<Uuid> {
    let normalized = TextUtils::normalize_name(surface);
    resolved
        .iter()
        .find(|(name, _)| *name == normalized || name.contains(&normalized) || normalized.contains(name))
        .map(|(_, id)| *id)
}
