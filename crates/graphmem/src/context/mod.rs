//! Read-only, token-budgeted context assembly
//!
//! Each section gets a fixed share of the budget and is truncated
//! independently, so one oversized section can never starve the others or
//! push the total past the budget. The preferences summary rides along
//! whenever at least one token remains for it.

use crate::error::{EngineError, EngineResult};
use crate::graph_db::schema::*;
use crate::graph_db::GraphDatabase;
use crate::utils::TextUtils;
use std::sync::Arc;
use tracing::debug;

const IDENTITY_RATIO: f32 = 0.15;
const PREFERENCES_RATIO: f32 = 0.15;
const RECENT_RATIO: f32 = 0.30;
const ENTITY_RATIO: f32 = 0.25;
const TOPICS_RATIO: f32 = 0.15;

const RECENT_EVENT_LIMIT: usize = 10;
const TOPIC_NODE_LIMIT: usize = 5;
const ENTITY_FACT_LIMIT: usize = 8;
const ENTITY_EDGE_LIMIT: usize = 6;

#[derive(Debug, Clone)]
pub struct ContextSection {
    pub name: &'static str,
    pub text: String,
    pub tokens: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Context {
    pub sections: Vec<ContextSection>,
    pub total_tokens: usize,
}

impl Context {
    pub fn render(&self) -> String {
        self.sections
            .iter()
            .map(|section| format!("[{}]\n{}", section.name, section.text))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

pub struct ContextAssembler {
    db: Arc<GraphDatabase>,
}

impl ContextAssembler {
    pub fn new(db: Arc<GraphDatabase>) -> Self {
        Self { db }
    }

    /// Assemble a context within `budget_tokens`. Never exceeds the budget;
    /// sections that come back empty are simply omitted.
    pub fn assemble(
        &self,
        budget_tokens: usize,
        channel: Option<&str>,
        entity_hint: Option<&str>,
    ) -> EngineResult<Context> {
        let mut context = Context::default();
        if budget_tokens == 0 {
            return Ok(context);
        }

        let share = |ratio: f32| (budget_tokens as f32 * ratio).floor() as usize;

        self.push_section(
            &mut context,
            "identity",
            share(IDENTITY_RATIO),
            self.identity_text()?,
        );

        // Preferences are always represented when any budget remains
        let preferences_budget = share(PREFERENCES_RATIO).max(1);
        self.push_section(
            &mut context,
            "preferences",
            preferences_budget,
            self.preferences_text()?,
        );

        self.push_section(
            &mut context,
            "recent_activity",
            share(RECENT_RATIO),
            self.recent_text(channel)?,
        );

        if let Some(hint) = entity_hint {
            self.push_section(
                &mut context,
                "entity_detail",
                share(ENTITY_RATIO),
                self.entity_text(hint)?,
            );
        }

        self.push_section(
            &mut context,
            "topics",
            share(TOPICS_RATIO),
            self.topics_text()?,
        );

        debug!(
            "Assembled context: {} sections, {}/{} tokens",
            context.sections.len(),
            context.total_tokens,
            budget_tokens
        );
        Ok(context)
    }

    fn push_section(&self, context: &mut Context, name: &'static str, budget: usize, text: String) {
        if budget == 0 || text.trim().is_empty() {
            return;
        }
        let truncated = TextUtils::truncate_to_tokens(&text, budget).into_owned();
        if truncated.trim().is_empty() {
            return;
        }
        let tokens = TextUtils::estimate_tokens(&truncated);
        context.total_tokens += tokens;
        context.sections.push(ContextSection {
            name,
            text: truncated,
            tokens,
        });
    }

    fn identity_text(&self) -> EngineResult<String> {
        Ok(self
            .db
            .summaries
            .get_by(SummaryNodeType::Root, "root")
            .map_err(EngineError::storage)?
            .map(|node| node.text)
            .unwrap_or_default())
    }

    /// Included regardless of staleness
    fn preferences_text(&self) -> EngineResult<String> {
        Ok(self
            .db
            .summaries
            .get_by(SummaryNodeType::Preferences, "preferences")
            .map_err(EngineError::storage)?
            .map(|node| node.text)
            .unwrap_or_default())
    }

    fn recent_text(&self, channel: Option<&str>) -> EngineResult<String> {
        let events = self
            .db
            .events
            .recent(channel, RECENT_EVENT_LIMIT)
            .map_err(EngineError::storage)?;
        Ok(events
            .iter()
            .map(|event| format!("{}: {}", event.direction.as_str(), event.text))
            .collect::<Vec<_>>()
            .join("\n"))
    }

    fn entity_text(&self, hint: &str) -> EngineResult<String> {
        let Some(entity) = self
            .db
            .entities
            .find_by_name(hint)
            .map_err(EngineError::storage)?
        else {
            return Ok(String::new());
        };

        let mut lines = vec![format!(
            "{} ({}), mentioned {} times",
            entity.canonical_name,
            entity.entity_type.as_str(),
            entity.mention_count
        )];
        if !entity.description.is_empty() {
            lines.push(entity.description.clone());
        }

        for fact in self
            .db
            .facts
            .active_for(entity.id)
            .map_err(EngineError::storage)?
            .into_iter()
            .take(ENTITY_FACT_LIMIT)
        {
            lines.push(format!("- {} {}", fact.predicate.replace('_', " "), fact.object_text));
        }

        for edge in self
            .db
            .edges
            .edges_for(entity.id)
            .map_err(EngineError::storage)?
            .into_iter()
            .take(ENTITY_EDGE_LIMIT)
        {
            let other_id = if edge.source_id == entity.id { edge.target_id } else { edge.source_id };
            if let Some(other) = self.db.entities.get(other_id).map_err(EngineError::storage)? {
                lines.push(format!("- {} {}", edge.relation_label, other.canonical_name));
            }
        }

        Ok(lines.join("\n"))
    }

    fn topics_text(&self) -> EngineResult<String> {
        let mut nodes = self
            .db
            .summaries
            .by_type(SummaryNodeType::Topic)
            .map_err(EngineError::storage)?;
        nodes.retain(|node| !node.text.trim().is_empty());
        nodes.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));
        nodes.truncate(TOPIC_NODE_LIMIT);

        Ok(nodes
            .iter()
            .map(|node| format!("{}: {}", node.key, node.text))
            .collect::<Vec<_>>()
            .join("\n"))
    }
}
