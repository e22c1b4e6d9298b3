use anyhow::Result;
use std::env;
use std::path::PathBuf;
use tracing::{info, warn};

/// Engine tunables, loaded from the environment with sensible defaults.
///
/// Thresholds for the resolution pipeline and the tentative-merge band are
/// deliberately configurable rather than fixed constants.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub embedding_dim: usize,

    // Candidate filtering
    pub recency_window_days: i64,
    pub mention_count_floor: i64,

    // Resolution thresholds
    pub fuzzy_threshold_person: f32,
    pub fuzzy_threshold_location: f32,
    pub fuzzy_threshold_organization: f32,
    pub fuzzy_threshold_default: f32,
    pub semantic_threshold: f32,
    pub contextual_threshold: f32,
    pub enable_disambiguation: bool,

    // Tentative merge band
    pub tentative_band_low: f32,
    pub tentative_band_high: f32,
    pub tentative_confirmations: i64,

    // Summary tree
    pub staleness_threshold: i64,
    pub summary_refresh_min_interval_secs: u64,
    pub summary_max_sources: usize,

    // Scheduler
    pub quiet_threshold_secs: u64,
    pub worker_count: usize,
    pub max_retries: u32,
    pub task_timeout_secs: u64,
    pub retry_base_delay_ms: u64,
    pub requeue_delay_ms: u64,

    // Maintenance
    pub retention_days: i64,
    pub decay_factor: f32,
    pub decay_idle_days: i64,

    // Extraction
    pub extraction_batch_size: usize,

    // Context assembly
    pub default_context_tokens: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("graphmem.db"),
            embedding_dim: 384,
            recency_window_days: 90,
            mention_count_floor: 2,
            fuzzy_threshold_person: 0.90,
            fuzzy_threshold_location: 0.90,
            fuzzy_threshold_organization: 0.85,
            fuzzy_threshold_default: 0.82,
            semantic_threshold: 0.80,
            contextual_threshold: 0.70,
            enable_disambiguation: false,
            tentative_band_low: 0.70,
            tentative_band_high: 0.85,
            tentative_confirmations: 3,
            staleness_threshold: 10,
            summary_refresh_min_interval_secs: 60,
            summary_max_sources: 12,
            quiet_threshold_secs: 30,
            worker_count: 2,
            max_retries: 3,
            task_timeout_secs: 120,
            retry_base_delay_ms: 500,
            requeue_delay_ms: 2_000,
            retention_days: 0,
            decay_factor: 0.95,
            decay_idle_days: 30,
            extraction_batch_size: 32,
            default_context_tokens: 2_000,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }

        let defaults = Self::default();

        // Worker count auto-detects from CPU cores when set to "auto"
        let worker_count = match env::var("GRAPHMEM_WORKERS").unwrap_or_else(|_| "auto".into()).as_str() {
            "auto" => Self::auto_detect_workers(),
            value => value.parse().unwrap_or(defaults.worker_count),
        };

        let config = Self {
            db_path: env::var("GRAPHMEM_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            embedding_dim: parse_env("GRAPHMEM_EMBEDDING_DIM", defaults.embedding_dim),
            recency_window_days: parse_env("GRAPHMEM_RECENCY_WINDOW_DAYS", defaults.recency_window_days),
            mention_count_floor: parse_env("GRAPHMEM_MENTION_FLOOR", defaults.mention_count_floor),
            fuzzy_threshold_person: parse_env("GRAPHMEM_FUZZY_PERSON", defaults.fuzzy_threshold_person),
            fuzzy_threshold_location: parse_env("GRAPHMEM_FUZZY_LOCATION", defaults.fuzzy_threshold_location),
            fuzzy_threshold_organization: parse_env("GRAPHMEM_FUZZY_ORG", defaults.fuzzy_threshold_organization),
            fuzzy_threshold_default: parse_env("GRAPHMEM_FUZZY_DEFAULT", defaults.fuzzy_threshold_default),
            semantic_threshold: parse_env("GRAPHMEM_SEMANTIC_THRESHOLD", defaults.semantic_threshold),
            contextual_threshold: parse_env("GRAPHMEM_CONTEXTUAL_THRESHOLD", defaults.contextual_threshold),
            enable_disambiguation: parse_env("GRAPHMEM_ENABLE_DISAMBIGUATION", defaults.enable_disambiguation),
            tentative_band_low: parse_env("GRAPHMEM_TENTATIVE_LOW", defaults.tentative_band_low),
            tentative_band_high: parse_env("GRAPHMEM_TENTATIVE_HIGH", defaults.tentative_band_high),
            tentative_confirmations: parse_env("GRAPHMEM_TENTATIVE_CONFIRMATIONS", defaults.tentative_confirmations),
            staleness_threshold: parse_env("GRAPHMEM_STALENESS_THRESHOLD", defaults.staleness_threshold),
            summary_refresh_min_interval_secs: parse_env("GRAPHMEM_SUMMARY_MIN_INTERVAL", defaults.summary_refresh_min_interval_secs),
            summary_max_sources: parse_env("GRAPHMEM_SUMMARY_MAX_SOURCES", defaults.summary_max_sources),
            quiet_threshold_secs: parse_env("GRAPHMEM_QUIET_THRESHOLD", defaults.quiet_threshold_secs),
            worker_count,
            max_retries: parse_env("GRAPHMEM_MAX_RETRIES", defaults.max_retries),
            task_timeout_secs: parse_env("GRAPHMEM_TASK_TIMEOUT", defaults.task_timeout_secs),
            retry_base_delay_ms: parse_env("GRAPHMEM_RETRY_BASE_DELAY_MS", defaults.retry_base_delay_ms),
            requeue_delay_ms: parse_env("GRAPHMEM_REQUEUE_DELAY_MS", defaults.requeue_delay_ms),
            retention_days: parse_env("GRAPHMEM_RETENTION_DAYS", defaults.retention_days),
            decay_factor: parse_env("GRAPHMEM_DECAY_FACTOR", defaults.decay_factor),
            decay_idle_days: parse_env("GRAPHMEM_DECAY_IDLE_DAYS", defaults.decay_idle_days),
            extraction_batch_size: parse_env("GRAPHMEM_EXTRACTION_BATCH", defaults.extraction_batch_size),
            default_context_tokens: parse_env("GRAPHMEM_CONTEXT_TOKENS", defaults.default_context_tokens),
        };

        Ok(config)
    }

    fn auto_detect_workers() -> usize {
        let cores = num_cpus::get();
        info!("Auto-detected CPU cores: {}", cores);
        (cores / 4).clamp(2, 4)
    }

    /// Per-type fuzzy threshold; tighter for uniquely-identifying types
    pub fn fuzzy_threshold_for(&self, entity_type: &crate::graph_db::schema::EntityType) -> f32 {
        use crate::graph_db::schema::EntityType;
        match entity_type {
            EntityType::Person => self.fuzzy_threshold_person,
            EntityType::Location => self.fuzzy_threshold_location,
            EntityType::Organization => self.fuzzy_threshold_organization,
            _ => self.fuzzy_threshold_default,
        }
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- DB Path: {}", self.db_path.display());
        info!("- Embedding Dim: {}", self.embedding_dim);
        info!("- Recency Window: {} days", self.recency_window_days);
        info!("- Mention Floor: {}", self.mention_count_floor);
        info!("- Semantic Threshold: {}", self.semantic_threshold);
        info!("- Staleness Threshold: {}", self.staleness_threshold);
        info!("- Workers: {}", self.worker_count);
        info!("- Max Retries: {}", self.max_retries);
        info!("- Task Timeout: {}s", self.task_timeout_secs);
        info!("- Quiet Threshold: {}s", self.quiet_threshold_secs);
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph_db::schema::EntityType;

    // ===== Default Value Tests =====

    #[test]
    fn test_default_thresholds_ordering() {
        let config = Config::default();

        // Person/location merges are costlier, so thresholds are tighter
        assert!(config.fuzzy_threshold_person >= config.fuzzy_threshold_organization);
        assert!(config.fuzzy_threshold_organization >= config.fuzzy_threshold_default);
    }

    #[test]
    fn test_default_tentative_band_valid() {
        let config = Config::default();

        assert!(config.tentative_band_low < config.tentative_band_high);
        assert!(config.tentative_band_high <= 1.0);
        assert!(config.tentative_confirmations > 0);
    }

    #[test]
    fn test_default_scheduler_values() {
        let config = Config::default();

        assert!(config.worker_count >= 1);
        assert!(config.max_retries > 0);
        assert!(config.task_timeout_secs > 0);
        assert!(config.retry_base_delay_ms > 0);
    }

    #[test]
    fn test_disambiguation_off_by_default() {
        let config = Config::default();
        assert!(!config.enable_disambiguation);
    }

    // ===== Per-Type Threshold Tests =====

    #[test]
    fn test_fuzzy_threshold_for_types() {
        let config = Config::default();

        assert_eq!(config.fuzzy_threshold_for(&EntityType::Person), config.fuzzy_threshold_person);
        assert_eq!(config.fuzzy_threshold_for(&EntityType::Organization), config.fuzzy_threshold_organization);
        assert_eq!(config.fuzzy_threshold_for(&EntityType::Concept), config.fuzzy_threshold_default);
    }

    // ===== Auto-detect Tests =====

    #[test]
    fn test_auto_detect_workers_bounded() {
        let workers = Config::auto_detect_workers();
        assert!(workers >= 2);
        assert!(workers <= 4);
    }
}
