//! Error taxonomy for the memory engine
//!
//! Storage internals use `anyhow` and are mapped into these variants at the
//! component boundary. Background task failures stay isolated per task and
//! are surfaced through status, never propagated as a crash.

use std::fmt::Display;
use thiserror::Error;

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The event log or graph store is unreachable. Fatal for the current
    /// operation; the caller retries on the next cycle.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The embedding model could not be loaded. Non-fatal: semantic
    /// matching is skipped and the remaining stages still run.
    #[error("embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// Resolution of one batch item failed; the event stays pending and is
    /// retried next cycle.
    #[error("resolution failed: {0}")]
    ResolutionFailed(String),

    /// A background task exceeded its execution deadline.
    #[error("task timed out after {0:?}")]
    TaskTimeout(std::time::Duration),

    /// A background task returned an error.
    #[error("task failed: {0}")]
    TaskError(String),

    /// Two tentative merges disagree on the same mention. The higher
    /// confidence mapping wins; the rejected one is logged for audit.
    #[error("merge conflict for mention '{mention}': kept {kept}, rejected {rejected}")]
    MergeConflict {
        mention: String,
        kept: uuid::Uuid,
        rejected: uuid::Uuid,
    },
}

impl EngineError {
    pub fn storage<E: Display>(err: E) -> Self {
        Self::StorageUnavailable(err.to_string())
    }

    pub fn resolution<E: Display>(err: E) -> Self {
        Self::ResolutionFailed(err.to_string())
    }

    pub fn task<E: Display>(err: E) -> Self {
        Self::TaskError(err.to_string())
    }
}
