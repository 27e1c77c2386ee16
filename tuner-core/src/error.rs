//! Error types for the experimentation engine.

use thiserror::Error;

use crate::experiment::ExperimentStatus;
use crate::types::ExperimentId;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while managing experiments.
///
/// Each kind is a distinct variant so callers can branch on recoverability
/// without matching on messages.
#[derive(Debug, Error)]
pub enum Error {
    /// Experiment does not exist.
    #[error("experiment not found: {0}")]
    ExperimentNotFound(ExperimentId),

    /// Variant is not part of the experiment.
    #[error("variant '{variant}' not found in experiment {experiment}")]
    VariantNotFound {
        experiment: ExperimentId,
        variant: String,
    },

    /// Metric is not tracked by the experiment.
    #[error("metric '{metric}' not tracked by experiment {experiment}")]
    MetricNotFound {
        experiment: ExperimentId,
        metric: String,
    },

    /// Malformed experiment definition or sample.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Operation is not allowed in the experiment's current status.
    #[error("experiment {id} is {status}: {message}")]
    InvalidState {
        id: ExperimentId,
        status: ExperimentStatus,
        message: String,
    },

    /// Optimistic write lost the race after exhausting the retry budget.
    #[error("concurrent modification of experiment {id} after {attempts} attempts")]
    ConcurrencyConflict { id: ExperimentId, attempts: u32 },

    /// Database error from libSQL.
    #[error("database error: {0}")]
    Database(#[from] libsql::Error),

    /// JSON serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid data in the database.
    #[error("invalid data: {0}")]
    InvalidData(String),
}

impl Error {
    /// Whether the whole operation may succeed if the caller retries it.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }

    /// Whether the error reports a missing experiment, variant or metric.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ExperimentNotFound(_) | Self::VariantNotFound { .. } | Self::MetricNotFound { .. }
        )
    }
}
