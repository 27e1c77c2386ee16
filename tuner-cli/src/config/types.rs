use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tuner_core::{EngineConfig, ExperimentDefaults, RetryConfig, WinnerPolicy};

/// Configuration as stored in TOML files (with optional fields for merging)
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawTunerConfig {
    #[serde(default)]
    pub database: RawDatabaseConfig,

    #[serde(default)]
    pub engine: RawEngineConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawDatabaseConfig {
    /// Path of the experiment database
    pub path: Option<PathBuf>,
}

/// Engine settings as stored in TOML (optional fields for proper merging)
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawEngineConfig {
    pub monte_carlo_draws: Option<usize>,
    pub seed: Option<u64>,
    pub winner_policy: Option<WinnerPolicy>,
    pub analysis_lease_secs: Option<u64>,
    pub sample_log_capacity: Option<usize>,

    #[serde(default)]
    pub retry: RawRetryConfig,

    #[serde(default)]
    pub defaults: RawExperimentDefaults,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawRetryConfig {
    pub max_retries: Option<u32>,
    pub initial_backoff_ms: Option<u64>,
    pub max_backoff_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawExperimentDefaults {
    pub min_samples_per_variant: Option<u64>,
    pub confidence_threshold: Option<f64>,
    pub min_effect_size: Option<f64>,
}

/// Final configuration with defaults applied
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TunerConfig {
    pub database: DatabaseConfig,
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: tuner_paths::database_path(),
        }
    }
}

impl RawEngineConfig {
    /// Apply defaults for every unset field.
    pub fn finalize(self) -> EngineConfig {
        let base = EngineConfig::default();
        EngineConfig {
            monte_carlo_draws: self.monte_carlo_draws.unwrap_or(base.monte_carlo_draws),
            seed: self.seed,
            winner_policy: self.winner_policy.unwrap_or(base.winner_policy),
            analysis_lease_secs: self.analysis_lease_secs.unwrap_or(base.analysis_lease_secs),
            sample_log_capacity: self.sample_log_capacity.unwrap_or(base.sample_log_capacity),
            retry: RetryConfig {
                max_retries: self.retry.max_retries.unwrap_or(base.retry.max_retries),
                initial_backoff_ms: self
                    .retry
                    .initial_backoff_ms
                    .unwrap_or(base.retry.initial_backoff_ms),
                max_backoff_ms: self.retry.max_backoff_ms.unwrap_or(base.retry.max_backoff_ms),
            },
            defaults: ExperimentDefaults {
                min_samples_per_variant: self
                    .defaults
                    .min_samples_per_variant
                    .unwrap_or(base.defaults.min_samples_per_variant),
                confidence_threshold: self
                    .defaults
                    .confidence_threshold
                    .unwrap_or(base.defaults.confidence_threshold),
                min_effect_size: self
                    .defaults
                    .min_effect_size
                    .unwrap_or(base.defaults.min_effect_size),
            },
        }
    }
}
