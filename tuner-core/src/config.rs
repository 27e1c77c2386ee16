//! Engine configuration.
//!
//! Every section deserializes with defaults so a partial TOML file only
//! needs to name the values it overrides.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::commands::{
    DEFAULT_CONFIDENCE_THRESHOLD, DEFAULT_MIN_EFFECT_SIZE, DEFAULT_MIN_SAMPLES_PER_VARIANT,
};

/// Default number of Monte Carlo draws per posterior comparison.
pub const DEFAULT_MONTE_CARLO_DRAWS: usize = 20_000;

/// Default age after which an ANALYZING lease is considered abandoned.
pub const DEFAULT_ANALYSIS_LEASE_SECS: u64 = 300;

/// Default number of raw samples kept per experiment.
pub const DEFAULT_SAMPLE_LOG_CAPACITY: usize = 1_000;

/// Configuration for the experimentation engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Draws per posterior when comparing variants
    pub monte_carlo_draws: usize,
    /// Fixed RNG seed for reproducible analyses
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// How a single winner is chosen among three or more variants
    pub winner_policy: WinnerPolicy,
    /// Seconds before an ANALYZING lease may be re-claimed
    pub analysis_lease_secs: u64,
    /// Raw samples retained per experiment (0 disables the log)
    pub sample_log_capacity: usize,
    /// Optimistic write retry budget
    pub retry: RetryConfig,
    /// Defaults applied to new experiment definitions
    pub defaults: ExperimentDefaults,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            monte_carlo_draws: DEFAULT_MONTE_CARLO_DRAWS,
            seed: None,
            winner_policy: WinnerPolicy::default(),
            analysis_lease_secs: DEFAULT_ANALYSIS_LEASE_SECS,
            sample_log_capacity: DEFAULT_SAMPLE_LOG_CAPACITY,
            retry: RetryConfig::default(),
            defaults: ExperimentDefaults::default(),
        }
    }
}

impl EngineConfig {
    /// Lease length, saturating at `TimeDelta::MAX` for out-of-range values.
    pub fn analysis_lease(&self) -> chrono::TimeDelta {
        i64::try_from(self.analysis_lease_secs)
            .ok()
            .and_then(chrono::TimeDelta::try_seconds)
            .unwrap_or(chrono::TimeDelta::MAX)
    }
}

/// Policy for declaring an overall winner among three or more variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WinnerPolicy {
    /// Test the best treatment against control; a treatment that wins must
    /// also have the highest posterior mean among treatments.
    #[default]
    BestVsControl,
    /// The best arm must pass the sequential test against every other arm.
    BestVsAll,
}

/// Retry budget for optimistic writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first conflicting write before surfacing a conflict
    pub max_retries: u32,
    /// Delay after the first conflict, doubled on each further conflict
    pub initial_backoff_ms: u64,
    /// Upper bound on a single delay
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_600,
        }
    }
}

impl RetryConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// Thresholds used when a definition does not override them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentDefaults {
    pub min_samples_per_variant: u64,
    pub confidence_threshold: f64,
    pub min_effect_size: f64,
}

impl Default for ExperimentDefaults {
    fn default() -> Self {
        Self {
            min_samples_per_variant: DEFAULT_MIN_SAMPLES_PER_VARIANT,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            min_effect_size: DEFAULT_MIN_EFFECT_SIZE,
        }
    }
}
