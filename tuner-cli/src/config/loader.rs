use super::types::{
    DatabaseConfig, RawDatabaseConfig, RawEngineConfig, RawExperimentDefaults, RawRetryConfig,
    RawTunerConfig, TunerConfig,
};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load merged configuration (user + project)
    pub fn load() -> Result<TunerConfig> {
        Self::load_layers(&[Self::user_config_path(), Self::project_config_path()])
    }

    /// Merge the given files in order; later files win, missing files are skipped.
    pub fn load_layers(paths: &[PathBuf]) -> Result<TunerConfig> {
        let mut raw = RawTunerConfig::default();
        for path in paths {
            if let Some(layer) = Self::read_layer(path)? {
                raw = Self::merge_raw(raw, layer);
            }
        }
        Ok(Self::finalize(raw))
    }

    /// Get user config path (`$XDG_CONFIG_HOME/tuner/config.toml`)
    pub fn user_config_path() -> PathBuf {
        tuner_paths::config_file()
    }

    /// Get project config path
    /// Can be overridden with TUNER_PROJECT_CONFIG_DIR env var (useful for isolated e2e tests)
    pub fn project_config_path() -> PathBuf {
        if let Ok(dir) = std::env::var("TUNER_PROJECT_CONFIG_DIR") {
            PathBuf::from(dir).join("config.toml")
        } else {
            PathBuf::from(".tuner/config.toml")
        }
    }

    fn read_layer(path: &Path) -> Result<Option<RawTunerConfig>> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut layer: RawTunerConfig = toml::from_str(&contents)
            .with_context(|| format!("invalid config in {}", path.display()))?;

        // Relative database paths are relative to the file that names them
        if let Some(db) = layer.database.path.as_mut()
            && db.is_relative()
            && let Some(dir) = path.parent()
        {
            *db = dir.join(&*db);
        }
        Ok(Some(layer))
    }

    /// Merge two raw configs (overlay values override base only if explicitly set)
    fn merge_raw(base: RawTunerConfig, overlay: RawTunerConfig) -> RawTunerConfig {
        RawTunerConfig {
            database: RawDatabaseConfig {
                path: overlay.database.path.or(base.database.path),
            },
            engine: RawEngineConfig {
                monte_carlo_draws: overlay
                    .engine
                    .monte_carlo_draws
                    .or(base.engine.monte_carlo_draws),
                seed: overlay.engine.seed.or(base.engine.seed),
                winner_policy: overlay.engine.winner_policy.or(base.engine.winner_policy),
                analysis_lease_secs: overlay
                    .engine
                    .analysis_lease_secs
                    .or(base.engine.analysis_lease_secs),
                sample_log_capacity: overlay
                    .engine
                    .sample_log_capacity
                    .or(base.engine.sample_log_capacity),
                retry: RawRetryConfig {
                    max_retries: overlay
                        .engine
                        .retry
                        .max_retries
                        .or(base.engine.retry.max_retries),
                    initial_backoff_ms: overlay
                        .engine
                        .retry
                        .initial_backoff_ms
                        .or(base.engine.retry.initial_backoff_ms),
                    max_backoff_ms: overlay
                        .engine
                        .retry
                        .max_backoff_ms
                        .or(base.engine.retry.max_backoff_ms),
                },
                defaults: RawExperimentDefaults {
                    min_samples_per_variant: overlay
                        .engine
                        .defaults
                        .min_samples_per_variant
                        .or(base.engine.defaults.min_samples_per_variant),
                    confidence_threshold: overlay
                        .engine
                        .defaults
                        .confidence_threshold
                        .or(base.engine.defaults.confidence_threshold),
                    min_effect_size: overlay
                        .engine
                        .defaults
                        .min_effect_size
                        .or(base.engine.defaults.min_effect_size),
                },
            },
        }
    }

    /// Convert raw config to final config with defaults applied
    fn finalize(raw: RawTunerConfig) -> TunerConfig {
        TunerConfig {
            database: raw
                .database
                .path
                .map(|path| DatabaseConfig { path })
                .unwrap_or_default(),
            engine: raw.engine.finalize(),
        }
    }
}
