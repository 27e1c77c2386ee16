//! Command types for experiment lifecycle management.
//!
//! Commands represent intentions to change state. They are processed by
//! [`ExperimentManager`](crate::ExperimentManager) which validates them
//! before anything is written.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::experiment::{MetricSpec, VariantConfig, VariantDefinition};

/// Default minimum samples per variant before early stopping is considered.
pub const DEFAULT_MIN_SAMPLES_PER_VARIANT: u64 = 10;

/// Default posterior probability required to declare a winner.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.95;

/// Default minimum relative effect size worth acting on.
pub const DEFAULT_MIN_EFFECT_SIZE: f64 = 0.05;

/// Command to create a new experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateExperiment {
    /// Human-readable name for the experiment.
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Variants in declaration order.
    pub variants: Vec<VariantDefinition>,

    /// Tracked metrics in declaration order.
    pub metrics: Vec<MetricSpec>,

    /// Metric that drives Thompson sampling allocation and analysis.
    pub selection_metric: String,

    /// Explicit control variant. Defaults to a variant named `control`,
    /// falling back to the first declared variant.
    #[serde(default)]
    pub control: Option<String>,

    pub min_samples_per_variant: u64,
    pub confidence_threshold: f64,
    pub min_effect_size: f64,
}

impl CreateExperiment {
    /// Start a definition with the default thresholds.
    pub fn new(name: impl Into<String>, selection_metric: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            variants: Vec::new(),
            metrics: Vec::new(),
            selection_metric: selection_metric.into(),
            control: None,
            min_samples_per_variant: DEFAULT_MIN_SAMPLES_PER_VARIANT,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            min_effect_size: DEFAULT_MIN_EFFECT_SIZE,
        }
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn variant(mut self, name: impl Into<String>, configuration: VariantConfig) -> Self {
        self.variants.push(VariantDefinition {
            name: name.into(),
            configuration,
        });
        self
    }

    #[must_use]
    pub fn metric(mut self, metric: MetricSpec) -> Self {
        self.metrics.push(metric);
        self
    }

    #[must_use]
    pub fn control(mut self, name: impl Into<String>) -> Self {
        self.control = Some(name.into());
        self
    }

    #[must_use]
    pub fn min_samples_per_variant(mut self, min_samples: u64) -> Self {
        self.min_samples_per_variant = min_samples;
        self
    }

    #[must_use]
    pub fn confidence_threshold(mut self, threshold: f64) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    #[must_use]
    pub fn min_effect_size(mut self, effect: f64) -> Self {
        self.min_effect_size = effect;
        self
    }

    /// Name of the control variant this definition resolves to.
    pub fn resolved_control(&self) -> Option<String> {
        if let Some(control) = &self.control {
            return Some(control.clone());
        }
        self.variants
            .iter()
            .find(|v| v.name == "control")
            .or_else(|| self.variants.first())
            .map(|v| v.name.clone())
    }

    /// Reject malformed definitions before anything is persisted.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return invalid("experiment name must not be empty");
        }
        if self.variants.len() < 2 {
            return invalid(format!(
                "an experiment needs at least 2 variants, got {}",
                self.variants.len()
            ));
        }
        let mut seen = HashSet::new();
        for variant in &self.variants {
            if variant.name.trim().is_empty() {
                return invalid("variant names must not be empty");
            }
            if !seen.insert(variant.name.as_str()) {
                return invalid(format!("duplicate variant name '{}'", variant.name));
            }
        }

        if self.metrics.is_empty() {
            return invalid("an experiment needs at least one metric");
        }
        let mut seen = HashSet::new();
        for metric in &self.metrics {
            if metric.name.trim().is_empty() {
                return invalid("metric names must not be empty");
            }
            if !seen.insert(metric.name.as_str()) {
                return invalid(format!("duplicate metric name '{}'", metric.name));
            }
        }
        if !seen.contains(self.selection_metric.as_str()) {
            return invalid(format!(
                "selection metric '{}' is not among the tracked metrics",
                self.selection_metric
            ));
        }

        if let Some(control) = &self.control
            && !self.variants.iter().any(|v| &v.name == control)
        {
            return invalid(format!("control variant '{control}' is not declared"));
        }

        if self.min_samples_per_variant < 1 {
            return invalid("min_samples_per_variant must be at least 1");
        }
        if !(self.confidence_threshold > 0.0 && self.confidence_threshold < 1.0) {
            return invalid(format!(
                "confidence_threshold must be within (0, 1), got {}",
                self.confidence_threshold
            ));
        }
        if !(self.min_effect_size.is_finite() && self.min_effect_size >= 0.0) {
            return invalid(format!(
                "min_effect_size must be a non-negative number, got {}",
                self.min_effect_size
            ));
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> Result<()> {
    Err(Error::Validation(message.into()))
}
