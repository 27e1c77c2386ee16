//! Experiment types: status, metrics, per-variant aggregates and samples.
//!
//! An experiment is persisted as one versioned document holding its
//! definition, every variant's aggregates, its status and its winner.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::commands::CreateExperiment;
use crate::error::{Error, Result};
use crate::types::{ExperimentId, Version};

/// Opaque variant configuration. The engine never looks inside it.
pub type VariantConfig = serde_json::Map<String, serde_json::Value>;

/// Lifecycle status of an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    /// Created, no samples yet
    Created,
    /// Collecting samples
    Active,
    /// An analyzer holds the decision lease
    Analyzing,
    /// Winner declared (terminal)
    Completed,
    /// Cancelled without a winner (terminal)
    Aborted,
}

impl ExperimentStatus {
    /// Convert to database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Active => "active",
            Self::Analyzing => "analyzing",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        }
    }

    /// Parse from database string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "active" => Some(Self::Active),
            "analyzing" => Some(Self::Analyzing),
            "completed" => Some(Self::Completed),
            "aborted" => Some(Self::Aborted),
            _ => None,
        }
    }

    /// Check if the status is terminal.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }

    /// All statuses, in lifecycle order.
    pub fn all() -> &'static [ExperimentStatus] {
        &[
            Self::Created,
            Self::Active,
            Self::Analyzing,
            Self::Completed,
            Self::Aborted,
        ]
    }
}

impl fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExperimentStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("unknown experiment status: {s}"))
    }
}

/// How a metric's observations are modelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Success/failure observations, Beta posterior
    #[default]
    Rate,
    /// Real-valued observations, Normal posterior
    Continuous,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rate => "rate",
            Self::Continuous => "continuous",
        }
    }
}

impl FromStr for MetricKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "rate" => Ok(Self::Rate),
            "continuous" => Ok(Self::Continuous),
            _ => Err(format!("unknown metric kind: {s}")),
        }
    }
}

/// Which direction of a metric counts as better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Goal {
    #[default]
    Maximize,
    Minimize,
}

impl Goal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Maximize => "maximize",
            Self::Minimize => "minimize",
        }
    }

    /// Map a raw value onto a scale where larger is always better.
    #[must_use]
    pub fn orient(&self, value: f64) -> f64 {
        match self {
            Self::Maximize => value,
            Self::Minimize => -value,
        }
    }
}

impl FromStr for Goal {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "maximize" | "max" => Ok(Self::Maximize),
            "minimize" | "min" => Ok(Self::Minimize),
            _ => Err(format!("unknown metric goal: {s}")),
        }
    }
}

/// A metric tracked by an experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricSpec {
    pub name: String,
    #[serde(default)]
    pub kind: MetricKind,
    #[serde(default)]
    pub goal: Goal,
}

impl MetricSpec {
    /// A success-rate metric where higher is better.
    pub fn rate(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: MetricKind::Rate,
            goal: Goal::Maximize,
        }
    }

    /// A continuous metric where higher is better.
    pub fn continuous(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: MetricKind::Continuous,
            goal: Goal::Maximize,
        }
    }

    /// Flip the goal so lower values win.
    #[must_use]
    pub fn minimize(mut self) -> Self {
        self.goal = Goal::Minimize;
        self
    }
}

/// Parses `name`, `name:kind` or `name:kind:goal`.
impl FromStr for MetricSpec {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut parts = s.split(':');
        let name = parts.next().unwrap_or_default().trim();
        if name.is_empty() {
            return Err(format!("invalid metric spec: {s}"));
        }
        let kind = parts
            .next()
            .map(str::parse::<MetricKind>)
            .transpose()?
            .unwrap_or_default();
        let goal = parts
            .next()
            .map(str::parse::<Goal>)
            .transpose()?
            .unwrap_or_default();
        if parts.next().is_some() {
            return Err(format!("invalid metric spec: {s}"));
        }
        Ok(Self {
            name: name.to_string(),
            kind,
            goal,
        })
    }
}

/// Sufficient statistics for one variant/metric pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Aggregate {
    Rate {
        successes: u64,
        trials: u64,
    },
    Continuous {
        count: u64,
        sum: f64,
        sum_of_squares: f64,
    },
}

impl Aggregate {
    /// Empty aggregate for a metric kind.
    pub fn empty(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Rate => Self::Rate {
                successes: 0,
                trials: 0,
            },
            MetricKind::Continuous => Self::Continuous {
                count: 0,
                sum: 0.0,
                sum_of_squares: 0.0,
            },
        }
    }

    /// Rate aggregate from raw counts.
    pub fn rate(successes: u64, trials: u64) -> Self {
        Self::Rate {
            successes: successes.min(trials),
            trials,
        }
    }

    /// Continuous aggregate from a set of observations.
    pub fn from_values(values: &[f64]) -> Self {
        Self::Continuous {
            count: values.len() as u64,
            sum: values.iter().sum(),
            sum_of_squares: values.iter().map(|v| v * v).sum(),
        }
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            Self::Rate { .. } => MetricKind::Rate,
            Self::Continuous { .. } => MetricKind::Continuous,
        }
    }

    /// Number of observations folded into this aggregate.
    pub fn trials(&self) -> u64 {
        match self {
            Self::Rate { trials, .. } => *trials,
            Self::Continuous { count, .. } => *count,
        }
    }

    /// Observed success rate or sample mean; zero with no observations.
    pub fn point_estimate(&self) -> f64 {
        match self {
            Self::Rate { successes, trials } if *trials > 0 => *successes as f64 / *trials as f64,
            Self::Continuous { count, sum, .. } if *count > 0 => sum / *count as f64,
            _ => 0.0,
        }
    }

    /// Unbiased sample variance for continuous metrics (`None` below two observations).
    pub fn sample_variance(&self) -> Option<f64> {
        match self {
            Self::Continuous {
                count,
                sum,
                sum_of_squares,
            } if *count >= 2 => {
                let n = *count as f64;
                Some(((sum_of_squares - sum * sum / n) / (n - 1.0)).max(0.0))
            }
            _ => None,
        }
    }

    /// Fold one observation into the aggregate.
    pub fn observe(&mut self, value: f64) -> Result<()> {
        validate_value(self.kind(), value)?;
        match self {
            Self::Rate { successes, trials } => {
                *trials += 1;
                if value > 0.5 {
                    *successes += 1;
                }
            }
            Self::Continuous {
                count,
                sum,
                sum_of_squares,
            } => {
                *count += 1;
                *sum += value;
                *sum_of_squares += value * value;
            }
        }
        Ok(())
    }
}

fn validate_value(kind: MetricKind, value: f64) -> Result<()> {
    match kind {
        MetricKind::Rate if !(0.0..=1.0).contains(&value) => Err(Error::Validation(format!(
            "rate metric values must be within [0, 1], got {value}"
        ))),
        MetricKind::Continuous if !value.is_finite() => Err(Error::Validation(format!(
            "continuous metric values must be finite, got {value}"
        ))),
        _ => Ok(()),
    }
}

/// Declared variant before any data is recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantDefinition {
    pub name: String,
    #[serde(default)]
    pub configuration: VariantConfig,
}

/// A variant with its recorded aggregates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub name: String,
    pub configuration: VariantConfig,
    /// Number of samples applied to this variant
    pub samples: u64,
    pub aggregates: BTreeMap<String, Aggregate>,
}

impl Variant {
    fn new(definition: VariantDefinition, metrics: &[MetricSpec]) -> Self {
        let aggregates = metrics
            .iter()
            .map(|m| (m.name.clone(), Aggregate::empty(m.kind)))
            .collect();
        Self {
            name: definition.name,
            configuration: definition.configuration,
            samples: 0,
            aggregates,
        }
    }

    pub fn aggregate(&self, metric: &str) -> Option<&Aggregate> {
        self.aggregates.get(metric)
    }
}

/// An outcome observation reported for one variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub experiment_id: ExperimentId,
    pub variant_name: String,
    pub metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl Sample {
    pub fn new(
        experiment_id: ExperimentId,
        variant_name: impl Into<String>,
        metrics: BTreeMap<String, f64>,
    ) -> Self {
        Self {
            experiment_id,
            variant_name: variant_name.into(),
            metrics,
            metadata: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: BTreeMap<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Full persisted snapshot of an experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: ExperimentId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub status: ExperimentStatus,
    pub metrics: Vec<MetricSpec>,
    pub selection_metric: String,
    pub control: String,
    pub variants: Vec<Variant>,
    pub min_samples_per_variant: u64,
    pub confidence_threshold: f64,
    pub min_effect_size: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub winner_variant: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub abort_reason: Option<String>,
    #[serde(default)]
    pub analysis_started_at: Option<DateTime<Utc>>,
    /// Version this snapshot was loaded at
    pub version: Version,
}

impl Experiment {
    /// Build a CREATED experiment from an already validated definition.
    pub fn from_definition(id: ExperimentId, cmd: CreateExperiment) -> Self {
        let control = cmd.resolved_control().unwrap_or_default();
        let now = Utc::now();
        let variants = cmd
            .variants
            .into_iter()
            .map(|v| Variant::new(v, &cmd.metrics))
            .collect();
        Self {
            id,
            name: cmd.name,
            description: cmd.description,
            status: ExperimentStatus::Created,
            metrics: cmd.metrics,
            selection_metric: cmd.selection_metric,
            control,
            variants,
            min_samples_per_variant: cmd.min_samples_per_variant,
            confidence_threshold: cmd.confidence_threshold,
            min_effect_size: cmd.min_effect_size,
            created_at: now,
            updated_at: now,
            completed_at: None,
            winner_variant: None,
            notes: None,
            abort_reason: None,
            analysis_started_at: None,
            version: 0,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_finished()
    }

    pub fn variant(&self, name: &str) -> Option<&Variant> {
        self.variants.iter().find(|v| v.name == name)
    }

    pub fn metric(&self, name: &str) -> Option<&MetricSpec> {
        self.metrics.iter().find(|m| m.name == name)
    }

    /// Look up a metric or fail with a not-found error.
    pub fn require_metric(&self, name: &str) -> Result<&MetricSpec> {
        self.metric(name).ok_or_else(|| Error::MetricNotFound {
            experiment: self.id,
            metric: name.to_string(),
        })
    }

    /// Look up a variant or fail with a not-found error.
    pub fn require_variant(&self, name: &str) -> Result<&Variant> {
        self.variant(name).ok_or_else(|| Error::VariantNotFound {
            experiment: self.id,
            variant: name.to_string(),
        })
    }

    /// Treatment variants, i.e. every variant except control.
    pub fn treatments(&self) -> impl Iterator<Item = &Variant> {
        self.variants.iter().filter(|v| v.name != self.control)
    }

    /// Fold a sample into the named variant's aggregates.
    ///
    /// Every value is validated before any aggregate changes, so a rejected
    /// sample leaves the snapshot untouched.
    pub fn apply_sample(&mut self, sample: &Sample) -> Result<()> {
        if sample.metrics.is_empty() {
            return Err(Error::Validation("sample carries no metric values".into()));
        }
        let variant_index = self
            .variants
            .iter()
            .position(|v| v.name == sample.variant_name)
            .ok_or_else(|| Error::VariantNotFound {
                experiment: self.id,
                variant: sample.variant_name.clone(),
            })?;

        for (name, value) in &sample.metrics {
            let spec = self.metric(name).ok_or_else(|| {
                Error::Validation(format!("metric '{name}' is not tracked by this experiment"))
            })?;
            validate_value(spec.kind, *value)?;
        }

        let metrics = self.metrics.clone();
        let variant = &mut self.variants[variant_index];
        for (name, value) in &sample.metrics {
            let aggregate = variant.aggregates.entry(name.clone()).or_insert_with(|| {
                let kind = metrics
                    .iter()
                    .find(|m| &m.name == name)
                    .map(|m| m.kind)
                    .unwrap_or_default();
                Aggregate::empty(kind)
            });
            aggregate.observe(*value)?;
        }
        variant.samples += 1;

        if self.status == ExperimentStatus::Created {
            self.status = ExperimentStatus::Active;
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Samples applied per variant, in declaration order.
    pub fn samples_per_variant(&self) -> BTreeMap<String, u64> {
        self.variants
            .iter()
            .map(|v| (v.name.clone(), v.samples))
            .collect()
    }

    pub fn summary(&self) -> ExperimentSummary {
        ExperimentSummary {
            id: self.id,
            name: self.name.clone(),
            status: self.status,
            selection_metric: self.selection_metric.clone(),
            variant_count: self.variants.len(),
            total_samples: self.variants.iter().map(|v| v.samples).sum(),
            winner_variant: self.winner_variant.clone(),
            created_at: self.created_at,
            completed_at: self.completed_at,
            version: self.version,
        }
    }
}

/// Lightweight listing entry for an experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSummary {
    pub id: ExperimentId,
    pub name: String,
    pub status: ExperimentStatus,
    pub selection_metric: String,
    pub variant_count: usize,
    pub total_samples: u64,
    pub winner_variant: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub version: Version,
}
