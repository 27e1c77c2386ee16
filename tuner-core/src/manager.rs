//! Experiment lifecycle management.
//!
//! [`ExperimentManager`] composes the registry, selector, analyzer and
//! sequential tester. Every state change is a compare-and-swap through
//! [`update_with_retry`], so concurrent callers never overwrite each other.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::analyzer::{BayesianAnalyzer, Comparison, CredibleInterval};
use crate::commands::CreateExperiment;
use crate::config::{EngineConfig, WinnerPolicy};
use crate::error::{Error, Result};
use crate::experiment::{
    Aggregate, Experiment, ExperimentStatus, ExperimentSummary, MetricSpec, Sample, Variant,
    VariantConfig,
};
use crate::posterior::Posterior;
use crate::registry::{ExperimentRegistry, Mutation, RetryPolicy, SampleLog, update_with_retry};
use crate::selector::VariantSelector;
use crate::sequential::{Arm, SequentialTester, StopCriteria, StopDecision, StopReason};
use crate::types::ExperimentId;

/// Variant chosen for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantAssignment {
    pub experiment_id: ExperimentId,
    pub variant_name: String,
    pub configuration: VariantConfig,
}

/// Whether a sample was folded into the aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordOutcome {
    /// False when the experiment had already finished
    pub accepted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisOutcome {
    /// A winner was declared and the experiment completed
    Winner,
    /// Some arm is below the minimum sample count
    InsufficientData,
    /// Enough data, but no arm wins with the required confidence and effect
    NoSignificantDifference,
    /// Not ACTIVE (or another analyzer holds the lease); nothing computed
    NotActive,
}

/// Result of one `analyze` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub experiment_id: ExperimentId,
    pub status: ExperimentStatus,
    pub outcome: AnalysisOutcome,
    pub winner: Option<String>,
    /// Posterior probability that the reported arm beats the arm it was tested against
    pub probability: Option<f64>,
    /// Credible interval of the reported arm
    pub credible_interval: Option<CredibleInterval>,
    /// Arm the decision was measured against (control, or the runner-up)
    pub baseline: Option<String>,
    /// Arm the decision is about
    pub challenger: Option<String>,
    pub reason: Option<StopReason>,
    pub comparison: Option<Comparison>,
    pub samples_per_variant: BTreeMap<String, u64>,
}

impl AnalysisReport {
    fn not_active(experiment: &Experiment) -> Self {
        Self {
            experiment_id: experiment.id,
            status: experiment.status,
            outcome: AnalysisOutcome::NotActive,
            winner: experiment.winner_variant.clone(),
            probability: None,
            credible_interval: None,
            baseline: None,
            challenger: None,
            reason: None,
            comparison: None,
            samples_per_variant: experiment.samples_per_variant(),
        }
    }
}

/// Point-in-time copy of the engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineCounters {
    pub samples_recorded: u64,
    pub samples_after_completion: u64,
    pub experiments_completed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    samples_recorded: AtomicU64,
    samples_after_completion: AtomicU64,
    experiments_completed: AtomicU64,
}

/// Decision reached for one experiment snapshot.
#[derive(Debug)]
struct Verdict {
    winner: Option<String>,
    baseline: String,
    challenger: String,
    decision: StopDecision,
}

impl Verdict {
    fn outcome(&self) -> AnalysisOutcome {
        if self.winner.is_some() {
            AnalysisOutcome::Winner
        } else if self.decision.reason == StopReason::InsufficientData {
            AnalysisOutcome::InsufficientData
        } else {
            AnalysisOutcome::NoSignificantDifference
        }
    }

    /// Probability and interval of whichever arm the verdict is about.
    fn headline(&self) -> (Option<f64>, Option<CredibleInterval>) {
        let Some(comparison) = &self.decision.comparison else {
            return (None, None);
        };
        let p = comparison.probability_b_better;
        if self.winner.as_deref() == Some(self.baseline.as_str()) {
            (Some(1.0 - p), Some(comparison.credible_interval_a))
        } else {
            (Some(p), Some(comparison.credible_interval_b))
        }
    }
}

/// Orchestrates experiment state transitions.
pub struct ExperimentManager {
    registry: Arc<dyn ExperimentRegistry>,
    sample_log: Option<Arc<dyn SampleLog>>,
    config: EngineConfig,
    retry: RetryPolicy,
    selector: VariantSelector,
    tester: SequentialTester,
    selection_rng: Option<Mutex<StdRng>>,
    counters: Counters,
}

impl ExperimentManager {
    pub fn new(registry: Arc<dyn ExperimentRegistry>, config: EngineConfig) -> Self {
        let retry = RetryPolicy::from(&config.retry);
        let tester = SequentialTester::new(BayesianAnalyzer::new(config.monte_carlo_draws));
        let selection_rng = config.seed.map(|seed| Mutex::new(StdRng::seed_from_u64(seed)));
        Self {
            registry,
            sample_log: None,
            config,
            retry,
            selector: VariantSelector::new(),
            tester,
            selection_rng,
            counters: Counters::default(),
        }
    }

    /// Keep raw samples in `log` as well as in the aggregates.
    #[must_use]
    pub fn with_sample_log(mut self, log: Arc<dyn SampleLog>) -> Self {
        self.sample_log = Some(log);
        self
    }

    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // === Commands ===

    /// Validate and persist a new experiment in CREATED.
    #[instrument(skip(self, definition), fields(name = %definition.name))]
    pub async fn create(&self, definition: CreateExperiment) -> Result<ExperimentId> {
        definition.validate()?;
        let variants = definition.variants.len();
        let id = self.registry.create(definition).await?;
        info!(%id, variants, "experiment created");
        Ok(id)
    }

    /// Choose a variant for one request by Thompson sampling.
    ///
    /// `metric` defaults to the experiment's selection metric.
    #[instrument(skip(self), level = "debug")]
    pub async fn get_variant(
        &self,
        id: ExperimentId,
        metric: Option<&str>,
    ) -> Result<VariantAssignment> {
        let experiment = self.registry.load(id).await?;
        let metric = metric.unwrap_or(experiment.selection_metric.as_str());
        experiment.require_metric(metric)?;
        if experiment.is_finished() {
            return Err(Error::InvalidState {
                id,
                status: experiment.status,
                message: "finished experiments no longer allocate traffic".into(),
            });
        }

        let name = self.select(&experiment, metric)?;
        let variant = experiment.require_variant(&name)?;
        debug!(%id, variant = %name, "variant selected");
        Ok(VariantAssignment {
            experiment_id: id,
            variant_name: name.clone(),
            configuration: variant.configuration.clone(),
        })
    }

    /// Fold one outcome sample into the variant's aggregates.
    ///
    /// Samples for a COMPLETED or ABORTED experiment are dropped and counted,
    /// never rejected with an error.
    #[instrument(
        skip(self, sample),
        level = "debug",
        fields(id = %sample.experiment_id, variant = %sample.variant_name)
    )]
    pub async fn record_sample(&self, sample: Sample) -> Result<RecordOutcome> {
        let id = sample.experiment_id;
        let (experiment, (accepted, activated)) =
            update_with_retry(self.registry.as_ref(), id, &self.retry, |exp| {
                if exp.is_finished() {
                    return Ok(Mutation::Skip((false, false)));
                }
                let activated = exp.status == ExperimentStatus::Created;
                exp.apply_sample(&sample)?;
                Ok(Mutation::Write((true, activated)))
            })
            .await?;

        if !accepted {
            let dropped = self
                .counters
                .samples_after_completion
                .fetch_add(1, Ordering::Relaxed)
                + 1;
            warn!(
                %id,
                status = %experiment.status,
                dropped,
                "sample dropped for finished experiment"
            );
            return Ok(RecordOutcome { accepted: false });
        }

        self.counters.samples_recorded.fetch_add(1, Ordering::Relaxed);
        if activated {
            info!(%id, "experiment active");
        }
        if let Some(log) = &self.sample_log
            && let Err(e) = log.append(&sample).await
        {
            warn!(%id, error = %e, "failed to append to sample log");
        }
        Ok(RecordOutcome { accepted: true })
    }

    /// Run the stopping rule and complete the experiment if it signals a winner.
    ///
    /// Claims the ANALYZING lease first; a caller that finds the experiment
    /// not ACTIVE (or leased by someone else) gets the current status back
    /// without any computation.
    #[instrument(skip(self))]
    pub async fn analyze(&self, id: ExperimentId) -> Result<AnalysisReport> {
        let claimed_at = Utc::now();
        let lease = self.config.analysis_lease();
        let (experiment, claimed) =
            update_with_retry(self.registry.as_ref(), id, &self.retry, |exp| {
                let claimable = match exp.status {
                    ExperimentStatus::Active => true,
                    ExperimentStatus::Analyzing => {
                        lease_expired(exp.analysis_started_at, lease, claimed_at)
                    }
                    _ => false,
                };
                if !claimable {
                    return Ok(Mutation::Skip(false));
                }
                if exp.status == ExperimentStatus::Analyzing {
                    warn!(%id, "reclaiming abandoned analysis lease");
                }
                exp.status = ExperimentStatus::Analyzing;
                exp.analysis_started_at = Some(claimed_at);
                exp.updated_at = claimed_at;
                Ok(Mutation::Write(true))
            })
            .await?;

        if !claimed {
            debug!(%id, status = %experiment.status, "analysis skipped");
            return Ok(AnalysisReport::not_active(&experiment));
        }

        let verdict = match self.decide(&experiment) {
            Ok(verdict) => verdict,
            Err(e) => {
                self.release_lease(id, claimed_at).await;
                return Err(e);
            }
        };

        let winner = verdict.winner.clone();
        let commit = update_with_retry(self.registry.as_ref(), id, &self.retry, |exp| {
            if exp.status != ExperimentStatus::Analyzing
                || exp.analysis_started_at != Some(claimed_at)
            {
                return Ok(Mutation::Skip(false));
            }
            let now = Utc::now();
            exp.analysis_started_at = None;
            exp.updated_at = now;
            match &winner {
                Some(name) => {
                    exp.status = ExperimentStatus::Completed;
                    exp.winner_variant = Some(name.clone());
                    exp.completed_at = Some(now);
                }
                None => exp.status = ExperimentStatus::Active,
            }
            Ok(Mutation::Write(true))
        })
        .await;
        let (committed, committed_now) = match commit {
            Ok(committed) => committed,
            Err(e) => {
                self.release_lease(id, claimed_at).await;
                return Err(e);
            }
        };

        if !committed_now {
            warn!(%id, status = %committed.status, "analysis lease lost before commit");
            return Ok(AnalysisReport::not_active(&committed));
        }

        if let Some(name) = &winner {
            self.counters
                .experiments_completed
                .fetch_add(1, Ordering::Relaxed);
            info!(%id, winner = %name, "experiment completed by analysis");
        } else {
            debug!(%id, reason = ?verdict.decision.reason, "no decision, collecting more data");
        }

        let (probability, credible_interval) = verdict.headline();
        Ok(AnalysisReport {
            experiment_id: id,
            status: committed.status,
            outcome: verdict.outcome(),
            winner,
            probability,
            credible_interval,
            baseline: Some(verdict.baseline),
            challenger: Some(verdict.challenger),
            reason: Some(verdict.decision.reason),
            comparison: verdict.decision.comparison,
            samples_per_variant: committed.samples_per_variant(),
        })
    }

    /// Manually declare a winner.
    ///
    /// Completing again with the same winner is a no-op.
    #[instrument(skip(self, notes))]
    pub async fn complete(
        &self,
        id: ExperimentId,
        winner: &str,
        notes: Option<String>,
    ) -> Result<Experiment> {
        let (experiment, completed_now) =
            update_with_retry(self.registry.as_ref(), id, &self.retry, |exp| {
                exp.require_variant(winner)?;
                match exp.status {
                    ExperimentStatus::Completed
                        if exp.winner_variant.as_deref() == Some(winner) =>
                    {
                        Ok(Mutation::Skip(false))
                    }
                    ExperimentStatus::Completed => Err(Error::InvalidState {
                        id,
                        status: exp.status,
                        message: format!(
                            "already completed with winner '{}'",
                            exp.winner_variant.as_deref().unwrap_or_default()
                        ),
                    }),
                    ExperimentStatus::Aborted => Err(Error::InvalidState {
                        id,
                        status: exp.status,
                        message: "aborted experiments cannot be completed".into(),
                    }),
                    _ => {
                        let now = Utc::now();
                        exp.status = ExperimentStatus::Completed;
                        exp.winner_variant = Some(winner.to_string());
                        exp.completed_at = Some(now);
                        exp.notes = notes.clone();
                        exp.analysis_started_at = None;
                        exp.updated_at = now;
                        Ok(Mutation::Write(true))
                    }
                }
            })
            .await?;

        if completed_now {
            self.counters
                .experiments_completed
                .fetch_add(1, Ordering::Relaxed);
            info!(%id, winner, "experiment completed manually");
        }
        Ok(experiment)
    }

    /// Cancel an experiment without a winner.
    #[instrument(skip(self, reason))]
    pub async fn abort(&self, id: ExperimentId, reason: Option<String>) -> Result<Experiment> {
        let (experiment, aborted_now) =
            update_with_retry(self.registry.as_ref(), id, &self.retry, |exp| match exp.status {
                ExperimentStatus::Aborted => Ok(Mutation::Skip(false)),
                ExperimentStatus::Completed => Err(Error::InvalidState {
                    id,
                    status: exp.status,
                    message: "completed experiments cannot be aborted".into(),
                }),
                _ => {
                    exp.status = ExperimentStatus::Aborted;
                    exp.abort_reason = reason.clone();
                    exp.analysis_started_at = None;
                    exp.updated_at = Utc::now();
                    Ok(Mutation::Write(true))
                }
            })
            .await?;

        if aborted_now {
            info!(%id, reason = reason.as_deref().unwrap_or(""), "experiment aborted");
        }
        Ok(experiment)
    }

    // === Queries ===

    pub async fn get(&self, id: ExperimentId) -> Result<Experiment> {
        self.registry.load(id).await
    }

    pub async fn list(&self, status: Option<ExperimentStatus>) -> Result<Vec<ExperimentSummary>> {
        self.registry.list(status).await
    }

    /// Most recent raw samples, oldest first. Empty without a sample log.
    pub async fn recent_samples(&self, id: ExperimentId, limit: usize) -> Result<Vec<Sample>> {
        self.registry.load(id).await?;
        match &self.sample_log {
            Some(log) => log.recent(id, limit).await,
            None => Ok(Vec::new()),
        }
    }

    pub fn counters(&self) -> EngineCounters {
        EngineCounters {
            samples_recorded: self.counters.samples_recorded.load(Ordering::Relaxed),
            samples_after_completion: self
                .counters
                .samples_after_completion
                .load(Ordering::Relaxed),
            experiments_completed: self.counters.experiments_completed.load(Ordering::Relaxed),
        }
    }

    // === Internals ===

    fn select(&self, experiment: &Experiment, metric: &str) -> Result<String> {
        match &self.selection_rng {
            Some(rng) => {
                let mut rng = rng
                    .lock()
                    .map_err(|_| Error::InvalidData("selection rng lock poisoned".into()))?;
                self.selector.select(experiment, metric, &mut *rng)
            }
            None => self
                .selector
                .select(experiment, metric, &mut rand::thread_rng()),
        }
    }

    fn analysis_rng(&self) -> StdRng {
        match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }

    /// Apply the winner policy to a snapshot.
    fn decide(&self, experiment: &Experiment) -> Result<Verdict> {
        let spec = experiment.require_metric(&experiment.selection_metric)?;
        let criteria = StopCriteria::for_experiment(experiment);
        let mut rng = self.analysis_rng();

        match self.config.winner_policy {
            WinnerPolicy::BestVsControl => {
                let control = experiment.require_variant(&experiment.control)?;
                let best = best_arm(experiment.treatments(), spec).ok_or_else(|| {
                    Error::InvalidData(format!("experiment {} has no treatments", experiment.id))
                })?;
                let decision = self.tester.should_stop(
                    &aggregate_of(control, spec),
                    &aggregate_of(best, spec),
                    spec.goal,
                    &criteria,
                    &mut rng,
                )?;

                let winner = match decision.winner {
                    Some(Arm::Control) if decision.stop => Some(control.name.clone()),
                    Some(Arm::Variant) if decision.stop => {
                        let leads = beats_other_treatments(experiment, best, spec)?;
                        if !leads {
                            debug!(variant = %best.name, "beat control but not every treatment");
                        }
                        leads.then(|| best.name.clone())
                    }
                    _ => None,
                };
                Ok(Verdict {
                    winner,
                    baseline: control.name.clone(),
                    challenger: best.name.clone(),
                    decision,
                })
            }
            WinnerPolicy::BestVsAll => {
                let best = best_arm(experiment.variants.iter(), spec).ok_or_else(|| {
                    Error::InvalidData(format!("experiment {} has no variants", experiment.id))
                })?;
                let best_aggregate = aggregate_of(best, spec);

                let mut weakest: Option<(String, StopDecision)> = None;
                for other in experiment.variants.iter().filter(|v| v.name != best.name) {
                    let decision = self.tester.should_stop(
                        &aggregate_of(other, spec),
                        &best_aggregate,
                        spec.goal,
                        &criteria,
                        &mut rng,
                    )?;
                    let wins = decision.stop && decision.winner == Some(Arm::Variant);
                    if !wins {
                        return Ok(Verdict {
                            winner: None,
                            baseline: other.name.clone(),
                            challenger: best.name.clone(),
                            decision: StopDecision {
                                stop: false,
                                winner: None,
                                ..decision
                            },
                        });
                    }
                    let weaker = weakest.as_ref().is_none_or(|(_, w)| {
                        decision.winner_probability() < w.winner_probability()
                    });
                    if weaker {
                        weakest = Some((other.name.clone(), decision));
                    }
                }

                let (baseline, decision) = weakest.ok_or_else(|| {
                    Error::InvalidData(format!("experiment {} has a single variant", experiment.id))
                })?;
                Ok(Verdict {
                    winner: Some(best.name.clone()),
                    baseline,
                    challenger: best.name.clone(),
                    decision,
                })
            }
        }
    }

    /// Hand an ANALYZING lease back so the next `analyze` can run at once.
    ///
    /// Failure only delays the next analysis until the lease expires.
    async fn release_lease(&self, id: ExperimentId, claimed_at: DateTime<Utc>) {
        let released = update_with_retry(self.registry.as_ref(), id, &self.retry, |exp| {
            if exp.status != ExperimentStatus::Analyzing
                || exp.analysis_started_at != Some(claimed_at)
            {
                return Ok(Mutation::Skip(()));
            }
            exp.status = ExperimentStatus::Active;
            exp.analysis_started_at = None;
            exp.updated_at = Utc::now();
            Ok(Mutation::Write(()))
        })
        .await;
        if let Err(e) = released {
            warn!(%id, error = %e, "failed to release analysis lease");
        }
    }
}

fn lease_expired(
    started_at: Option<DateTime<Utc>>,
    lease: chrono::TimeDelta,
    now: DateTime<Utc>,
) -> bool {
    started_at.is_none_or(|started| {
        started
            .checked_add_signed(lease)
            .is_some_and(|expires| expires <= now)
    })
}

fn aggregate_of(variant: &Variant, spec: &MetricSpec) -> Aggregate {
    variant
        .aggregate(&spec.name)
        .cloned()
        .unwrap_or_else(|| Aggregate::empty(spec.kind))
}

/// Best arm by raw rate or mean with respect to the goal; ties go to the
/// smallest name.
fn best_arm<'a>(
    variants: impl Iterator<Item = &'a Variant>,
    spec: &MetricSpec,
) -> Option<&'a Variant> {
    let mut best: Option<(&'a Variant, f64)> = None;
    for variant in variants {
        let score = spec.goal.orient(aggregate_of(variant, spec).point_estimate());
        best = match best {
            Some((current, current_score))
                if current_score > score
                    || (current_score == score && current.name <= variant.name) =>
            {
                Some((current, current_score))
            }
            _ => Some((variant, score)),
        };
    }
    best.map(|(variant, _)| variant)
}

/// Whether `best` has a strictly higher posterior mean than every other
/// treatment.
fn beats_other_treatments(
    experiment: &Experiment,
    best: &Variant,
    spec: &MetricSpec,
) -> Result<bool> {
    let posterior_mean = |variant: &Variant| -> Result<f64> {
        let posterior = Posterior::from_aggregate(&aggregate_of(variant, spec))?;
        Ok(spec.goal.orient(posterior.mean()))
    };
    let best_mean = posterior_mean(best)?;
    for other in experiment.treatments().filter(|v| v.name != best.name) {
        if posterior_mean(other)? >= best_mean {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{InMemoryRegistry, InMemorySampleLog};
    use async_trait::async_trait;
    use crate::types::Version;
    use std::sync::atomic::AtomicBool;

    fn config() -> EngineConfig {
        EngineConfig {
            seed: Some(7),
            monte_carlo_draws: 5_000,
            ..Default::default()
        }
    }

    fn manager_with(config: EngineConfig) -> (ExperimentManager, Arc<InMemoryRegistry>) {
        let registry = Arc::new(InMemoryRegistry::new());
        let manager = ExperimentManager::new(registry.clone(), config)
            .with_retry_policy(RetryPolicy::immediate(5))
            .with_sample_log(Arc::new(InMemorySampleLog::new(100)));
        (manager, registry)
    }

    fn manager() -> (ExperimentManager, Arc<InMemoryRegistry>) {
        manager_with(config())
    }

    fn definition(variants: &[&str]) -> CreateExperiment {
        variants
            .iter()
            .fold(CreateExperiment::new("checkout", "conversions"), |cmd, v| {
                cmd.variant(*v, VariantConfig::new())
            })
            .metric(MetricSpec::rate("conversions"))
    }

    fn conversion(id: ExperimentId, variant: &str, converted: bool) -> Sample {
        let value = if converted { 1.0 } else { 0.0 };
        Sample::new(id, variant, BTreeMap::from([("conversions".into(), value)]))
    }

    async fn record(
        manager: &ExperimentManager,
        id: ExperimentId,
        variant: &str,
        successes: u64,
        trials: u64,
    ) {
        for i in 0..trials {
            manager
                .record_sample(conversion(id, variant, i < successes))
                .await
                .unwrap();
        }
    }

    /// Write aggregates straight into the registry to skip thousands of samples.
    async fn seed_rates(registry: &InMemoryRegistry, id: ExperimentId, rates: &[(&str, u64, u64)]) {
        let mut exp = registry.load(id).await.unwrap();
        for (name, successes, trials) in rates {
            let variant = exp.variants.iter_mut().find(|v| v.name == *name).unwrap();
            variant
                .aggregates
                .insert("conversions".into(), Aggregate::rate(*successes, *trials));
            variant.samples = *trials;
        }
        exp.status = ExperimentStatus::Active;
        let version = exp.version;
        registry.save(&exp, version).await.unwrap();
    }

    #[tokio::test]
    async fn create_rejects_invalid_definition() {
        let (manager, _) = manager();
        let err = manager.create(definition(&["only"])).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn get_variant_returns_configuration() {
        let (manager, _) = manager();
        let mut config = VariantConfig::new();
        config.insert("model".into(), serde_json::json!("large"));
        let id = manager
            .create(
                CreateExperiment::new("cfg", "conversions")
                    .variant("a", config.clone())
                    .variant("b", config.clone())
                    .metric(MetricSpec::rate("conversions")),
            )
            .await
            .unwrap();

        let assignment = manager.get_variant(id, None).await.unwrap();
        assert!(["a", "b"].contains(&assignment.variant_name.as_str()));
        assert_eq!(assignment.configuration, config);
    }

    #[tokio::test]
    async fn get_variant_unknown_metric_and_experiment() {
        let (manager, _) = manager();
        let id = manager.create(definition(&["control", "treat"])).await.unwrap();

        let err = manager.get_variant(id, Some("revenue")).await.unwrap_err();
        assert!(matches!(err, Error::MetricNotFound { .. }));

        let err = manager
            .get_variant(ExperimentId::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ExperimentNotFound(_)));
    }

    #[tokio::test]
    async fn first_sample_activates_and_is_logged() {
        let (manager, _) = manager();
        let id = manager.create(definition(&["control", "treat"])).await.unwrap();

        let outcome = manager
            .record_sample(conversion(id, "treat", true))
            .await
            .unwrap();
        assert!(outcome.accepted);

        let exp = manager.get(id).await.unwrap();
        assert_eq!(exp.status, ExperimentStatus::Active);
        assert_eq!(exp.version, 2);
        assert_eq!(manager.recent_samples(id, 10).await.unwrap().len(), 1);
        assert_eq!(manager.counters().samples_recorded, 1);
    }

    #[tokio::test]
    async fn unknown_variant_and_metric_are_rejected() {
        let (manager, _) = manager();
        let id = manager.create(definition(&["control", "treat"])).await.unwrap();

        let err = manager
            .record_sample(conversion(id, "ghost", true))
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let bogus = Sample::new(id, "treat", BTreeMap::from([("revenue".into(), 3.0)]));
        let err = manager.record_sample(bogus).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        assert_eq!(manager.get(id).await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn samples_after_abort_are_dropped_and_counted() {
        let (manager, _) = manager();
        let id = manager.create(definition(&["control", "treat"])).await.unwrap();
        manager.abort(id, Some("bad idea".into())).await.unwrap();

        let outcome = manager
            .record_sample(conversion(id, "treat", true))
            .await
            .unwrap();
        assert!(!outcome.accepted);
        assert_eq!(manager.counters().samples_after_completion, 1);

        // Even an unknown variant is dropped rather than rejected
        let outcome = manager
            .record_sample(conversion(id, "ghost", true))
            .await
            .unwrap();
        assert!(!outcome.accepted);

        let exp = manager.get(id).await.unwrap();
        assert_eq!(exp.variant("treat").unwrap().samples, 0);
        assert_eq!(exp.version, 2);
    }

    #[tokio::test]
    async fn analyze_before_any_sample_is_not_active() {
        let (manager, _) = manager();
        let id = manager.create(definition(&["control", "treat"])).await.unwrap();

        let report = manager.analyze(id).await.unwrap();
        assert_eq!(report.outcome, AnalysisOutcome::NotActive);
        assert_eq!(report.status, ExperimentStatus::Created);
    }

    #[tokio::test]
    async fn analyze_gates_on_minimum_samples() {
        let (manager, _) = manager();
        let id = manager.create(definition(&["control", "treat"])).await.unwrap();
        record(&manager, id, "control", 0, 5).await;
        record(&manager, id, "treat", 5, 5).await;

        let report = manager.analyze(id).await.unwrap();
        assert_eq!(report.outcome, AnalysisOutcome::InsufficientData);
        assert_eq!(report.status, ExperimentStatus::Active);
        assert!(report.winner.is_none());
        assert_eq!(report.samples_per_variant["treat"], 5);
        assert!(manager.get(id).await.unwrap().analysis_started_at.is_none());
    }

    #[tokio::test]
    async fn analyze_completes_clear_winner() {
        let (manager, registry) = manager();
        let id = manager.create(definition(&["control", "treat"])).await.unwrap();
        seed_rates(&registry, id, &[("control", 100, 1_000), ("treat", 150, 1_000)]).await;

        let report = manager.analyze(id).await.unwrap();
        assert_eq!(report.outcome, AnalysisOutcome::Winner);
        assert_eq!(report.winner.as_deref(), Some("treat"));
        assert!(report.probability.unwrap() > 0.99);
        assert!(report.credible_interval.unwrap().contains(0.15));

        let exp = manager.get(id).await.unwrap();
        assert_eq!(exp.status, ExperimentStatus::Completed);
        assert_eq!(exp.winner_variant.as_deref(), Some("treat"));
        assert!(exp.completed_at.is_some());
        assert_eq!(manager.counters().experiments_completed, 1);
    }

    #[tokio::test]
    async fn control_can_win() {
        let (manager, registry) = manager();
        let id = manager.create(definition(&["control", "treat"])).await.unwrap();
        seed_rates(&registry, id, &[("control", 150, 1_000), ("treat", 100, 1_000)]).await;

        let report = manager.analyze(id).await.unwrap();
        assert_eq!(report.winner.as_deref(), Some("control"));
        assert!(report.probability.unwrap() > 0.99);
    }

    #[tokio::test]
    async fn seeded_analysis_is_reproducible() {
        let (manager, registry) = manager();
        let id = manager.create(definition(&["control", "treat"])).await.unwrap();
        seed_rates(&registry, id, &[("control", 40, 100), ("treat", 45, 100)]).await;

        let first = manager.analyze(id).await.unwrap();
        let second = manager.analyze(id).await.unwrap();
        assert_eq!(first.outcome, AnalysisOutcome::NoSignificantDifference);
        assert_eq!(first.probability, second.probability);
        assert_eq!(first.comparison, second.comparison);
    }

    #[tokio::test]
    async fn fresh_lease_blocks_second_analyzer() {
        let (manager, registry) = manager();
        let id = manager.create(definition(&["control", "treat"])).await.unwrap();
        seed_rates(&registry, id, &[("control", 100, 1_000), ("treat", 150, 1_000)]).await;

        let mut exp = registry.load(id).await.unwrap();
        exp.status = ExperimentStatus::Analyzing;
        exp.analysis_started_at = Some(Utc::now());
        registry.save(&exp, exp.version).await.unwrap();

        let report = manager.analyze(id).await.unwrap();
        assert_eq!(report.outcome, AnalysisOutcome::NotActive);
        assert_eq!(report.status, ExperimentStatus::Analyzing);
    }

    #[tokio::test]
    async fn stale_lease_is_reclaimed() {
        let (manager, registry) = manager();
        let id = manager.create(definition(&["control", "treat"])).await.unwrap();
        seed_rates(&registry, id, &[("control", 100, 1_000), ("treat", 150, 1_000)]).await;

        let mut exp = registry.load(id).await.unwrap();
        exp.status = ExperimentStatus::Analyzing;
        exp.analysis_started_at = Some(Utc::now() - chrono::Duration::minutes(10));
        registry.save(&exp, exp.version).await.unwrap();

        let report = manager.analyze(id).await.unwrap();
        assert_eq!(report.outcome, AnalysisOutcome::Winner);
    }

    #[tokio::test]
    async fn huge_lease_config_never_expires_and_never_panics() {
        let (manager, registry) = manager_with(EngineConfig {
            analysis_lease_secs: u64::MAX,
            ..config()
        });
        let id = manager.create(definition(&["control", "treat"])).await.unwrap();
        seed_rates(&registry, id, &[("control", 100, 1_000), ("treat", 150, 1_000)]).await;

        let report = manager.analyze(id).await.unwrap();
        assert_eq!(report.outcome, AnalysisOutcome::Winner);

        let long_ago = Utc::now() - chrono::TimeDelta::days(365 * 100);
        assert!(!lease_expired(
            Some(long_ago),
            manager.config().analysis_lease(),
            Utc::now()
        ));
    }

    #[test]
    fn lease_expiry_boundaries() {
        let now = Utc::now();
        let lease = chrono::TimeDelta::seconds(300);
        assert!(lease_expired(None, lease, now));
        assert!(lease_expired(Some(now - lease), lease, now));
        assert!(!lease_expired(Some(now - chrono::TimeDelta::seconds(299)), lease, now));
        // Overflowing the calendar means the lease outlives any clock reading
        assert!(!lease_expired(Some(now), chrono::TimeDelta::MAX, now));
    }

    /// Lets the first save through after `arm`, then conflicts the next `conflicts` saves.
    struct CommitConflictRegistry {
        inner: InMemoryRegistry,
        armed: AtomicBool,
        saves: AtomicU64,
        conflicts: u64,
    }

    impl CommitConflictRegistry {
        fn new(conflicts: u64) -> Self {
            Self {
                inner: InMemoryRegistry::new(),
                armed: AtomicBool::new(false),
                saves: AtomicU64::new(0),
                conflicts,
            }
        }

        fn arm(&self) {
            self.armed.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ExperimentRegistry for CommitConflictRegistry {
        async fn create(&self, definition: CreateExperiment) -> Result<ExperimentId> {
            self.inner.create(definition).await
        }

        async fn load(&self, id: ExperimentId) -> Result<Experiment> {
            self.inner.load(id).await
        }

        async fn save(&self, snapshot: &Experiment, expected: Version) -> Result<Version> {
            if self.armed.load(Ordering::SeqCst) {
                let n = self.saves.fetch_add(1, Ordering::SeqCst);
                if (1..=self.conflicts).contains(&n) {
                    return Err(Error::ConcurrencyConflict {
                        id: snapshot.id,
                        attempts: 1,
                    });
                }
            }
            self.inner.save(snapshot, expected).await
        }

        async fn list(&self, status: Option<ExperimentStatus>) -> Result<Vec<ExperimentSummary>> {
            self.inner.list(status).await
        }
    }

    #[tokio::test]
    async fn failed_commit_releases_lease_for_next_analysis() {
        // immediate(2) gives the commit three attempts, all of which conflict
        let registry = Arc::new(CommitConflictRegistry::new(3));
        let manager = ExperimentManager::new(registry.clone(), config())
            .with_retry_policy(RetryPolicy::immediate(2));
        let id = manager.create(definition(&["control", "treat"])).await.unwrap();
        seed_rates(
            &registry.inner,
            id,
            &[("control", 100, 1_000), ("treat", 150, 1_000)],
        )
        .await;
        registry.arm();

        let err = manager.analyze(id).await.unwrap_err();
        assert!(matches!(err, Error::ConcurrencyConflict { attempts: 3, .. }));

        let exp = manager.get(id).await.unwrap();
        assert_eq!(exp.status, ExperimentStatus::Active);
        assert!(exp.analysis_started_at.is_none());

        let report = manager.analyze(id).await.unwrap();
        assert_eq!(report.outcome, AnalysisOutcome::Winner);
        assert_eq!(report.winner.as_deref(), Some("treat"));
    }

    #[tokio::test]
    async fn samples_during_analysis_keep_status() {
        let (manager, registry) = manager();
        let id = manager.create(definition(&["control", "treat"])).await.unwrap();
        record(&manager, id, "control", 1, 2).await;

        let mut exp = registry.load(id).await.unwrap();
        exp.status = ExperimentStatus::Analyzing;
        exp.analysis_started_at = Some(Utc::now());
        registry.save(&exp, exp.version).await.unwrap();

        let outcome = manager
            .record_sample(conversion(id, "treat", true))
            .await
            .unwrap();
        assert!(outcome.accepted);
        assert_eq!(
            manager.get(id).await.unwrap().status,
            ExperimentStatus::Analyzing
        );
    }

    #[tokio::test]
    async fn best_treatment_must_beat_other_treatments() {
        let (manager, registry) = manager();
        let id = manager
            .create(definition(&["control", "a", "b"]))
            .await
            .unwrap();
        // a and b tie on raw rate; a is picked by name but does not strictly
        // beat b's posterior mean
        seed_rates(
            &registry,
            id,
            &[("control", 100, 1_000), ("a", 150, 1_000), ("b", 150, 1_000)],
        )
        .await;

        let report = manager.analyze(id).await.unwrap();
        assert_eq!(report.challenger.as_deref(), Some("a"));
        assert_eq!(report.outcome, AnalysisOutcome::NoSignificantDifference);
        assert_eq!(report.status, ExperimentStatus::Active);
    }

    #[tokio::test]
    async fn best_vs_all_requires_beating_every_arm() {
        let config = EngineConfig {
            winner_policy: WinnerPolicy::BestVsAll,
            ..config()
        };
        let (manager, registry) = manager_with(config);
        let id = manager
            .create(definition(&["control", "a", "b"]))
            .await
            .unwrap();
        seed_rates(
            &registry,
            id,
            &[("control", 100, 1_000), ("a", 200, 1_000), ("b", 190, 1_000)],
        )
        .await;

        let report = manager.analyze(id).await.unwrap();
        assert_eq!(report.outcome, AnalysisOutcome::NoSignificantDifference);
        assert_eq!(report.baseline.as_deref(), Some("b"));

        seed_rates(
            &registry,
            id,
            &[("control", 100, 1_000), ("a", 300, 1_000), ("b", 250, 1_000)],
        )
        .await;
        let report = manager.analyze(id).await.unwrap();
        assert_eq!(report.winner.as_deref(), Some("a"));
        assert_eq!(report.baseline.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn complete_is_idempotent() {
        let (manager, _) = manager();
        let id = manager.create(definition(&["control", "treat"])).await.unwrap();

        let first = manager
            .complete(id, "treat", Some("shipped".into()))
            .await
            .unwrap();
        let second = manager.complete(id, "treat", None).await.unwrap();

        assert_eq!(first.completed_at, second.completed_at);
        assert_eq!(second.version, first.version);
        assert_eq!(second.notes.as_deref(), Some("shipped"));
        assert_eq!(manager.counters().experiments_completed, 1);
    }

    #[tokio::test]
    async fn complete_rejects_conflicting_winner_and_unknown_variant() {
        let (manager, _) = manager();
        let id = manager.create(definition(&["control", "treat"])).await.unwrap();

        let err = manager.complete(id, "ghost", None).await.unwrap_err();
        assert!(matches!(err, Error::VariantNotFound { .. }));

        manager.complete(id, "treat", None).await.unwrap();
        let err = manager.complete(id, "control", None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
    }

    #[tokio::test]
    async fn abort_transitions() {
        let (manager, _) = manager();
        let id = manager.create(definition(&["control", "treat"])).await.unwrap();

        let exp = manager.abort(id, Some("stale".into())).await.unwrap();
        assert_eq!(exp.status, ExperimentStatus::Aborted);
        assert_eq!(exp.abort_reason.as_deref(), Some("stale"));
        assert!(exp.winner_variant.is_none());

        let again = manager.abort(id, None).await.unwrap();
        assert_eq!(again.version, exp.version);

        let err = manager.complete(id, "treat", None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));

        let err = manager.get_variant(id, None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
    }

    #[tokio::test]
    async fn completed_experiments_cannot_be_aborted() {
        let (manager, _) = manager();
        let id = manager.create(definition(&["control", "treat"])).await.unwrap();
        manager.complete(id, "control", None).await.unwrap();

        let err = manager.abort(id, None).await.unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidState {
                status: ExperimentStatus::Completed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn list_reports_summaries() {
        let (manager, _) = manager();
        let a = manager.create(definition(&["control", "treat"])).await.unwrap();
        manager.create(definition(&["control", "treat"])).await.unwrap();
        manager.abort(a, None).await.unwrap();

        assert_eq!(manager.list(None).await.unwrap().len(), 2);
        let aborted = manager
            .list(Some(ExperimentStatus::Aborted))
            .await
            .unwrap();
        assert_eq!(aborted.len(), 1);
        assert_eq!(aborted[0].id, a);
    }
}
