//! Sequential early-stopping rule.
//!
//! Decides whether two arms have accumulated enough evidence to stop:
//! both arms must reach the minimum sample count, the observed relative
//! effect must be at least `min_effect_size`, and one side must win with
//! posterior probability at least `confidence_threshold`.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::analyzer::{BayesianAnalyzer, Comparison};
use crate::error::Result;
use crate::experiment::{Aggregate, Experiment, Goal};

/// Floor on the baseline magnitude when computing relative effect.
pub const EFFECT_EPSILON: f64 = 1e-9;

/// Which side of a pairwise test won.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arm {
    Control,
    Variant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// An arm is below the minimum sample count
    InsufficientData,
    /// Observed relative effect is below the minimum worth acting on
    NegligibleEffect,
    /// Neither side reaches the confidence threshold
    NotConfident,
    /// One side wins with the required confidence
    Confident,
}

/// Thresholds for one stopping decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StopCriteria {
    pub min_samples: u64,
    pub confidence_threshold: f64,
    pub min_effect_size: f64,
}

impl StopCriteria {
    pub fn for_experiment(experiment: &Experiment) -> Self {
        Self {
            min_samples: experiment.min_samples_per_variant,
            confidence_threshold: experiment.confidence_threshold,
            min_effect_size: experiment.min_effect_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopDecision {
    pub stop: bool,
    pub winner: Option<Arm>,
    pub reason: StopReason,
    /// Posterior comparison, absent when gated on sample counts
    pub comparison: Option<Comparison>,
}

impl StopDecision {
    fn continue_with(reason: StopReason, comparison: Option<Comparison>) -> Self {
        Self {
            stop: false,
            winner: None,
            reason,
            comparison,
        }
    }

    /// Posterior probability that the winning side is better.
    pub fn winner_probability(&self) -> Option<f64> {
        let p = self.comparison.as_ref()?.probability_b_better;
        match self.winner? {
            Arm::Variant => Some(p),
            Arm::Control => Some(1.0 - p),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SequentialTester {
    analyzer: BayesianAnalyzer,
}

impl SequentialTester {
    pub fn new(analyzer: BayesianAnalyzer) -> Self {
        Self { analyzer }
    }

    /// Test `variant` against `control`.
    pub fn should_stop<R: Rng + ?Sized>(
        &self,
        control: &Aggregate,
        variant: &Aggregate,
        goal: Goal,
        criteria: &StopCriteria,
        rng: &mut R,
    ) -> Result<StopDecision> {
        if control.trials() < criteria.min_samples || variant.trials() < criteria.min_samples {
            return Ok(StopDecision::continue_with(
                StopReason::InsufficientData,
                None,
            ));
        }

        let comparison = self.analyzer.compare(control, variant, goal, rng)?;
        let p = comparison.probability_b_better;

        let baseline = control.point_estimate();
        let effect =
            (variant.point_estimate() - baseline).abs() / baseline.abs().max(EFFECT_EPSILON);
        if effect < criteria.min_effect_size {
            return Ok(StopDecision::continue_with(
                StopReason::NegligibleEffect,
                Some(comparison),
            ));
        }

        let winner = if p >= criteria.confidence_threshold {
            Arm::Variant
        } else if 1.0 - p >= criteria.confidence_threshold {
            Arm::Control
        } else {
            return Ok(StopDecision::continue_with(
                StopReason::NotConfident,
                Some(comparison),
            ));
        };

        Ok(StopDecision {
            stop: true,
            winner: Some(winner),
            reason: StopReason::Confident,
            comparison: Some(comparison),
        })
    }
}
