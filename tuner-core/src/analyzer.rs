//! Monte Carlo comparison of two variant posteriors.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_MONTE_CARLO_DRAWS;
use crate::error::{Error, Result};
use crate::experiment::{Aggregate, Goal};
use crate::posterior::Posterior;

/// Central 95% interval taken from the empirical quantiles of the draws.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CredibleInterval {
    pub lower: f64,
    pub upper: f64,
}

impl CredibleInterval {
    pub fn contains(&self, value: f64) -> bool {
        self.lower <= value && value <= self.upper
    }

    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }
}

/// Result of comparing arm A (baseline) against arm B.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    /// Fraction of paired draws where B beat A, with respect to the goal
    pub probability_b_better: f64,
    pub credible_interval_a: CredibleInterval,
    pub credible_interval_b: CredibleInterval,
    pub posterior_mean_a: f64,
    pub posterior_mean_b: f64,
}

/// Posterior comparison by paired Monte Carlo draws.
#[derive(Debug, Clone, Copy)]
pub struct BayesianAnalyzer {
    draws: usize,
}

impl Default for BayesianAnalyzer {
    fn default() -> Self {
        Self::new(DEFAULT_MONTE_CARLO_DRAWS)
    }
}

impl BayesianAnalyzer {
    pub fn new(draws: usize) -> Self {
        Self {
            draws: draws.max(1),
        }
    }

    /// Compare two aggregates of the same metric kind.
    pub fn compare<R: Rng + ?Sized>(
        &self,
        a: &Aggregate,
        b: &Aggregate,
        goal: Goal,
        rng: &mut R,
    ) -> Result<Comparison> {
        if a.kind() != b.kind() {
            return Err(Error::InvalidData(format!(
                "cannot compare a {} aggregate with a {} aggregate",
                a.kind().as_str(),
                b.kind().as_str()
            )));
        }
        let posterior_a = Posterior::from_aggregate(a)?;
        let posterior_b = Posterior::from_aggregate(b)?;

        let mut draws_a = Vec::with_capacity(self.draws);
        let mut draws_b = Vec::with_capacity(self.draws);
        let mut b_better = 0usize;
        for _ in 0..self.draws {
            let theta_a = posterior_a.sample(rng);
            let theta_b = posterior_b.sample(rng);
            if goal.orient(theta_b) > goal.orient(theta_a) {
                b_better += 1;
            }
            draws_a.push(theta_a);
            draws_b.push(theta_b);
        }

        Ok(Comparison {
            probability_b_better: b_better as f64 / self.draws as f64,
            credible_interval_a: credible_interval(&mut draws_a),
            credible_interval_b: credible_interval(&mut draws_b),
            posterior_mean_a: posterior_a.mean(),
            posterior_mean_b: posterior_b.mean(),
        })
    }
}

fn credible_interval(draws: &mut [f64]) -> CredibleInterval {
    draws.sort_by(f64::total_cmp);
    CredibleInterval {
        lower: quantile(draws, 0.025),
        upper: quantile(draws, 0.975),
    }
}

/// Nearest-rank quantile of sorted, non-empty draws.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let last = sorted.len().saturating_sub(1);
    let index = ((last as f64) * q).round() as usize;
    sorted.get(index.min(last)).copied().unwrap_or(f64::NAN)
}
