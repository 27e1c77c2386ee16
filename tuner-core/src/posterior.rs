//! Posterior distributions over a variant's metric.
//!
//! Rate metrics use a Beta posterior under a uniform prior; continuous
//! metrics use a Normal approximation around the sample mean.

use rand::Rng;
use rand_distr::{Beta, Distribution, Normal};

use crate::error::{Error, Result};
use crate::experiment::Aggregate;

/// Standard deviation of the vague prior used before a continuous metric
/// has enough observations to estimate its own spread.
pub const PRIOR_SIGMA: f64 = 1e6;

/// Posterior over one variant/metric aggregate.
#[derive(Debug, Clone)]
pub enum Posterior {
    Beta { alpha: f64, beta: f64, dist: Beta<f64> },
    Normal { mean: f64, std_dev: f64, dist: Normal<f64> },
}

impl Posterior {
    /// Build the posterior for an aggregate.
    ///
    /// - rate: Beta(successes + 1, failures + 1)
    /// - continuous, n = 0: Normal(0, PRIOR_SIGMA)
    /// - continuous, n = 1: Normal(value, PRIOR_SIGMA)
    /// - continuous, n >= 2: Normal(mean, sqrt(variance / n))
    pub fn from_aggregate(aggregate: &Aggregate) -> Result<Self> {
        match aggregate {
            Aggregate::Rate { successes, trials } => {
                let successes = (*successes).min(*trials);
                let alpha = successes as f64 + 1.0;
                let beta = (*trials - successes) as f64 + 1.0;
                let dist = Beta::new(alpha, beta).map_err(|e| {
                    Error::InvalidData(format!("invalid beta posterior ({alpha}, {beta}): {e}"))
                })?;
                Ok(Self::Beta { alpha, beta, dist })
            }
            Aggregate::Continuous { count, .. } => {
                let (mean, std_dev) = match (*count, aggregate.sample_variance()) {
                    (0, _) => (0.0, PRIOR_SIGMA),
                    (n, Some(variance)) if n >= 2 => {
                        (aggregate.point_estimate(), (variance / n as f64).sqrt())
                    }
                    _ => (aggregate.point_estimate(), PRIOR_SIGMA),
                };
                Self::normal(mean, std_dev)
            }
        }
    }

    fn normal(mean: f64, std_dev: f64) -> Result<Self> {
        let dist = Normal::new(mean, std_dev).map_err(|e| {
            Error::InvalidData(format!("invalid normal posterior ({mean}, {std_dev}): {e}"))
        })?;
        Ok(Self::Normal {
            mean,
            std_dev,
            dist,
        })
    }

    /// One draw on the metric's own scale.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match self {
            Self::Beta { dist, .. } => dist.sample(rng),
            Self::Normal { dist, .. } => dist.sample(rng),
        }
    }

    /// Posterior mean.
    pub fn mean(&self) -> f64 {
        match self {
            Self::Beta { alpha, beta, .. } => alpha / (alpha + beta),
            Self::Normal { mean, .. } => *mean,
        }
    }

    /// Posterior standard deviation.
    pub fn std_dev(&self) -> f64 {
        match self {
            Self::Beta { alpha, beta, .. } => {
                let total = alpha + beta;
                (alpha * beta / (total * total * (total + 1.0))).sqrt()
            }
            Self::Normal { std_dev, .. } => *std_dev,
        }
    }
}
