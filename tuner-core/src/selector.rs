//! Thompson sampling over variant posteriors.
//!
//! Draws one value from each variant's posterior for the selection metric
//! and routes the request to the highest draw. Variants without data draw
//! from a flat prior, so every arm keeps getting explored.

use std::collections::BTreeMap;

use rand::Rng;

use crate::error::{Error, Result};
use crate::experiment::{Aggregate, Experiment, MetricSpec};
use crate::posterior::Posterior;

/// Read-only variant chooser. Never writes to the registry.
#[derive(Debug, Clone, Copy, Default)]
pub struct VariantSelector;

impl VariantSelector {
    pub fn new() -> Self {
        Self
    }

    /// Pick a variant for one request.
    ///
    /// Exact ties go to the lexicographically smallest variant name.
    pub fn select<R: Rng + ?Sized>(
        &self,
        experiment: &Experiment,
        metric: &str,
        rng: &mut R,
    ) -> Result<String> {
        let posteriors = Self::posteriors(experiment, metric)?;
        Self::draw_winner(&posteriors, rng)
            .map(str::to_string)
            .ok_or_else(|| {
                Error::InvalidData(format!("experiment {} has no variants", experiment.id))
            })
    }

    /// Estimated allocation share of each variant over `draws` selections.
    pub fn allocation<R: Rng + ?Sized>(
        &self,
        experiment: &Experiment,
        metric: &str,
        draws: usize,
        rng: &mut R,
    ) -> Result<BTreeMap<String, f64>> {
        let posteriors = Self::posteriors(experiment, metric)?;
        let mut wins: BTreeMap<String, u64> = posteriors
            .iter()
            .map(|(name, _, _)| (name.to_string(), 0))
            .collect();
        for _ in 0..draws {
            if let Some(name) = Self::draw_winner(&posteriors, rng)
                && let Some(count) = wins.get_mut(name)
            {
                *count += 1;
            }
        }
        let total = draws.max(1) as f64;
        Ok(wins
            .into_iter()
            .map(|(name, count)| (name, count as f64 / total))
            .collect())
    }

    fn posteriors<'a>(
        experiment: &'a Experiment,
        metric: &str,
    ) -> Result<Vec<(&'a str, &'a MetricSpec, Posterior)>> {
        let spec = experiment.require_metric(metric)?;
        experiment
            .variants
            .iter()
            .map(|variant| {
                let posterior = match variant.aggregate(metric) {
                    Some(aggregate) => Posterior::from_aggregate(aggregate)?,
                    None => Posterior::from_aggregate(&Aggregate::empty(spec.kind))?,
                };
                Ok((variant.name.as_str(), spec, posterior))
            })
            .collect()
    }

    fn draw_winner<'a, R: Rng + ?Sized>(
        posteriors: &[(&'a str, &MetricSpec, Posterior)],
        rng: &mut R,
    ) -> Option<&'a str> {
        let mut best: Option<(&'a str, f64)> = None;
        for (name, spec, posterior) in posteriors {
            let theta = spec.goal.orient(posterior.sample(rng));
            best = match best {
                Some((best_name, best_theta))
                    if best_theta > theta || (best_theta == theta && best_name <= *name) =>
                {
                    Some((best_name, best_theta))
                }
                _ => Some((*name, theta)),
            };
        }
        best.map(|(name, _)| name)
    }
}
