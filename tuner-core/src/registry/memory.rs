//! In-process registry and sample log.
//!
//! Used by tests and by embedders that do not need durability. Same
//! compare-and-swap contract as the libSQL backend.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;

use super::{ExperimentRegistry, SampleLog};
use crate::commands::CreateExperiment;
use crate::error::{Error, Result};
use crate::experiment::{Experiment, ExperimentStatus, ExperimentSummary, Sample};
use crate::types::{ExperimentId, Version};

#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    experiments: RwLock<HashMap<ExperimentId, Experiment>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> Error {
        Error::InvalidData("registry lock poisoned".into())
    }
}

#[async_trait]
impl ExperimentRegistry for InMemoryRegistry {
    async fn create(&self, definition: CreateExperiment) -> Result<ExperimentId> {
        definition.validate()?;
        let id = ExperimentId::new();
        let mut experiment = Experiment::from_definition(id, definition);
        experiment.version = 1;

        let mut experiments = self.experiments.write().map_err(|_| Self::poisoned())?;
        experiments.insert(id, experiment);
        Ok(id)
    }

    async fn load(&self, id: ExperimentId) -> Result<Experiment> {
        let experiments = self.experiments.read().map_err(|_| Self::poisoned())?;
        experiments
            .get(&id)
            .cloned()
            .ok_or(Error::ExperimentNotFound(id))
    }

    async fn save(&self, snapshot: &Experiment, expected_version: Version) -> Result<Version> {
        let mut experiments = self.experiments.write().map_err(|_| Self::poisoned())?;
        let stored = experiments
            .get_mut(&snapshot.id)
            .ok_or(Error::ExperimentNotFound(snapshot.id))?;
        if stored.version != expected_version {
            return Err(Error::ConcurrencyConflict {
                id: snapshot.id,
                attempts: 1,
            });
        }

        let version = expected_version + 1;
        *stored = snapshot.clone();
        stored.version = version;
        Ok(version)
    }

    async fn list(&self, status: Option<ExperimentStatus>) -> Result<Vec<ExperimentSummary>> {
        let experiments = self.experiments.read().map_err(|_| Self::poisoned())?;
        let mut summaries: Vec<_> = experiments
            .values()
            .filter(|e| status.is_none_or(|s| e.status == s))
            .map(Experiment::summary)
            .collect();
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(summaries)
    }
}

/// Ring buffer of recent samples per experiment.
#[derive(Debug)]
pub struct InMemorySampleLog {
    capacity: usize,
    samples: Mutex<HashMap<ExperimentId, VecDeque<Sample>>>,
}

impl InMemorySampleLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            samples: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl SampleLog for InMemorySampleLog {
    async fn append(&self, sample: &Sample) -> Result<()> {
        if self.capacity == 0 {
            return Ok(());
        }
        let mut samples = self
            .samples
            .lock()
            .map_err(|_| Error::InvalidData("sample log lock poisoned".into()))?;
        let entries = samples.entry(sample.experiment_id).or_default();
        entries.push_back(sample.clone());
        while entries.len() > self.capacity {
            entries.pop_front();
        }
        Ok(())
    }

    async fn recent(&self, id: ExperimentId, limit: usize) -> Result<Vec<Sample>> {
        let samples = self
            .samples
            .lock()
            .map_err(|_| Error::InvalidData("sample log lock poisoned".into()))?;
        let Some(entries) = samples.get(&id) else {
            return Ok(Vec::new());
        };
        let skip = entries.len().saturating_sub(limit);
        Ok(entries.iter().skip(skip).cloned().collect())
    }
}
