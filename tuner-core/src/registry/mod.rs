//! Persistence ports for experiments and raw samples.
//!
//! - [`ExperimentRegistry`] - one versioned document per experiment, written
//!   with optimistic compare-and-swap
//! - [`SampleLog`] - optional capped log of raw samples for debugging
//!
//! Every mutation is a read-modify-write through [`update_with_retry`]; nothing
//! writes a document without naming the version it was computed from.

mod memory;
mod retry;
mod turso;

pub use memory::{InMemoryRegistry, InMemorySampleLog};
pub use retry::RetryPolicy;
pub use turso::{TursoRegistry, TursoSampleLog};

use async_trait::async_trait;
use tracing::debug;

use crate::commands::CreateExperiment;
use crate::error::{Error, Result};
use crate::experiment::{Experiment, ExperimentStatus, ExperimentSummary, Sample};
use crate::types::{ExperimentId, Version};

/// Durable store of experiment snapshots.
#[async_trait]
pub trait ExperimentRegistry: Send + Sync {
    /// Persist a new CREATED experiment at version 1.
    async fn create(&self, definition: CreateExperiment) -> Result<ExperimentId>;

    /// Load the latest snapshot. Never waits on writers.
    async fn load(&self, id: ExperimentId) -> Result<Experiment>;

    /// Write `snapshot` if the stored version still equals `expected_version`.
    ///
    /// Returns the new version, or [`Error::ConcurrencyConflict`] when
    /// another writer got there first.
    async fn save(&self, snapshot: &Experiment, expected_version: Version) -> Result<Version>;

    /// Summaries of all experiments, newest first, optionally filtered by status.
    async fn list(&self, status: Option<ExperimentStatus>) -> Result<Vec<ExperimentSummary>>;
}

/// Append-only, size-capped record of raw samples.
///
/// Aggregates in the registry are the source of truth; this log only
/// exists for debugging and replay.
#[async_trait]
pub trait SampleLog: Send + Sync {
    async fn append(&self, sample: &Sample) -> Result<()>;

    /// Most recent samples for an experiment, oldest first.
    async fn recent(&self, id: ExperimentId, limit: usize) -> Result<Vec<Sample>>;
}

/// Outcome of applying a change to a loaded snapshot.
#[derive(Debug)]
pub enum Mutation<T> {
    /// Persist the modified snapshot, then return the value
    Write(T),
    /// Leave the stored document untouched
    Skip(T),
}

/// Reload-apply-save until the write lands or the retry budget is spent.
///
/// `apply` runs against a fresh snapshot on every attempt, so it must derive
/// its decision from the snapshot alone (status checks included). Returns
/// the snapshot as written (or as loaded, for [`Mutation::Skip`]).
pub async fn update_with_retry<T, F>(
    registry: &dyn ExperimentRegistry,
    id: ExperimentId,
    policy: &RetryPolicy,
    mut apply: F,
) -> Result<(Experiment, T)>
where
    F: FnMut(&mut Experiment) -> Result<Mutation<T>> + Send,
    T: Send,
{
    let mut retry = 0;
    loop {
        let mut snapshot = registry.load(id).await?;
        let expected = snapshot.version;

        let value = match apply(&mut snapshot)? {
            Mutation::Skip(value) => return Ok((snapshot, value)),
            Mutation::Write(value) => value,
        };

        match registry.save(&snapshot, expected).await {
            Ok(version) => {
                snapshot.version = version;
                return Ok((snapshot, value));
            }
            Err(Error::ConcurrencyConflict { .. }) => {
                retry += 1;
                let Some(delay) = policy.backoff(retry) else {
                    return Err(Error::ConcurrencyConflict {
                        id,
                        attempts: policy.max_attempts(),
                    });
                };
                debug!(%id, expected, retry, ?delay, "version conflict, retrying");
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                } else {
                    tokio::task::yield_now().await;
                }
            }
            Err(e) => return Err(e),
        }
    }
}
