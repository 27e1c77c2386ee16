//! Turso/libSQL implementation of the experiment registry.
//!
//! Each experiment is one row: the full snapshot as a JSON document next to
//! the columns needed for listing and for compare-and-swap. It can connect to:
//! - Remote Turso database (cloud)
//! - Local embedded SQLite file

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Builder, Connection, Database};
use tracing::{debug, instrument};

use super::{ExperimentRegistry, SampleLog};
use crate::commands::CreateExperiment;
use crate::error::{Error, Result};
use crate::experiment::{Experiment, ExperimentStatus, ExperimentSummary, Sample};
use crate::types::{ExperimentId, Version};

/// SQL schema for the experiments table.
const SCHEMA_EXPERIMENTS: &str = r#"
CREATE TABLE IF NOT EXISTS experiments (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    status TEXT NOT NULL,
    version INTEGER NOT NULL,
    document TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
)
"#;

const INDEX_EXPERIMENTS_STATUS: &str = r#"
CREATE INDEX IF NOT EXISTS idx_experiments_status
ON experiments(status, created_at)
"#;

/// SQL schema for the raw sample log.
const SCHEMA_SAMPLES: &str = r#"
CREATE TABLE IF NOT EXISTS samples (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    experiment_id TEXT NOT NULL,
    variant_name TEXT NOT NULL,
    recorded_at TEXT NOT NULL,
    payload TEXT NOT NULL
)
"#;

const INDEX_SAMPLES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_samples_experiment_seq
ON samples(experiment_id, seq)
"#;

/// How long a local writer waits on a locked database file.
const BUSY_TIMEOUT_MS: u32 = 5_000;

/// Turso-backed experiment registry.
///
/// All calls share one connection, so an in-memory database stays a single
/// database for the registry's lifetime.
#[derive(Clone)]
pub struct TursoRegistry {
    _db: Arc<Database>,
    conn: Connection,
}

impl TursoRegistry {
    /// Open (or create) a local embedded database file.
    pub async fn new_local(path: &Path) -> Result<Self> {
        let db = Builder::new_local(path).build().await?;
        let registry = Self::open(db).await?;
        registry
            .conn
            .query(&format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}"), ())
            .await?;
        Ok(registry)
    }

    /// Connect to a remote Turso database.
    pub async fn new_remote(url: &str, token: &str) -> Result<Self> {
        let db = Builder::new_remote(url.to_string(), token.to_string())
            .build()
            .await?;
        Self::open(db).await
    }

    /// Create an in-memory registry (for testing).
    pub async fn new_memory() -> Result<Self> {
        let db = Builder::new_local(":memory:").build().await?;
        Self::open(db).await
    }

    async fn open(db: Database) -> Result<Self> {
        let conn = db.connect()?;
        let registry = Self {
            _db: Arc::new(db),
            conn,
        };
        registry.ensure_schema().await?;
        Ok(registry)
    }

    /// Sample log stored in the same database.
    pub fn sample_log(&self, capacity: usize) -> TursoSampleLog {
        TursoSampleLog {
            conn: self.conn.clone(),
            capacity,
        }
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.conn.execute(SCHEMA_EXPERIMENTS, ()).await?;
        self.conn.execute(INDEX_EXPERIMENTS_STATUS, ()).await?;
        self.conn.execute(SCHEMA_SAMPLES, ()).await?;
        self.conn.execute(INDEX_SAMPLES, ()).await?;
        Ok(())
    }

    async fn exists(&self, id: ExperimentId) -> Result<bool> {
        let mut rows = self
            .conn
            .query("SELECT 1 FROM experiments WHERE id = ?", [id.to_string()])
            .await?;
        Ok(rows.next().await?.is_some())
    }

    /// Parse a snapshot from a `(version, document)` row.
    fn parse_experiment(row: &libsql::Row) -> Result<Experiment> {
        let version: i64 = row.get(0)?;
        let document: String = row.get(1)?;
        let mut experiment: Experiment = serde_json::from_str(&document)?;
        experiment.version = u64::try_from(version)
            .map_err(|_| Error::InvalidData(format!("invalid version: {version}")))?;
        Ok(experiment)
    }
}

#[async_trait]
impl ExperimentRegistry for TursoRegistry {
    #[instrument(skip(self, definition), level = "debug", fields(name = %definition.name))]
    async fn create(&self, definition: CreateExperiment) -> Result<ExperimentId> {
        definition.validate()?;
        let id = ExperimentId::new();
        let mut experiment = Experiment::from_definition(id, definition);
        experiment.version = 1;

        let document = serde_json::to_string(&experiment)?;
        self.conn
            .execute(
                "INSERT INTO experiments
                 (id, name, status, version, document, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                libsql::params![
                    id.to_string(),
                    experiment.name.clone(),
                    experiment.status.as_str(),
                    1i64,
                    document,
                    format_datetime(experiment.created_at),
                    format_datetime(experiment.updated_at)
                ],
            )
            .await?;
        debug!(%id, "experiment row inserted");
        Ok(id)
    }

    #[instrument(skip(self), level = "debug")]
    async fn load(&self, id: ExperimentId) -> Result<Experiment> {
        let mut rows = self
            .conn
            .query(
                "SELECT version, document FROM experiments WHERE id = ?",
                [id.to_string()],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Self::parse_experiment(&row),
            None => Err(Error::ExperimentNotFound(id)),
        }
    }

    #[instrument(skip(self, snapshot), level = "debug", fields(id = %snapshot.id))]
    async fn save(&self, snapshot: &Experiment, expected_version: Version) -> Result<Version> {
        let version = expected_version + 1;
        let mut stored = snapshot.clone();
        stored.version = version;
        let document = serde_json::to_string(&stored)?;

        let changed = self
            .conn
            .execute(
                "UPDATE experiments
                 SET name = ?, status = ?, version = ?, document = ?, updated_at = ?
                 WHERE id = ? AND version = ?",
                libsql::params![
                    stored.name.clone(),
                    stored.status.as_str(),
                    to_i64(version)?,
                    document,
                    format_datetime(stored.updated_at),
                    snapshot.id.to_string(),
                    to_i64(expected_version)?
                ],
            )
            .await?;

        if changed == 1 {
            return Ok(version);
        }
        if self.exists(snapshot.id).await? {
            debug!(expected_version, "stale version rejected");
            Err(Error::ConcurrencyConflict {
                id: snapshot.id,
                attempts: 1,
            })
        } else {
            Err(Error::ExperimentNotFound(snapshot.id))
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn list(&self, status: Option<ExperimentStatus>) -> Result<Vec<ExperimentSummary>> {
        let mut rows = match status {
            Some(status) => {
                self.conn
                    .query(
                        "SELECT version, document FROM experiments WHERE status = ?
                         ORDER BY created_at DESC, id DESC",
                        [status.as_str()],
                    )
                    .await?
            }
            None => {
                self.conn
                    .query(
                        "SELECT version, document FROM experiments
                         ORDER BY created_at DESC, id DESC",
                        (),
                    )
                    .await?
            }
        };

        let mut summaries = Vec::new();
        while let Some(row) = rows.next().await? {
            summaries.push(Self::parse_experiment(&row)?.summary());
        }
        Ok(summaries)
    }
}

/// Capped sample log sharing the registry's database.
#[derive(Clone)]
pub struct TursoSampleLog {
    conn: Connection,
    capacity: usize,
}

#[async_trait]
impl SampleLog for TursoSampleLog {
    #[instrument(skip(self, sample), level = "debug", fields(id = %sample.experiment_id))]
    async fn append(&self, sample: &Sample) -> Result<()> {
        if self.capacity == 0 {
            return Ok(());
        }
        let id = sample.experiment_id.to_string();
        let payload = serde_json::to_string(sample)?;
        self.conn
            .execute(
                "INSERT INTO samples (experiment_id, variant_name, recorded_at, payload)
                 VALUES (?, ?, ?, ?)",
                libsql::params![
                    id.clone(),
                    sample.variant_name.clone(),
                    format_datetime(sample.timestamp),
                    payload
                ],
            )
            .await?;
        self.conn
            .execute(
                "DELETE FROM samples WHERE experiment_id = ? AND seq NOT IN
                 (SELECT seq FROM samples WHERE experiment_id = ?
                  ORDER BY seq DESC LIMIT ?)",
                libsql::params![id.clone(), id, to_i64(self.capacity as u64)?],
            )
            .await?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn recent(&self, id: ExperimentId, limit: usize) -> Result<Vec<Sample>> {
        let mut rows = self
            .conn
            .query(
                "SELECT payload FROM
                 (SELECT seq, payload FROM samples WHERE experiment_id = ?
                  ORDER BY seq DESC LIMIT ?)
                 ORDER BY seq ASC",
                libsql::params![id.to_string(), to_i64(limit as u64)?],
            )
            .await?;

        let mut samples = Vec::new();
        while let Some(row) = rows.next().await? {
            let payload: String = row.get(0)?;
            samples.push(serde_json::from_str(&payload)?);
        }
        Ok(samples)
    }
}

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| Error::InvalidData(format!("value out of range: {value}")))
}

/// Format a datetime for storage.
fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}
