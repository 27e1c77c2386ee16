//! Adaptive experimentation engine.
//!
//! Registers experiments, routes each request to a variant by Thompson
//! sampling, folds outcome samples into per-variant aggregates and decides
//! when the evidence is strong enough to declare a winner.
//!
//! # Architecture
//!
//! - **Registry** ([`ExperimentRegistry`]) persists one versioned document per
//!   experiment; every write is an optimistic compare-and-swap
//! - **Selector** ([`VariantSelector`]) draws from each variant's posterior
//! - **Analyzer** ([`BayesianAnalyzer`]) compares two posteriors by Monte Carlo
//! - **Tester** ([`SequentialTester`]) applies the early-stopping rule
//! - **Manager** ([`ExperimentManager`]) drives the lifecycle
//!   `created -> active -> analyzing -> completed`, with `aborted` reachable
//!   from every non-terminal state

mod analyzer;
mod commands;
pub mod config;
mod error;
mod experiment;
mod manager;
mod posterior;
pub mod registry;
mod selector;
mod sequential;
mod types;

// Command types
pub use commands::{
    CreateExperiment, DEFAULT_CONFIDENCE_THRESHOLD, DEFAULT_MIN_EFFECT_SIZE,
    DEFAULT_MIN_SAMPLES_PER_VARIANT,
};

// Configuration
pub use config::{EngineConfig, ExperimentDefaults, RetryConfig, WinnerPolicy};

// Errors
pub use error::{Error, Result};

// Experiment types
pub use experiment::{
    Aggregate, Experiment, ExperimentStatus, ExperimentSummary, Goal, MetricKind, MetricSpec,
    Sample, Variant, VariantConfig, VariantDefinition,
};

// Manager
pub use manager::{
    AnalysisOutcome, AnalysisReport, EngineCounters, ExperimentManager, RecordOutcome,
    VariantAssignment,
};

// Statistics
pub use analyzer::{BayesianAnalyzer, Comparison, CredibleInterval};
pub use posterior::{PRIOR_SIGMA, Posterior};
pub use selector::VariantSelector;
pub use sequential::{Arm, SequentialTester, StopCriteria, StopDecision, StopReason};

// Registry
pub use registry::{
    ExperimentRegistry, InMemoryRegistry, InMemorySampleLog, Mutation, RetryPolicy, SampleLog,
    TursoRegistry, TursoSampleLog, update_with_retry,
};

// ID types
pub use types::{ExperimentId, Version};
