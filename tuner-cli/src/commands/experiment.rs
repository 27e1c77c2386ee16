//! Experiment commands
//!
//! Every invocation opens the experiment database, runs one engine
//! operation and prints the result as a table or JSON.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::{Args, Subcommand};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use tracing::debug;
use tuner_core::{
    Aggregate, AnalysisOutcome, AnalysisReport, CreateExperiment, EngineConfig, Experiment,
    ExperimentDefaults, ExperimentId, ExperimentManager, ExperimentStatus, MetricSpec, Sample,
    StopReason, TursoRegistry, VariantConfig, VariantDefinition,
};

use crate::commands::Output;
use crate::config::ConfigLoader;

#[derive(Args)]
pub struct ExperimentArgs {
    #[command(subcommand)]
    pub command: ExperimentCommands,
}

#[derive(Subcommand)]
pub enum ExperimentCommands {
    /// Register a new experiment
    Create(CreateArgs),
    /// Choose a variant for one request
    Variant {
        id: ExperimentId,
        /// Metric to allocate on (defaults to the selection metric)
        #[arg(long)]
        metric: Option<String>,
    },
    /// Record an outcome sample for a variant
    Record {
        id: ExperimentId,
        variant: String,
        /// Observed metric value, repeatable
        #[arg(
            long = "metric",
            value_name = "NAME=VALUE",
            value_parser = parse_metric_value,
            required = true
        )]
        metrics: Vec<(String, f64)>,
        /// Free-form metadata, repeatable; values are parsed as JSON when possible
        #[arg(long = "meta", value_name = "KEY=VALUE", value_parser = parse_metadata)]
        metadata: Vec<(String, serde_json::Value)>,
    },
    /// Run the stopping rule and declare a winner if the evidence is strong enough
    Analyze { id: ExperimentId },
    /// List experiments
    List {
        /// Only show experiments in this status
        #[arg(long)]
        status: Option<ExperimentStatus>,
    },
    /// Show one experiment with its per-variant statistics
    Show { id: ExperimentId },
    /// Show the most recent raw samples
    Samples {
        id: ExperimentId,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Declare a winner by hand
    Complete {
        id: ExperimentId,
        winner: String,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Stop an experiment without a winner
    Abort {
        id: ExperimentId,
        #[arg(long)]
        reason: Option<String>,
    },
}

#[derive(Args)]
pub struct CreateArgs {
    /// Experiment name
    pub name: String,

    /// Variant with optional JSON object configuration, repeatable
    #[arg(
        long = "variant",
        value_name = "NAME[=JSON]",
        value_parser = parse_variant,
        required = true
    )]
    pub variants: Vec<VariantDefinition>,

    /// Tracked metric, repeatable (kind: rate|continuous, goal: maximize|minimize)
    #[arg(long = "metric", value_name = "NAME[:KIND[:GOAL]]", required = true)]
    pub metrics: Vec<MetricSpec>,

    /// Metric that drives allocation and analysis (defaults to the first metric)
    #[arg(long)]
    pub selection: Option<String>,

    /// Control variant (defaults to `control`, then the first variant)
    #[arg(long)]
    pub control: Option<String>,

    #[arg(long)]
    pub description: Option<String>,

    /// Minimum samples per variant before a decision
    #[arg(long)]
    pub min_samples: Option<u64>,

    /// Posterior probability required to declare a winner
    #[arg(long)]
    pub confidence: Option<f64>,

    /// Minimum relative effect worth acting on
    #[arg(long)]
    pub min_effect: Option<f64>,
}

pub async fn run(args: ExperimentArgs, output: &Output) -> Result<()> {
    let config = ConfigLoader::load()?;
    let path = output.db.clone().unwrap_or(config.database.path);
    let defaults = config.engine.defaults.clone();
    let manager = open_manager(&path, config.engine).await?;

    match args.command {
        ExperimentCommands::Create(create) => {
            let definition = build_definition(create, &defaults)?;
            let id = manager.create(definition).await?;
            if output.json {
                output.print_json(&serde_json::json!({ "id": id }))
            } else {
                println!("{id}");
                Ok(())
            }
        }
        ExperimentCommands::Variant { id, metric } => {
            let assignment = manager.get_variant(id, metric.as_deref()).await?;
            if output.json {
                return output.print_json(&assignment);
            }
            println!("{}", assignment.variant_name);
            if !assignment.configuration.is_empty() {
                println!("{}", serde_json::to_string_pretty(&assignment.configuration)?);
            }
            Ok(())
        }
        ExperimentCommands::Record {
            id,
            variant,
            metrics,
            metadata,
        } => {
            let sample = Sample::new(id, variant, metrics.into_iter().collect())
                .with_metadata(metadata.into_iter().collect());
            let outcome = manager.record_sample(sample).await?;
            if output.json {
                output.print_json(&serde_json::json!({
                    "accepted": outcome.accepted,
                    "counters": manager.counters(),
                }))
            } else {
                if outcome.accepted {
                    println!("Sample recorded.");
                } else {
                    let dropped = manager.counters().samples_after_completion;
                    println!("Experiment {id} is finished; sample dropped ({dropped} this run).");
                }
                Ok(())
            }
        }
        ExperimentCommands::Analyze { id } => {
            let report = manager.analyze(id).await?;
            if output.json {
                output.print_json(&report)
            } else {
                print_report(&report);
                Ok(())
            }
        }
        ExperimentCommands::List { status } => {
            let summaries = manager.list(status).await?;
            if output.json {
                return output.print_json(&summaries);
            }
            if summaries.is_empty() {
                println!("No experiments found.");
                return Ok(());
            }
            let mut table = new_table(&[
                "ID", "Name", "Status", "Variants", "Samples", "Winner", "Created",
            ]);
            for summary in summaries {
                table.add_row(vec![
                    Cell::new(summary.id),
                    Cell::new(&summary.name),
                    status_cell(summary.status),
                    Cell::new(summary.variant_count),
                    Cell::new(summary.total_samples),
                    Cell::new(summary.winner_variant.as_deref().unwrap_or("-")),
                    Cell::new(format_time(summary.created_at)),
                ]);
            }
            println!("{table}");
            Ok(())
        }
        ExperimentCommands::Show { id } => {
            let experiment = manager.get(id).await?;
            if output.json {
                output.print_json(&experiment)
            } else {
                print_experiment(&experiment);
                Ok(())
            }
        }
        ExperimentCommands::Samples { id, limit } => {
            let samples = manager.recent_samples(id, limit).await?;
            if output.json {
                return output.print_json(&samples);
            }
            if samples.is_empty() {
                println!("No samples logged for {id}.");
                return Ok(());
            }
            let mut table = new_table(&["Recorded", "Variant", "Metrics", "Metadata"]);
            for sample in samples {
                table.add_row(vec![
                    Cell::new(format_time(sample.timestamp)),
                    Cell::new(&sample.variant_name),
                    Cell::new(format_pairs(&sample.metrics)),
                    Cell::new(format_pairs(&sample.metadata)),
                ]);
            }
            println!("{table}");
            Ok(())
        }
        ExperimentCommands::Complete { id, winner, notes } => {
            let experiment = manager.complete(id, &winner, notes).await?;
            if output.json {
                output.print_json(&experiment.summary())
            } else {
                println!("Experiment {id} completed with winner {winner}.");
                Ok(())
            }
        }
        ExperimentCommands::Abort { id, reason } => {
            let experiment = manager.abort(id, reason).await?;
            if output.json {
                output.print_json(&experiment.summary())
            } else {
                println!("Experiment {id} is {}.", experiment.status);
                Ok(())
            }
        }
    }
}

/// Open the libSQL database at `path`, creating parent directories as needed.
async fn open_manager(path: &Path, engine: EngineConfig) -> Result<ExperimentManager> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    debug!(path = %path.display(), "opening experiment database");
    let registry = TursoRegistry::new_local(path)
        .await
        .with_context(|| format!("failed to open database {}", path.display()))?;
    let sample_log = registry.sample_log(engine.sample_log_capacity);
    Ok(ExperimentManager::new(Arc::new(registry), engine).with_sample_log(Arc::new(sample_log)))
}

/// Turn CLI arguments into a definition, filling thresholds from config.
fn build_definition(args: CreateArgs, defaults: &ExperimentDefaults) -> Result<CreateExperiment> {
    let selection = match args.selection {
        Some(selection) => selection,
        None => match args.metrics.first() {
            Some(metric) => metric.name.clone(),
            None => bail!("at least one --metric is required"),
        },
    };

    let mut definition = CreateExperiment::new(args.name, selection)
        .min_samples_per_variant(args.min_samples.unwrap_or(defaults.min_samples_per_variant))
        .confidence_threshold(args.confidence.unwrap_or(defaults.confidence_threshold))
        .min_effect_size(args.min_effect.unwrap_or(defaults.min_effect_size));
    if let Some(description) = args.description {
        definition = definition.description(description);
    }
    if let Some(control) = args.control {
        definition = definition.control(control);
    }
    for variant in args.variants {
        definition = definition.variant(variant.name, variant.configuration);
    }
    for metric in args.metrics {
        definition = definition.metric(metric);
    }
    Ok(definition)
}

fn parse_variant(s: &str) -> Result<VariantDefinition, String> {
    let (name, json) = match s.split_once('=') {
        Some((name, json)) => (name.trim(), Some(json)),
        None => (s.trim(), None),
    };
    if name.is_empty() {
        return Err(format!("invalid variant: {s}"));
    }
    let configuration = match json {
        None => VariantConfig::new(),
        Some(json) => match serde_json::from_str(json)
            .map_err(|e| format!("invalid configuration for {name}: {e}"))?
        {
            serde_json::Value::Object(map) => map,
            _ => return Err(format!("configuration for {name} must be a JSON object")),
        },
    };
    Ok(VariantDefinition {
        name: name.to_string(),
        configuration,
    })
}

fn parse_metric_value(s: &str) -> Result<(String, f64), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got {s}"))?;
    let value: f64 = value
        .trim()
        .parse()
        .map_err(|_| format!("metric {name} is not a number: {value}"))?;
    Ok((name.trim().to_string(), value))
}

fn parse_metadata(s: &str) -> Result<(String, serde_json::Value), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got {s}"))?;
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.trim().to_string(), value))
}

fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(
        headers
            .iter()
            .map(|h| Cell::new(h).fg(Color::Cyan))
            .collect::<Vec<_>>(),
    );
    table
}

fn status_cell(status: ExperimentStatus) -> Cell {
    let color = match status {
        ExperimentStatus::Created => Color::Grey,
        ExperimentStatus::Active => Color::Green,
        ExperimentStatus::Analyzing => Color::Yellow,
        ExperimentStatus::Completed => Color::Blue,
        ExperimentStatus::Aborted => Color::Red,
    };
    Cell::new(status).fg(color)
}

fn print_experiment(experiment: &Experiment) {
    println!("Experiment: {} ({})", experiment.name, experiment.id);
    if !experiment.description.is_empty() {
        println!("            {}", experiment.description);
    }
    println!("Status:     {}", experiment.status);
    println!("Control:    {}", experiment.control);
    println!("Selection:  {}", experiment.selection_metric);
    println!(
        "Stopping:   min {} samples, confidence {}, min effect {}",
        experiment.min_samples_per_variant,
        experiment.confidence_threshold,
        experiment.min_effect_size
    );
    if let Some(winner) = &experiment.winner_variant {
        println!("Winner:     {winner}");
    }
    if let Some(notes) = &experiment.notes {
        println!("Notes:      {notes}");
    }
    if let Some(reason) = &experiment.abort_reason {
        println!("Aborted:    {reason}");
    }
    println!("Version:    {}", experiment.version);
    println!();

    let mut headers = vec!["Variant".to_string(), "Samples".to_string()];
    headers.extend(
        experiment
            .metrics
            .iter()
            .map(|m| format!("{} ({}, {})", m.name, m.kind.as_str(), m.goal.as_str())),
    );
    let mut table = new_table(&headers.iter().map(String::as_str).collect::<Vec<_>>());
    for variant in &experiment.variants {
        let mut row = vec![Cell::new(&variant.name), Cell::new(variant.samples)];
        row.extend(experiment.metrics.iter().map(|m| {
            Cell::new(
                variant
                    .aggregate(&m.name)
                    .map(format_aggregate)
                    .unwrap_or_else(|| "-".to_string()),
            )
        }));
        table.add_row(row);
    }
    println!("{table}");
}

fn print_report(report: &AnalysisReport) {
    println!("Experiment: {}", report.experiment_id);
    println!("Status:     {}", report.status);
    println!("Outcome:    {}", outcome_label(report.outcome));
    if let Some(challenger) = &report.challenger {
        let verdict = match (&report.winner, &report.baseline) {
            (Some(winner), Some(baseline)) => format!("{winner} beats {baseline}"),
            (None, Some(baseline)) => format!("{challenger} vs {baseline}"),
            _ => challenger.clone(),
        };
        println!("Compared:   {verdict}");
    }
    if let Some(probability) = report.probability {
        println!("P(better):  {probability:.4}");
    }
    if let Some(interval) = &report.credible_interval {
        println!(
            "95% CI:     [{:.4}, {:.4}] (width {:.4})",
            interval.lower,
            interval.upper,
            interval.width()
        );
    }
    if let Some(reason) = report.reason {
        println!("Reason:     {}", reason_label(reason));
    }
    println!("Samples:    {}", format_pairs(&report.samples_per_variant));
}

fn outcome_label(outcome: AnalysisOutcome) -> &'static str {
    match outcome {
        AnalysisOutcome::Winner => "winner declared",
        AnalysisOutcome::InsufficientData => "insufficient data",
        AnalysisOutcome::NoSignificantDifference => "no significant difference",
        AnalysisOutcome::NotActive => "not active",
    }
}

fn reason_label(reason: StopReason) -> &'static str {
    match reason {
        StopReason::InsufficientData => "below minimum samples",
        StopReason::NegligibleEffect => "effect below minimum",
        StopReason::NotConfident => "confidence not reached",
        StopReason::Confident => "confident",
    }
}

fn format_aggregate(aggregate: &Aggregate) -> String {
    if aggregate.trials() == 0 {
        return "-".to_string();
    }
    match aggregate {
        Aggregate::Rate { successes, trials } => {
            format!("{:.3} ({successes}/{trials})", aggregate.point_estimate())
        }
        Aggregate::Continuous { count, .. } => {
            format!("{:.3} (n={count})", aggregate.point_estimate())
        }
    }
}

fn format_pairs<V: std::fmt::Display>(pairs: &BTreeMap<String, V>) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn format_time(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%d %H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tuner_core::{Goal, MetricKind};

    fn create_args() -> CreateArgs {
        CreateArgs {
            name: "prompt-style".to_string(),
            variants: vec![
                parse_variant("control").unwrap(),
                parse_variant(r#"concise={"prompt":"be brief"}"#).unwrap(),
            ],
            metrics: vec![
                "accepted".parse().unwrap(),
                "tokens:continuous:minimize".parse().unwrap(),
            ],
            selection: None,
            control: None,
            description: None,
            min_samples: None,
            confidence: Some(0.9),
            min_effect: None,
        }
    }

    #[test]
    fn parse_variant_without_configuration() {
        let variant = parse_variant("control").unwrap();
        assert_eq!(variant.name, "control");
        assert!(variant.configuration.is_empty());
    }

    #[test]
    fn parse_variant_with_json_object() {
        let variant = parse_variant(r#"fast={"model":"small","temperature":0.2}"#).unwrap();
        assert_eq!(variant.name, "fast");
        assert_eq!(variant.configuration["model"], "small");
        assert_eq!(variant.configuration["temperature"], 0.2);
    }

    #[test]
    fn parse_variant_rejects_non_object_configuration() {
        assert!(parse_variant("fast=[1,2]").is_err());
        assert!(parse_variant("fast={not json").is_err());
        assert!(parse_variant("=1").is_err());
    }

    #[test]
    fn parse_metric_value_reads_numbers() {
        assert_eq!(
            parse_metric_value("latency_ms=12.5").unwrap(),
            ("latency_ms".to_string(), 12.5)
        );
        assert!(parse_metric_value("latency_ms").is_err());
        assert!(parse_metric_value("latency_ms=fast").is_err());
    }

    #[test]
    fn parse_metadata_falls_back_to_string() {
        assert_eq!(
            parse_metadata("retries=3").unwrap(),
            ("retries".to_string(), serde_json::json!(3))
        );
        assert_eq!(
            parse_metadata("user=alice").unwrap(),
            ("user".to_string(), serde_json::json!("alice"))
        );
    }

    #[test]
    fn build_definition_applies_config_defaults() {
        let defaults = ExperimentDefaults {
            min_samples_per_variant: 42,
            confidence_threshold: 0.99,
            min_effect_size: 0.1,
        };

        let definition = build_definition(create_args(), &defaults).unwrap();

        assert_eq!(definition.selection_metric, "accepted");
        assert_eq!(definition.min_samples_per_variant, 42);
        // Explicit flag wins over the configured default
        assert_eq!(definition.confidence_threshold, 0.9);
        assert_eq!(definition.min_effect_size, 0.1);
        assert_eq!(definition.variants.len(), 2);
        assert_eq!(definition.metrics[1].kind, MetricKind::Continuous);
        assert_eq!(definition.metrics[1].goal, Goal::Minimize);
        assert!(definition.validate().is_ok());
    }

    #[test]
    fn format_aggregate_shows_estimate_and_counts() {
        assert_eq!(format_aggregate(&Aggregate::rate(40, 50)), "0.800 (40/50)");
        assert_eq!(
            format_aggregate(&Aggregate::from_values(&[1.0, 2.0, 3.0])),
            "2.000 (n=3)"
        );
        assert_eq!(format_aggregate(&Aggregate::rate(0, 0)), "-");
    }

    #[tokio::test]
    async fn open_manager_creates_database_directories() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("experiments.db");

        let manager = open_manager(&path, EngineConfig::default()).await.unwrap();
        let definition =
            build_definition(create_args(), &ExperimentDefaults::default()).unwrap();
        let id = manager.create(definition).await.unwrap();

        assert!(path.exists());
        let experiment = manager.get(id).await.unwrap();
        assert_eq!(experiment.status, ExperimentStatus::Created);
        assert_eq!(experiment.control, "control");
    }
}
