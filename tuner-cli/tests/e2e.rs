//! End-to-end tests that drive the `tuner` binary.
//!
//! Gated behind the `integration` feature flag. Run with:
//!
//! ```sh
//! cargo test -p tuner-cli --features integration
//! ```

#![cfg(feature = "integration")]

use std::path::Path;
use std::process::{Command, Output};

use tempfile::TempDir;

/// Run `tuner` with an isolated config and database under `home`.
fn tuner(home: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_tuner"))
        .arg("--db")
        .arg(home.join("experiments.db"))
        .args(args)
        .env("XDG_CONFIG_HOME", home.join("config"))
        .env("XDG_DATA_HOME", home.join("data"))
        .env("TUNER_PROJECT_CONFIG_DIR", home.join("project"))
        .output()
        .expect("Failed to run tuner")
}

fn stdout(output: &Output) -> String {
    assert!(
        output.status.success(),
        "tuner failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

#[test]
fn tuner_help_lists_commands() {
    let home = TempDir::new().unwrap();
    let out = stdout(&tuner(home.path(), &["--help"]));

    assert!(out.contains("Adaptive experiments"));
    assert!(out.contains("experiment"));
    assert!(out.contains("config"));
}

#[test]
fn tuner_config_show_prints_defaults() {
    let home = TempDir::new().unwrap();
    let out = stdout(&tuner(home.path(), &["config", "show"]));

    assert!(out.contains("[database]"));
    assert!(out.contains("[engine]"));
    assert!(out.contains("monte_carlo_draws = 20000"));
}

#[test]
fn tuner_config_show_reads_project_config() {
    let home = TempDir::new().unwrap();
    std::fs::create_dir_all(home.path().join("project")).unwrap();
    std::fs::write(
        home.path().join("project/config.toml"),
        "[engine]\nwinner_policy = \"best_vs_all\"\n",
    )
    .unwrap();

    let out = stdout(&tuner(home.path(), &["config", "show"]));

    assert!(out.contains("winner_policy = \"best_vs_all\""));
}

#[test]
fn tuner_experiment_lifecycle() {
    let home = TempDir::new().unwrap();
    let id = stdout(&tuner(
        home.path(),
        &[
            "experiment",
            "create",
            "signup",
            "--variant",
            "control",
            "--variant",
            r#"treat={"copy":"short"}"#,
            "--metric",
            "converted",
            "--min-samples",
            "5",
        ],
    ));

    let variant = stdout(&tuner(home.path(), &["experiment", "variant", &id]));
    assert!(variant.starts_with("control") || variant.starts_with("treat"));

    for (name, converted) in [("control", "0"), ("treat", "1")] {
        for _ in 0..8 {
            stdout(&tuner(
                home.path(),
                &[
                    "experiment",
                    "record",
                    &id,
                    name,
                    "--metric",
                    &format!("converted={converted}"),
                ],
            ));
        }
    }

    let report = stdout(&tuner(home.path(), &["--json", "experiment", "analyze", &id]));
    let report: serde_json::Value = serde_json::from_str(&report).unwrap();
    assert_eq!(report["outcome"], "winner");
    assert_eq!(report["winner"], "treat");

    let late = stdout(&tuner(
        home.path(),
        &["experiment", "record", &id, "control", "--metric", "converted=1"],
    ));
    assert!(late.contains("sample dropped"));

    let late = tuner(
        home.path(),
        &[
            "--json",
            "experiment",
            "record",
            &id,
            "treat",
            "--metric",
            "converted=0",
        ],
    );
    let logged = String::from_utf8_lossy(&late.stderr).to_string();
    assert!(logged.contains("sample dropped for finished experiment"));
    let late: serde_json::Value = serde_json::from_str(&stdout(&late)).unwrap();
    assert_eq!(late["accepted"], false);
    assert_eq!(late["counters"]["samples_after_completion"], 1);
    assert_eq!(late["counters"]["samples_recorded"], 0);

    let listed = stdout(&tuner(
        home.path(),
        &["experiment", "list", "--status", "completed"],
    ));
    assert!(listed.contains("signup"));
}

#[test]
fn tuner_abort_rejects_unknown_experiment() {
    let home = TempDir::new().unwrap();
    let output = tuner(
        home.path(),
        &["experiment", "abort", "0190b0a4-0000-7000-8000-000000000000"],
    );

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("not found"));
}
