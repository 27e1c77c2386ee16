use crate::commands::Output;
use crate::config::ConfigLoader;
use anyhow::Result;
use clap::{Args, Subcommand};

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration (merged)
    Show,
    /// Show configuration file paths
    Path,
}

pub fn run(args: ConfigArgs, output: &Output) -> Result<()> {
    match args.command {
        ConfigCommands::Show => show_config(output),
        ConfigCommands::Path => show_paths(output),
    }
}

fn show_config(output: &Output) -> Result<()> {
    let mut config = ConfigLoader::load()?;
    if let Some(db) = &output.db {
        config.database.path = db.clone();
    }
    if output.json {
        return output.print_json(&config);
    }
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{}", toml_str);
    Ok(())
}

fn show_paths(output: &Output) -> Result<()> {
    let user = ConfigLoader::user_config_path();
    let project = ConfigLoader::project_config_path();
    let database = tuner_paths::database_path();
    if output.json {
        return output.print_json(&serde_json::json!({
            "user_config": user,
            "project_config": project,
            "default_database": database,
        }));
    }
    println!("User config:      {}", user.display());
    println!("Project config:   {}", project.display());
    println!("Default database: {}", database.display());
    Ok(())
}
