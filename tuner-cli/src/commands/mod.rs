pub mod config;
pub mod experiment;

use std::path::PathBuf;

use anyhow::Result;
use serde::Serialize;

/// Global flags shared by every subcommand.
pub struct Output {
    pub db: Option<PathBuf>,
    pub json: bool,
}

impl Output {
    pub fn print_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }
}
