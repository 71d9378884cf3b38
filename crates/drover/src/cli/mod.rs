mod config;
mod run;

pub use config::ConfigCommand;
pub use run::RunCommand;

use std::path::Path;

use anyhow::Result;
use clap::{Parser, Subcommand};
use drover_core::config::DroverConfig;

/// drover - cluster control plane
#[derive(Parser)]
#[command(name = "drover")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// CLI commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Run a manager.
    Run(RunCommand),

    /// Validate and print the effective configuration.
    Config(ConfigCommand),
}

impl Cli {
    /// Execute the CLI command.
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run(cmd) => cmd.execute().await,
            Commands::Config(cmd) => cmd.execute(),
        }
    }
}

/// Load the config file, or the defaults when it does not exist.
fn load_config(path: &str) -> Result<(DroverConfig, bool)> {
    if !Path::new(path).exists() {
        return Ok((DroverConfig::default(), false));
    }
    let config = DroverConfig::from_file(path)?;
    Ok((config, true))
}
