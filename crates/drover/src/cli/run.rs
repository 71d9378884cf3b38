use anyhow::Result;
use clap::Parser;
use console::style;
use drover_core::config::{LogFormat, ObservabilityConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

use super::load_config;
use crate::runtime::Manager;

/// Run a manager.
#[derive(Parser)]
pub struct RunCommand {
    /// Configuration file path.
    #[arg(short, long, default_value = "drover.toml")]
    pub config: String,

    /// Enable development mode (verbose logging).
    #[arg(long)]
    pub dev: bool,
}

impl RunCommand {
    /// Execute the run command.
    pub async fn execute(self) -> Result<()> {
        let (config, found) = load_config(&self.config)?;
        init_tracing(&config.observability, self.dev);

        println!();
        println!(
            "  {} v{}",
            style("drover").bold().cyan(),
            env!("CARGO_PKG_VERSION")
        );
        println!();

        if found {
            info!("Loaded configuration from {}", self.config);
        } else {
            info!(path = %self.config, "Configuration file not found, using defaults");
        }

        println!(
            "  {} Cluster {}",
            style("*").bold(),
            style(&config.cluster.name).cyan()
        );
        println!(
            "  {} Heartbeat every {}ms (+/- {}ms)",
            style("*").bold(),
            config.dispatcher.heartbeat_period_ms,
            config.dispatcher.heartbeat_epsilon_ms
        );
        if self.dev {
            println!("  {} Development mode enabled", style("*").bold());
        }
        println!();

        let manager = Manager::new(config);
        manager.run().await.map_err(|e| anyhow::anyhow!("{}", e))?;

        println!("\n  {} Goodbye!", style("*").bold());
        Ok(())
    }
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
fn init_tracing(config: &ObservabilityConfig, dev: bool) {
    let level = if dev { "debug" } else { config.log_level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}
