use anyhow::Result;
use clap::Parser;
use console::style;

use super::load_config;

/// Validate and print the effective configuration.
#[derive(Parser)]
pub struct ConfigCommand {
    /// Configuration file path.
    #[arg(short, long, default_value = "drover.toml")]
    pub config: String,
}

impl ConfigCommand {
    pub fn execute(self) -> Result<()> {
        let (config, found) = load_config(&self.config)?;
        config.validate()?;

        if !found {
            eprintln!(
                "{} {} not found, showing defaults",
                style("note:").yellow().bold(),
                self.config
            );
        }
        print!("{}", config.to_toml()?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_command_with_missing_file() {
        let cmd = ConfigCommand {
            config: "/nonexistent/drover.toml".to_string(),
        };
        assert!(cmd.execute().is_ok());
    }
}
