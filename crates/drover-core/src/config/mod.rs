mod cluster;
mod dispatcher;
mod observability;
mod orchestrator;

pub use cluster::ClusterConfig;
pub use dispatcher::DispatcherConfig;
pub use observability::{LogFormat, ObservabilityConfig};
pub use orchestrator::OrchestratorConfig;

use once_cell::sync::Lazy;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{DroverError, Result};

static ENV_VAR_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("env var pattern is valid")
});

/// Root configuration for drover.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DroverConfig {
    /// Cluster configuration.
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Dispatcher configuration.
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Orchestrator configuration.
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl DroverConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| DroverError::Config(format!("Failed to read config file: {}", e)))?;

        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse_toml(content: &str) -> Result<Self> {
        // Substitute environment variables
        let content = substitute_env_vars(content);

        let config: Self = toml::from_str(&content)
            .map_err(|e| DroverError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| DroverError::Config(format!("Failed to render config: {}", e)))
    }

    /// Check cross-field invariants.
    pub fn validate(&self) -> Result<()> {
        let dispatcher = &self.dispatcher;
        if dispatcher.heartbeat_period_ms == 0 {
            return Err(DroverError::Config(
                "dispatcher.heartbeat_period_ms must be positive".to_string(),
            ));
        }
        if dispatcher.heartbeat_epsilon_ms >= dispatcher.heartbeat_period_ms {
            return Err(DroverError::Config(format!(
                "dispatcher.heartbeat_epsilon_ms ({}) must be smaller than heartbeat_period_ms ({})",
                dispatcher.heartbeat_epsilon_ms, dispatcher.heartbeat_period_ms
            )));
        }
        if dispatcher.grace_period_multiplier == 0 {
            return Err(DroverError::Config(
                "dispatcher.grace_period_multiplier must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}.
fn substitute_env_vars(content: &str) -> String {
    let mut result = content.to_string();

    for cap in ENV_VAR_PATTERN.captures_iter(content) {
        let var_name = &cap[1];
        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(&cap[0], &value);
        }
    }

    result
}
