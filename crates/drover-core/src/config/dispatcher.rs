use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Dispatcher heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Base heartbeat period in milliseconds.
    #[serde(default = "default_heartbeat_period")]
    pub heartbeat_period_ms: u64,

    /// Maximum jitter applied to the period, in milliseconds.
    #[serde(default = "default_heartbeat_epsilon")]
    pub heartbeat_epsilon_ms: u64,

    /// Missed periods tolerated before a node is declared down.
    #[serde(default = "default_grace_period_multiplier")]
    pub grace_period_multiplier: u32,
}

impl DispatcherConfig {
    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.heartbeat_period_ms)
    }

    pub fn heartbeat_epsilon(&self) -> Duration {
        Duration::from_millis(self.heartbeat_epsilon_ms)
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            heartbeat_period_ms: default_heartbeat_period(),
            heartbeat_epsilon_ms: default_heartbeat_epsilon(),
            grace_period_multiplier: default_grace_period_multiplier(),
        }
    }
}

fn default_heartbeat_period() -> u64 {
    5000
}

fn default_heartbeat_epsilon() -> u64 {
    500
}

fn default_grace_period_multiplier() -> u32 {
    3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_dispatcher_config() {
        let config = DispatcherConfig::default();
        assert_eq!(config.heartbeat_period(), Duration::from_secs(5));
        assert_eq!(config.heartbeat_epsilon(), Duration::from_millis(500));
        assert_eq!(config.grace_period_multiplier, 3);
    }
}
