use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::service::UpdatePolicy;

/// Orchestrator defaults, applied when a service carries no policy of
/// its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Delay before a restarted task may run, in milliseconds.
    #[serde(default = "default_restart_delay")]
    pub restart_delay_ms: u64,

    /// Maximum restarts per slot; zero means unlimited.
    #[serde(default)]
    pub restart_max_attempts: u64,

    /// Slots updated at a time during a rolling update.
    #[serde(default = "default_update_parallelism")]
    pub update_parallelism: u64,

    /// Pause between groups of updated slots, in milliseconds.
    #[serde(default)]
    pub update_delay_ms: u64,
}

impl OrchestratorConfig {
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    /// Update policy used for services that do not declare one.
    pub fn default_update_policy(&self) -> UpdatePolicy {
        UpdatePolicy {
            parallelism: self.update_parallelism,
            delay: Duration::from_millis(self.update_delay_ms),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            restart_delay_ms: default_restart_delay(),
            restart_max_attempts: 0,
            update_parallelism: default_update_parallelism(),
            update_delay_ms: 0,
        }
    }
}

fn default_restart_delay() -> u64 {
    5000
}

fn default_update_parallelism() -> u64 {
    1
}
