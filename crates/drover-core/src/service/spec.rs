use std::collections::HashMap;
use std::time::Duration;

use super::task::TaskSpec;
use crate::id::ServiceId;

/// How many task instances a service wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceMode {
    /// A fixed number of instances.
    Replicated { replicas: u64 },
    /// One instance on every eligible node.
    Global,
}

impl Default for ServiceMode {
    fn default() -> Self {
        Self::Replicated { replicas: 1 }
    }
}

/// Rolling update parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpdatePolicy {
    /// Slots updated at a time; zero updates all at once.
    pub parallelism: u64,
    /// Pause between groups of slots.
    pub delay: Duration,
}

/// Desired state of a service.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServiceSpec {
    pub name: String,
    pub labels: HashMap<String, String>,
    pub mode: ServiceMode,
    pub task: TaskSpec,
    pub update: Option<UpdatePolicy>,
}

/// A declared workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub id: ServiceId,
    pub spec: ServiceSpec,
}

impl Service {
    /// Create a service with a fresh ID.
    pub fn new(spec: ServiceSpec) -> Self {
        Self {
            id: ServiceId::new(),
            spec,
        }
    }

    /// Whether the service runs one task per node.
    pub fn is_global(&self) -> bool {
        matches!(self.spec.mode, ServiceMode::Global)
    }
}
