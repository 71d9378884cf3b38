use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::id::{NodeId, ServiceId, TaskId};

/// Task lifecycle state.
///
/// Variants are ordered: anything past `Running` means the task has
/// finished or is on its way out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum TaskState {
    #[default]
    New,
    Pending,
    Assigned,
    Accepted,
    Preparing,
    Ready,
    Starting,
    Running,
    Complete,
    Shutdown,
    Failed,
    Rejected,
    Remove,
    Orphaned,
}

impl TaskState {
    /// Convert to string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::Accepted => "accepted",
            Self::Preparing => "preparing",
            Self::Ready => "ready",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Shutdown => "shutdown",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
            Self::Remove => "remove",
            Self::Orphaned => "orphaned",
        }
    }

    /// Whether the state is past `Running`.
    pub fn is_terminal(&self) -> bool {
        *self > Self::Running
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// When a failed or exited task gets replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestartCondition {
    /// Never restart.
    None,
    /// Restart unless the task completed successfully.
    OnFailure,
    /// Always restart.
    #[default]
    Any,
}

/// Restart policy attached to a task spec.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RestartPolicy {
    pub condition: RestartCondition,
    /// Wait before the replacement is allowed to run.
    pub delay: Option<Duration>,
    /// Maximum restarts per slot; zero means unlimited.
    pub max_attempts: u64,
}

/// Placement rules for a task.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Placement {
    /// Constraint expressions such as `node.labels.zone==east`.
    pub constraints: Vec<String>,
}

/// What a task runs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TaskSpec {
    pub image: String,
    pub command: Vec<String>,
    pub env: HashMap<String, String>,
    pub placement: Option<Placement>,
    pub restart: Option<RestartPolicy>,
    pub log_driver: Option<String>,
}

impl TaskSpec {
    /// Create a spec running the given image.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    /// Placement constraint expressions, empty when unconstrained.
    pub fn constraints(&self) -> &[String] {
        self.placement
            .as_ref()
            .map(|p| p.constraints.as_slice())
            .unwrap_or(&[])
    }
}

/// Observed task status, as reported by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStatus {
    pub state: TaskState,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl TaskStatus {
    pub fn new(state: TaskState, message: impl Into<String>) -> Self {
        Self {
            state,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::new(TaskState::New, "created")
    }
}

/// A scheduled unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: TaskId,
    pub service_id: ServiceId,
    pub service_name: String,
    /// Node the task is placed on. Always set for global services.
    pub node_id: Option<NodeId>,
    /// Slot number for replicated services; zero for global services.
    pub slot: u64,
    pub spec: TaskSpec,
    pub desired_state: TaskState,
    pub status: TaskStatus,
    pub log_driver: Option<String>,
}

impl Task {
    /// Whether the orchestrator already decided to stop this task.
    pub fn is_processed(&self) -> bool {
        self.desired_state.is_terminal()
    }
}
