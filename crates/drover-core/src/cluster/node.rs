use std::collections::HashMap;

use super::roles::NodeRole;
use crate::id::NodeId;

/// Operator-declared availability of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeAvailability {
    /// Node accepts new tasks.
    #[default]
    Active,
    /// Existing tasks keep running, nothing new is scheduled or updated.
    Pause,
    /// All tasks are moved off the node.
    Drain,
}

impl NodeAvailability {
    /// Convert to string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Pause => "pause",
            Self::Drain => "drain",
        }
    }
}

/// Observed state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeState {
    /// No report yet.
    #[default]
    Unknown,
    /// Node stopped heartbeating or left.
    Down,
    /// Node is registered and heartbeating.
    Ready,
    /// Node lost its session but was not declared dead.
    Disconnected,
}

impl NodeState {
    /// Convert to string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Down => "down",
            Self::Ready => "ready",
            Self::Disconnected => "disconnected",
        }
    }
}

/// Observed node status.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodeStatus {
    pub state: NodeState,
    pub message: String,
}

impl NodeStatus {
    pub fn new(state: NodeState, message: impl Into<String>) -> Self {
        Self {
            state,
            message: message.into(),
        }
    }
}

/// Operator-controlled node specification.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodeSpec {
    pub name: String,
    pub labels: HashMap<String, String>,
    pub role: NodeRole,
    pub availability: NodeAvailability,
}

/// Operating system and architecture reported by a node.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
}

/// Facts the node reports about itself on registration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodeDescription {
    pub hostname: String,
    pub platform: Platform,
}

/// A cluster member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Unique node ID.
    pub id: NodeId,
    /// Desired configuration.
    pub spec: NodeSpec,
    /// Self-reported description, absent until the node registers.
    pub description: Option<NodeDescription>,
    /// Observed status.
    pub status: NodeStatus,
}

impl Node {
    /// Create a new active node with the given ID.
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            spec: NodeSpec::default(),
            description: None,
            status: NodeStatus::default(),
        }
    }

    /// Hostname from the node description, if reported.
    pub fn hostname(&self) -> Option<&str> {
        self.description.as_ref().map(|d| d.hostname.as_str())
    }

    /// Whether the node is draining or down. Such nodes must not hold
    /// tasks of any kind.
    pub fn is_invalid(&self) -> bool {
        self.spec.availability == NodeAvailability::Drain || self.status.state == NodeState::Down
    }

    /// Whether the node is paused.
    pub fn is_paused(&self) -> bool {
        self.spec.availability == NodeAvailability::Pause
    }
}

/// True when a node is absent, draining, or down.
pub fn invalid_node(node: Option<&Node>) -> bool {
    node.map_or(true, Node::is_invalid)
}
