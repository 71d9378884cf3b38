mod node;
mod roles;
mod settings;

pub use node::{
    invalid_node, Node, NodeAvailability, NodeDescription, NodeSpec, NodeState, NodeStatus,
    Platform,
};
pub use roles::NodeRole;
pub use settings::{Cluster, ClusterSpec, TaskDefaults, DEFAULT_CLUSTER_NAME};
