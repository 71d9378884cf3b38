pub mod cluster;
pub mod config;
pub mod constraint;
pub mod error;
pub mod id;
pub mod orchestrator;
pub mod service;
pub mod store;

pub use cluster::{Cluster, Node, NodeAvailability, NodeRole, NodeState};
pub use config::DroverConfig;
pub use constraint::Constraint;
pub use error::{DroverError, Result};
pub use id::{ClusterId, NodeId, ServiceId, SessionId, TaskId};
pub use orchestrator::{RestartSupervisor, Slot, UpdateSupervisor};
pub use service::{Service, ServiceMode, Task, TaskState};
pub use store::{MemoryStore, StoreEvent};
