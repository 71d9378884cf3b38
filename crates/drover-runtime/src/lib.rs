//! Control-plane runtime: the node dispatcher and the orchestrators that
//! react to store changes.

pub mod dispatcher;
pub mod orchestrator;
pub mod testing;

pub use dispatcher::{Dispatcher, NodeRegistry, Session};
pub use orchestrator::{
    EngineState, GlobalOrchestrator, OrchestratorHandle, RestartPolicySupervisor,
    RollingUpdateSupervisor,
};
