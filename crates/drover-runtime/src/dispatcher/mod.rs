//! Node-facing side of the manager.
//!
//! Tracks which nodes are connected, hands out sessions, and declares a
//! node down when it stops sending heartbeats within its grace period.

mod api;
mod heartbeat;
mod period;
mod registry;

pub use api::{Dispatcher, Session};
pub use heartbeat::Heartbeat;
pub use period::PeriodChooser;
pub use registry::{NodeRegistry, RegisteredNode};
