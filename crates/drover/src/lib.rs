//! drover: a cluster control plane that keeps one task of every global
//! service on every eligible node.

mod runtime;

pub use drover_core;
pub use drover_runtime;

pub use runtime::Manager;
