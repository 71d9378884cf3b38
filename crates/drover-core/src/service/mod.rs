mod spec;
mod task;

pub use spec::{Service, ServiceMode, ServiceSpec, UpdatePolicy};
pub use task::{
    Placement, RestartCondition, RestartPolicy, Task, TaskSpec, TaskState, TaskStatus,
};
