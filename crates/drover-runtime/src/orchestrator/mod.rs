//! Task orchestration: the global service reconciler and the default
//! restart and rolling-update supervisors it delegates to.

mod global;
mod restart;
mod update;

pub use global::{EngineState, GlobalOrchestrator, OrchestratorHandle};
pub use restart::RestartPolicySupervisor;
pub use update::RollingUpdateSupervisor;

use drover_core::cluster::{Cluster, Node};
use drover_core::constraint::{node_matches, Constraint};
use drover_core::service::{Service, Task, TaskState, TaskStatus};
use drover_core::store::{By, MemoryStore, ReadTx};
use drover_core::{NodeId, TaskId};

/// Build a fresh task for a service, desired to run on `node_id`.
pub fn new_task(
    cluster: Option<&Cluster>,
    service: &Service,
    slot: u64,
    node_id: Option<NodeId>,
) -> Task {
    let log_driver = service.spec.task.log_driver.clone().or_else(|| {
        cluster.and_then(|c| c.spec.task_defaults.log_driver.clone())
    });

    Task {
        id: TaskId::new(),
        service_id: service.id,
        service_name: service.spec.name.clone(),
        node_id,
        slot,
        spec: service.spec.task.clone(),
        desired_state: TaskState::Running,
        status: TaskStatus::new(TaskState::New, "created"),
        log_driver,
    }
}

/// Whether a task was created from an older version of the service spec.
///
/// A change to placement alone leaves the task clean while `node` still
/// satisfies the new constraints.
pub fn is_task_dirty(service: &Service, task: &Task, node: Option<&Node>) -> bool {
    let current = &service.spec.task;
    if task.spec == *current {
        return false;
    }
    let Some(node) = node else {
        return true;
    };

    let mut placed = task.spec.clone();
    placed.placement = current.placement.clone();
    if placed != *current {
        return true;
    }
    match Constraint::parse_all(current.constraints()) {
        Ok(constraints) => !node_matches(&constraints, node),
        Err(_) => true,
    }
}

/// Mark every task of a deleted service for removal.
pub async fn set_service_tasks_remove(store: &MemoryStore, service: &Service) {
    let tasks = store
        .view(|tx| tx.find_tasks(&By::ServiceId(service.id)))
        .await;

    let result = store
        .batch(|batch| {
            for task in &tasks {
                let task_id = task.id;
                let result = batch.update(|tx| {
                    let Some(mut task) = tx.get_task(task_id) else {
                        return Ok(());
                    };
                    // Never move a task backwards.
                    if task.desired_state >= TaskState::Remove {
                        return Ok(());
                    }
                    task.desired_state = TaskState::Remove;
                    tx.update_task(task)
                });
                if let Err(e) = result {
                    tracing::error!(task_id = %task_id, error = %e, "Failed to mark task for removal");
                }
            }
            Ok(())
        })
        .await;

    if let Err(e) = result {
        tracing::error!(service_id = %service.id, error = %e, "Removing service tasks failed");
    }
}
