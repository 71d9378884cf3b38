use crate::cluster::Cluster;
use crate::error::Result;
use crate::id::ServiceId;
use crate::service::{Service, Task};
use crate::store::Tx;

/// The tasks standing in for one service instance on one node.
pub type Slot = Vec<Task>;

/// Drives slots toward a service's current spec using the service's
/// rolling update policy.
pub trait UpdateSupervisor: Send + Sync {
    /// Start (or restart) an update of the given slots. Returns
    /// immediately; the update proceeds in the background and supersedes
    /// any update already running for the same service.
    fn update(&self, cluster: Option<&Cluster>, service: &Service, slots: Vec<Slot>);

    /// Abort every in-flight update.
    fn cancel_all(&self);
}

/// Applies restart policy to failed or exited tasks.
pub trait RestartSupervisor: Send + Sync {
    /// Filter a slot to the tasks that remain valid under restart-policy
    /// limits and may still be updated.
    fn updatable_tasks_in_slot(&self, slot: &[Task], service: &Service) -> Slot;

    /// Shut the task down and, if policy allows, create its replacement
    /// inside the caller's transaction.
    fn restart(
        &self,
        tx: &mut Tx<'_>,
        cluster: Option<&Cluster>,
        service: &Service,
        task: Task,
    ) -> Result<()>;

    /// Forget restart history for a deleted service.
    fn clear_service_history(&self, service_id: ServiceId);

    /// Abort every pending delayed restart.
    fn cancel_all(&self);
}
