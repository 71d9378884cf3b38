//! Test doubles and fixtures for orchestrator tests.
//!
//! The recording supervisors capture what the engine asks of them without
//! touching the store, so engine decisions can be checked in isolation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use drover_core::cluster::{Cluster, Node, NodeState, NodeStatus, DEFAULT_CLUSTER_NAME};
use drover_core::orchestrator::{RestartSupervisor, Slot, UpdateSupervisor};
use drover_core::service::{Service, ServiceMode, ServiceSpec, Task, TaskSpec, TaskState};
use drover_core::store::{MemoryStore, Tx};
use drover_core::{NodeId, Result, ServiceId, TaskId};

/// Update supervisor that only records the slots it was handed.
#[derive(Default)]
pub struct RecordingUpdateSupervisor {
    calls: Mutex<Vec<(ServiceId, Vec<Slot>)>>,
    cancelled: AtomicUsize,
}

impl RecordingUpdateSupervisor {
    pub fn calls(&self) -> Vec<(ServiceId, Vec<Slot>)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Number of `cancel_all` calls.
    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl UpdateSupervisor for RecordingUpdateSupervisor {
    fn update(&self, _cluster: Option<&Cluster>, service: &Service, slots: Vec<Slot>) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((service.id, slots));
        }
    }

    fn cancel_all(&self) {
        self.cancelled.fetch_add(1, Ordering::SeqCst);
    }
}

/// Restart supervisor that records restarts and leaves tasks untouched.
#[derive(Default)]
pub struct RecordingRestartSupervisor {
    restarted: Mutex<Vec<TaskId>>,
    cleared: Mutex<Vec<ServiceId>>,
    cancelled: AtomicUsize,
}

impl RecordingRestartSupervisor {
    pub fn restarted(&self) -> Vec<TaskId> {
        self.restarted.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Services whose history was cleared.
    pub fn cleared(&self) -> Vec<ServiceId> {
        self.cleared.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl RestartSupervisor for RecordingRestartSupervisor {
    fn updatable_tasks_in_slot(&self, slot: &[Task], _service: &Service) -> Slot {
        slot.iter()
            .filter(|t| t.desired_state <= TaskState::Running)
            .cloned()
            .collect()
    }

    fn restart(
        &self,
        _tx: &mut Tx<'_>,
        _cluster: Option<&Cluster>,
        _service: &Service,
        task: Task,
    ) -> Result<()> {
        if let Ok(mut restarted) = self.restarted.lock() {
            restarted.push(task.id);
        }
        Ok(())
    }

    fn clear_service_history(&self, service_id: ServiceId) {
        if let Ok(mut cleared) = self.cleared.lock() {
            cleared.push(service_id);
        }
    }

    fn cancel_all(&self) {
        self.cancelled.fetch_add(1, Ordering::SeqCst);
    }
}

/// A ready, active node.
pub fn node(name: &str) -> Node {
    let mut node = Node::new(NodeId::new());
    node.spec.name = name.to_string();
    node.status = NodeStatus::new(NodeState::Ready, "registered");
    node
}

/// A global service running `image`.
pub fn global_service(name: &str, image: &str) -> Service {
    Service::new(ServiceSpec {
        name: name.to_string(),
        mode: ServiceMode::Global,
        task: TaskSpec::new(image),
        ..Default::default()
    })
}

/// Create the default cluster plus the given nodes and services.
pub async fn seed_store(store: &MemoryStore, nodes: &[Node], services: &[Service]) {
    let result = store
        .update(|tx| {
            tx.create_cluster(Cluster::new(DEFAULT_CLUSTER_NAME))?;
            for node in nodes {
                tx.create_node(node.clone())?;
            }
            for service in services {
                tx.create_service(service.clone())?;
            }
            Ok(())
        })
        .await;
    if let Err(e) = result {
        panic!("failed to seed store: {e}");
    }
}
