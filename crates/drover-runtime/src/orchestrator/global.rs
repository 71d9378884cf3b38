use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use drover_core::cluster::{
    invalid_node, Cluster, Node, NodeAvailability, NodeState, DEFAULT_CLUSTER_NAME,
};
use drover_core::constraint::{node_matches, Constraint};
use drover_core::orchestrator::{RestartSupervisor, Slot, UpdateSupervisor};
use drover_core::service::{Service, Task, TaskState};
use drover_core::store::{Batch, By, MemoryStore, ReadTx, StoreEvent};
use drover_core::{NodeId, Result, ServiceId, TaskId};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use super::{is_task_dirty, new_task, set_service_tasks_remove};

/// Lifecycle of the reconciliation engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Initializing,
    Running,
    Stopping,
    Stopped,
}

/// A global service with its placement constraints parsed once.
struct GlobalService {
    service: Service,
    /// `None` when the constraints failed to parse; such a service fits
    /// no node.
    constraints: Option<Vec<Constraint>>,
}

impl GlobalService {
    fn new(service: Service) -> Self {
        let constraints = match Constraint::parse_all(service.spec.task.constraints()) {
            Ok(constraints) => Some(constraints),
            Err(e) => {
                tracing::warn!(
                    service_id = %service.id,
                    error = %e,
                    "Invalid placement constraints, service will not be scheduled"
                );
                None
            }
        };
        Self {
            service,
            constraints,
        }
    }

    fn fits(&self, node: &Node) -> bool {
        self.constraints
            .as_deref()
            .is_some_and(|constraints| node_matches(constraints, node))
    }
}

/// Reconciler that keeps one task of every global service on every
/// eligible node.
///
/// All cache state is owned by the single loop started with [`spawn`];
/// external input arrives only through the store's event stream.
///
/// [`spawn`]: GlobalOrchestrator::spawn
pub struct GlobalOrchestrator {
    store: Arc<MemoryStore>,
    /// Nodes that are neither draining nor down.
    nodes: HashMap<NodeId, Node>,
    services: HashMap<ServiceId, GlobalService>,
    restart_tasks: HashSet<TaskId>,
    /// Name of the cluster object whose settings apply to new tasks.
    cluster_name: String,
    cluster: Option<Cluster>,
    updater: Arc<dyn UpdateSupervisor>,
    restarts: Arc<dyn RestartSupervisor>,
}

impl GlobalOrchestrator {
    pub fn new(
        store: Arc<MemoryStore>,
        updater: Arc<dyn UpdateSupervisor>,
        restarts: Arc<dyn RestartSupervisor>,
    ) -> Self {
        Self {
            store,
            nodes: HashMap::new(),
            services: HashMap::new(),
            restart_tasks: HashSet::new(),
            cluster_name: DEFAULT_CLUSTER_NAME.to_string(),
            cluster: None,
            updater,
            restarts,
        }
    }

    /// Read cluster settings from the cluster object with this name.
    pub fn with_cluster_name(mut self, name: impl Into<String>) -> Self {
        self.cluster_name = name.into();
        self
    }

    /// Start the reconciliation loop in the background.
    pub fn spawn(self) -> OrchestratorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = Arc::new(watch::Sender::new(EngineState::Initializing));
        let updater = self.updater.clone();
        let restarts = self.restarts.clone();

        let loop_state = state.clone();
        let join = tokio::spawn(async move {
            let result = self.run(shutdown_rx, &loop_state).await;
            if let Err(e) = &result {
                tracing::error!(error = %e, "Global orchestrator exited with error");
            }
            result
        });

        OrchestratorHandle {
            shutdown: shutdown_tx,
            join: Mutex::new(Some(join)),
            state,
            updater,
            restarts,
        }
    }

    async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
        state: &watch::Sender<EngineState>,
    ) -> Result<()> {
        // Subscribe before loading so nothing committed meanwhile is missed.
        let mut watcher = self.store.watch().await;

        let service_ids = self.initialize().await?;
        state.send_replace(EngineState::Running);
        tracing::info!(
            nodes = self.nodes.len(),
            services = self.services.len(),
            "Global orchestrator started"
        );

        self.tick_tasks().await;
        self.reconcile_services(&service_ids).await;

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            tokio::select! {
                event = watcher.recv() => {
                    let Some(event) = event else { break };
                    self.handle_event(event).await;
                }
                _ = shutdown.changed() => break,
            }
            self.tick_tasks().await;
        }

        tracing::info!("Global orchestrator loop exited");
        Ok(())
    }

    /// Load the cluster, nodes and global services, then fix up tasks left
    /// inconsistent by earlier runs. Returns the global services to
    /// reconcile.
    async fn initialize(&mut self) -> Result<Vec<ServiceId>> {
        let (clusters, nodes, services) = self
            .store
            .view(|tx| {
                (
                    tx.find_clusters(&By::Name(self.cluster_name.clone())),
                    tx.find_nodes(&By::All),
                    tx.find_services(&By::All),
                )
            })
            .await;

        // Otherwise picked up when the cluster is created.
        if let [cluster] = clusters.as_slice() {
            self.cluster = Some(cluster.clone());
        }

        for node in &nodes {
            self.update_node(node);
        }

        let mut service_ids = Vec::new();
        for service in services.into_iter().filter(Service::is_global) {
            service_ids.push(service.id);
            self.update_service(service);
        }

        self.fix_tasks().await?;
        Ok(service_ids)
    }

    /// One pass over stored tasks of global services: shut down tasks on
    /// ineligible nodes, queue failed tasks for restart and start tasks
    /// whose delayed start was lost.
    async fn fix_tasks(&mut self) -> Result<()> {
        let tasks: Vec<Task> = self
            .store
            .view(|tx| tx.find_tasks(&By::All))
            .await
            .into_iter()
            .filter(|t| self.services.contains_key(&t.service_id))
            .filter(|t| !t.is_processed())
            .collect();

        let mut failed = Vec::new();
        self.store
            .batch(|batch| {
                for task in &tasks {
                    let node = task.node_id.and_then(|id| self.nodes.get(&id));
                    if invalid_node(node) {
                        shutdown_task(batch, task.id);
                        continue;
                    }
                    if task.status.state > TaskState::Running {
                        failed.push(task.id);
                        continue;
                    }
                    if task.desired_state == TaskState::Ready {
                        start_task(batch, task.id);
                    }
                }
                Ok(())
            })
            .await?;

        self.restart_tasks.extend(failed);
        Ok(())
    }

    async fn handle_event(&mut self, event: StoreEvent) {
        tracing::trace!(event = event.kind(), "Global orchestrator event");
        match event {
            StoreEvent::CreateCluster(cluster) | StoreEvent::UpdateCluster(cluster) => {
                if cluster.spec.name == self.cluster_name {
                    self.cluster = Some(cluster);
                }
            }
            StoreEvent::CreateService(service) | StoreEvent::UpdateService(service) => {
                if !service.is_global() {
                    return;
                }
                let service_id = service.id;
                self.update_service(service);
                self.reconcile_services(&[service_id]).await;
            }
            StoreEvent::DeleteService(service) => {
                if self.services.remove(&service.id).is_none() {
                    return;
                }
                set_service_tasks_remove(&self.store, &service).await;
                self.restarts.clear_service_history(service.id);
                tracing::debug!(service_id = %service.id, "Global service deleted");
            }
            StoreEvent::CreateNode(node) | StoreEvent::UpdateNode(node) => {
                self.update_node(&node);
                self.reconcile_one_node(&node).await;
            }
            StoreEvent::DeleteNode(node) => {
                self.shutdown_node_tasks(node.id).await;
                self.nodes.remove(&node.id);
            }
            StoreEvent::UpdateTask(task) => self.handle_task_change(&task),
            _ => {}
        }
    }

    /// Queue a task for restart consideration once it has stopped running
    /// on its own.
    fn handle_task_change(&mut self, task: &Task) {
        if !self.services.contains_key(&task.service_id) || task.is_processed() {
            return;
        }
        if task.status.state > TaskState::Running {
            tracing::debug!(task_id = %task.id, state = %task.status.state, "Task queued for restart");
            self.restart_tasks.insert(task.id);
        }
    }

    fn update_node(&mut self, node: &Node) {
        if node.is_invalid() {
            self.nodes.remove(&node.id);
        } else {
            self.nodes.insert(node.id, node.clone());
        }
    }

    fn update_service(&mut self, service: Service) {
        self.services.insert(service.id, GlobalService::new(service));
    }

    /// Reconcile the given services against every known node.
    async fn reconcile_services(&mut self, service_ids: &[ServiceId]) {
        let mut node_tasks: HashMap<ServiceId, HashMap<Option<NodeId>, Slot>> = self
            .store
            .view(|tx| {
                let mut out = HashMap::new();
                for service_id in service_ids {
                    let Some(global) = self.services.get(service_id) else {
                        continue;
                    };
                    let mut slots: HashMap<Option<NodeId>, Slot> = HashMap::new();
                    for task in tx.find_tasks(&By::ServiceId(*service_id)) {
                        slots.entry(task.node_id).or_default().push(task);
                    }
                    // Keep runnable tasks, plus tasks that were not restarted
                    // but may still be updated to a new spec.
                    slots.retain(|_, slot| {
                        let updatable = self.restarts.updatable_tasks_in_slot(slot, &global.service);
                        *slot = updatable;
                        !slot.is_empty()
                    });
                    out.insert(*service_id, slots);
                }
                out
            })
            .await;

        let mut updates: Vec<(Service, Vec<Slot>)> = Vec::new();
        let cluster = self.cluster.as_ref();
        let result = self
            .store
            .batch(|batch| {
                for service_id in service_ids {
                    let (Some(mut slots), Some(global)) =
                        (node_tasks.remove(service_id), self.services.get(service_id))
                    else {
                        continue;
                    };

                    let mut update_slots = Vec::new();
                    for (node_id, node) in &self.nodes {
                        let slot = slots.remove(&Some(*node_id)).unwrap_or_default();
                        if !global.fits(node) {
                            shutdown_tasks(batch, &slot);
                            continue;
                        }
                        // Paused nodes get no new or updated tasks.
                        if node.is_paused() {
                            continue;
                        }
                        if slot.is_empty() {
                            add_task(batch, cluster, &global.service, *node_id);
                        } else {
                            update_slots.push(slot);
                        }
                    }
                    if !update_slots.is_empty() {
                        updates.push((global.service.clone(), update_slots));
                    }

                    // Whatever is left sits on drained, down or unknown nodes.
                    for slot in slots.into_values() {
                        shutdown_tasks(batch, &slot);
                    }
                }
                Ok(())
            })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "Reconciling global services failed");
        }

        for (service, slots) in updates {
            self.updater.update(self.cluster.as_ref(), &service, slots);
        }
    }

    /// Reconcile every global service on a single node.
    async fn reconcile_one_node(&mut self, node: &Node) {
        if node.spec.availability == NodeAvailability::Drain {
            tracing::debug!(node_id = %node.id, "Node draining, shutting down its tasks");
            self.shutdown_node_tasks(node.id).await;
            return;
        }
        if node.status.state == NodeState::Down {
            tracing::debug!(node_id = %node.id, "Node down, shutting down its tasks");
            self.shutdown_node_tasks(node.id).await;
            return;
        }
        if node.is_paused() {
            return;
        }
        let Some(node) = self.nodes.get(&node.id) else {
            return;
        };
        let node_id = node.id;

        let mut tasks: HashMap<ServiceId, Slot> = HashMap::new();
        for task in self
            .store
            .view(|tx| tx.find_tasks(&By::NodeId(node_id)))
            .await
        {
            if self.services.contains_key(&task.service_id) {
                tasks.entry(task.service_id).or_default().push(task);
            }
        }
        tasks.retain(|service_id, slot| match self.services.get(service_id) {
            Some(global) => {
                *slot = self.restarts.updatable_tasks_in_slot(slot, &global.service);
                !slot.is_empty()
            }
            None => false,
        });

        let cluster = self.cluster.as_ref();
        let result = self
            .store
            .batch(|batch| {
                for (service_id, global) in &self.services {
                    let slot = tasks.remove(service_id).unwrap_or_default();
                    if !global.fits(node) {
                        shutdown_tasks(batch, &slot);
                        continue;
                    }
                    if slot.is_empty() {
                        add_task(batch, cluster, &global.service, node_id);
                        continue;
                    }

                    // Not a rolling update: this was not triggered by a
                    // service change, so outdated tasks are replaced
                    // directly without cancelling any update in progress.
                    let (mut dirty, clean): (Vec<Task>, Vec<Task>) = slot
                        .into_iter()
                        .partition(|task| is_task_dirty(&global.service, task, Some(node)));
                    if clean.is_empty() {
                        add_task(batch, cluster, &global.service, node_id);
                    } else {
                        dirty.extend(clean.into_iter().skip(1));
                    }
                    shutdown_tasks(batch, &dirty);
                }
                Ok(())
            })
            .await;
        if let Err(e) = result {
            tracing::error!(node_id = %node_id, error = %e, "Reconciling node failed");
        }
    }

    /// Shut down every global service task assigned to a node.
    async fn shutdown_node_tasks(&self, node_id: NodeId) {
        let tasks = self
            .store
            .view(|tx| tx.find_tasks(&By::NodeId(node_id)))
            .await;

        let result = self
            .store
            .batch(|batch| {
                for task in &tasks {
                    if self.services.contains_key(&task.service_id) {
                        shutdown_task(batch, task.id);
                    }
                }
                Ok(())
            })
            .await;
        if let Err(e) = result {
            tracing::error!(node_id = %node_id, error = %e, "Shutting down node tasks failed");
        }
    }

    /// Process queued restarts in one batch.
    async fn tick_tasks(&mut self) {
        if self.restart_tasks.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.restart_tasks);

        let cluster = self.cluster.as_ref();
        let result = self
            .store
            .batch(|batch| {
                for task_id in &pending {
                    let task_id = *task_id;
                    let result = batch.update(|tx| {
                        let Some(mut task) = tx.get_task(task_id) else {
                            return Ok(());
                        };
                        if task.is_processed() {
                            return Ok(());
                        }
                        let Some(service) = tx.get_service(task.service_id) else {
                            return Ok(());
                        };
                        let node = task.node_id.and_then(|id| self.nodes.get(&id));
                        let (Some(node), Some(global)) = (node, self.services.get(&task.service_id))
                        else {
                            return Ok(());
                        };

                        if node.is_paused() || !global.fits(node) {
                            task.desired_state = TaskState::Shutdown;
                            return tx.update_task(task);
                        }
                        self.restarts.restart(tx, cluster, &service, task)
                    });
                    if let Err(e) = result {
                        tracing::error!(task_id = %task_id, error = %e, "Restarting task failed");
                    }
                }
                Ok(())
            })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "Restart batch failed");
        }
    }
}

fn shutdown_task(batch: &mut Batch<'_>, task_id: TaskId) {
    let result = batch.update(|tx| {
        let Some(mut task) = tx.get_task(task_id) else {
            return Ok(());
        };
        if task.desired_state >= TaskState::Shutdown {
            return Ok(());
        }
        task.desired_state = TaskState::Shutdown;
        tx.update_task(task)
    });
    if let Err(e) = result {
        tracing::error!(task_id = %task_id, error = %e, "Failed to shut down task");
    }
}

fn shutdown_tasks(batch: &mut Batch<'_>, tasks: &[Task]) {
    for task in tasks {
        shutdown_task(batch, task.id);
    }
}

fn start_task(batch: &mut Batch<'_>, task_id: TaskId) {
    let result = batch.update(|tx| {
        let Some(mut task) = tx.get_task(task_id) else {
            return Ok(());
        };
        task.desired_state = TaskState::Running;
        tx.update_task(task)
    });
    if let Err(e) = result {
        tracing::error!(task_id = %task_id, error = %e, "Failed to start task");
    }
}

fn add_task(batch: &mut Batch<'_>, cluster: Option<&Cluster>, service: &Service, node_id: NodeId) {
    let task = new_task(cluster, service, 0, Some(node_id));
    let result = batch.update(|tx| {
        if tx.get_service(service.id).is_none() {
            return Ok(());
        }
        tx.create_task(task)
    });
    if let Err(e) = result {
        tracing::error!(
            service_id = %service.id,
            node_id = %node_id,
            error = %e,
            "Failed to create task"
        );
    }
}

/// Handle to a running [`GlobalOrchestrator`].
pub struct OrchestratorHandle {
    shutdown: watch::Sender<bool>,
    join: Mutex<Option<JoinHandle<Result<()>>>>,
    state: Arc<watch::Sender<EngineState>>,
    updater: Arc<dyn UpdateSupervisor>,
    restarts: Arc<dyn RestartSupervisor>,
}

impl OrchestratorHandle {
    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    /// Wait until the engine reaches `target`.
    pub async fn wait_for(&self, target: EngineState) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == target).await;
    }

    /// Stop the loop, wait for it to exit, then cancel supervisor work.
    /// Later calls wait for the first to finish and return.
    pub async fn stop(&self) {
        let mut join = self.join.lock().await;
        let Some(handle) = join.take() else {
            return;
        };

        self.state.send_replace(EngineState::Stopping);
        self.shutdown.send_replace(true);
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Global orchestrator task failed");
        }

        self.updater.cancel_all();
        self.restarts.cancel_all();
        self.state.send_replace(EngineState::Stopped);
        tracing::info!("Global orchestrator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        global_service, node, seed_store, RecordingRestartSupervisor, RecordingUpdateSupervisor,
    };
    use crate::orchestrator::{RestartPolicySupervisor, RollingUpdateSupervisor};
    use drover_core::cluster::NodeStatus;
    use drover_core::config::OrchestratorConfig;
    use drover_core::service::{Placement, TaskStatus, UpdatePolicy};
    use std::time::Duration;

    struct Fixture {
        store: Arc<MemoryStore>,
        updater: Arc<RecordingUpdateSupervisor>,
        restarts: Arc<RecordingRestartSupervisor>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: Arc::new(MemoryStore::new()),
                updater: Arc::new(RecordingUpdateSupervisor::default()),
                restarts: Arc::new(RecordingRestartSupervisor::default()),
            }
        }

        fn orchestrator(&self) -> GlobalOrchestrator {
            GlobalOrchestrator::new(
                self.store.clone(),
                self.updater.clone(),
                self.restarts.clone(),
            )
        }

        async fn tasks(&self) -> Vec<Task> {
            self.store.view(|tx| tx.find_tasks(&By::All)).await
        }

        async fn live_tasks(&self) -> Vec<Task> {
            self.tasks()
                .await
                .into_iter()
                .filter(|t| t.desired_state <= TaskState::Running)
                .collect()
        }
    }

    async fn started(fixture: &Fixture) -> GlobalOrchestrator {
        let mut orchestrator = fixture.orchestrator();
        let ids = orchestrator.initialize().await.unwrap();
        orchestrator.tick_tasks().await;
        orchestrator.reconcile_services(&ids).await;
        orchestrator
    }

    #[tokio::test]
    async fn test_creates_one_task_per_node() {
        let fixture = Fixture::new();
        let nodes = vec![node("a"), node("b"), node("c")];
        let service = global_service("agent", "agent:1");
        seed_store(&fixture.store, &nodes, &[service.clone()]).await;

        started(&fixture).await;

        let tasks = fixture.live_tasks().await;
        assert_eq!(tasks.len(), 3);
        for n in &nodes {
            assert_eq!(
                tasks.iter().filter(|t| t.node_id == Some(n.id)).count(),
                1
            );
        }
        assert!(tasks.iter().all(|t| t.service_id == service.id));
        assert!(fixture.updater.calls().is_empty());
    }

    #[tokio::test]
    async fn test_second_pass_is_noop() {
        let fixture = Fixture::new();
        let service = global_service("agent", "agent:1");
        seed_store(&fixture.store, &[node("a"), node("b")], &[service.clone()]).await;
        let mut orchestrator = started(&fixture).await;

        let mut watcher = fixture.store.watch().await;
        orchestrator.reconcile_services(&[service.id]).await;
        assert!(watcher.try_recv().is_none());

        // Existing clean slots go to the updater, which leaves them be.
        let calls = fixture.updater.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1.len(), 2);
        assert_eq!(fixture.live_tasks().await.len(), 2);
    }

    #[tokio::test]
    async fn test_constraints_limit_placement() {
        let fixture = Fixture::new();
        let mut east = node("east");
        east.spec.labels.insert("zone".to_string(), "east".to_string());
        let west = node("west");
        let mut service = global_service("agent", "agent:1");
        service.spec.task.placement = Some(Placement {
            constraints: vec!["node.labels.zone==east".to_string()],
        });
        seed_store(&fixture.store, &[east.clone(), west], &[service]).await;

        started(&fixture).await;

        let tasks = fixture.live_tasks().await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].node_id, Some(east.id));
    }

    fn zoned(name: &str, zone: &str) -> Node {
        let mut n = node(name);
        n.spec.labels.insert("zone".to_string(), zone.to_string());
        n
    }

    fn place(service: &mut Service, constraint: &str) {
        service.spec.task.placement = Some(Placement {
            constraints: vec![constraint.to_string()],
        });
    }

    #[tokio::test]
    async fn test_node_label_change_sheds_tasks() {
        let fixture = Fixture::new();
        let mut east = zoned("east", "east");
        let mut service = global_service("agent", "agent:1");
        place(&mut service, "node.labels.zone==east");
        seed_store(&fixture.store, &[east.clone()], &[service]).await;
        let mut orchestrator = started(&fixture).await;
        assert_eq!(fixture.live_tasks().await.len(), 1);

        east.spec
            .labels
            .insert("zone".to_string(), "west".to_string());
        fixture
            .store
            .update(|tx| tx.update_node(east.clone()))
            .await
            .unwrap();
        orchestrator
            .handle_event(StoreEvent::UpdateNode(east.clone()))
            .await;

        assert!(fixture.live_tasks().await.is_empty());
        assert!(orchestrator.nodes.contains_key(&east.id));
    }

    #[tokio::test]
    async fn test_placement_edit_keeps_matching_tasks() {
        let fixture = Fixture::new();
        let east = zoned("east", "east");
        let mut service = global_service("agent", "agent:1");
        place(&mut service, "node.labels.zone==east");
        seed_store(&fixture.store, &[east.clone()], &[service.clone()]).await;
        let mut orchestrator = started(&fixture).await;
        let original = fixture.live_tasks().await.remove(0);

        place(&mut service, "node.labels.zone!=west");
        fixture
            .store
            .update(|tx| tx.update_service(service.clone()))
            .await
            .unwrap();
        orchestrator
            .handle_event(StoreEvent::UpdateService(service))
            .await;
        orchestrator
            .handle_event(StoreEvent::UpdateNode(east))
            .await;

        assert_eq!(fixture.live_tasks().await, vec![original]);
    }

    #[tokio::test]
    async fn test_invalid_constraints_place_nothing() {
        let fixture = Fixture::new();
        let mut service = global_service("agent", "agent:1");
        service.spec.task.placement = Some(Placement {
            constraints: vec!["node.labels.zone~east".to_string()],
        });
        seed_store(&fixture.store, &[node("a")], &[service]).await;

        started(&fixture).await;
        assert!(fixture.live_tasks().await.is_empty());
    }

    #[tokio::test]
    async fn test_drained_node_loses_tasks() {
        let fixture = Fixture::new();
        let target = node("a");
        let other = node("b");
        let first = global_service("agent", "agent:1");
        let second = global_service("logs", "logs:1");
        seed_store(
            &fixture.store,
            &[target.clone(), other.clone()],
            &[first, second],
        )
        .await;
        let mut orchestrator = started(&fixture).await;
        assert_eq!(fixture.live_tasks().await.len(), 4);

        let mut drained = target.clone();
        drained.spec.availability = NodeAvailability::Drain;
        fixture
            .store
            .update(|tx| tx.update_node(drained.clone()))
            .await
            .unwrap();
        orchestrator
            .handle_event(StoreEvent::UpdateNode(drained))
            .await;

        assert!(!orchestrator.nodes.contains_key(&target.id));
        let tasks = fixture.tasks().await;
        let on_target: Vec<_> = tasks
            .iter()
            .filter(|t| t.node_id == Some(target.id))
            .collect();
        assert_eq!(on_target.len(), 2);
        assert!(on_target
            .iter()
            .all(|t| t.desired_state == TaskState::Shutdown));
        assert_eq!(fixture.live_tasks().await.len(), 2);
    }

    #[tokio::test]
    async fn test_down_node_loses_tasks() {
        let fixture = Fixture::new();
        let target = node("a");
        seed_store(
            &fixture.store,
            &[target.clone()],
            &[global_service("agent", "agent:1")],
        )
        .await;
        let mut orchestrator = started(&fixture).await;

        let mut down = target.clone();
        down.status = NodeStatus::new(NodeState::Down, "heartbeat failure");
        orchestrator.handle_event(StoreEvent::UpdateNode(down)).await;

        assert!(fixture.live_tasks().await.is_empty());
    }

    #[tokio::test]
    async fn test_deleted_node_tasks_shut_down() {
        let fixture = Fixture::new();
        let target = node("a");
        seed_store(
            &fixture.store,
            &[target.clone()],
            &[global_service("agent", "agent:1")],
        )
        .await;
        let mut orchestrator = started(&fixture).await;

        orchestrator
            .handle_event(StoreEvent::DeleteNode(target.clone()))
            .await;

        assert!(orchestrator.nodes.is_empty());
        let tasks = fixture.tasks().await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].desired_state, TaskState::Shutdown);
    }

    #[tokio::test]
    async fn test_new_node_gets_tasks() {
        let fixture = Fixture::new();
        seed_store(
            &fixture.store,
            &[node("a")],
            &[global_service("agent", "agent:1")],
        )
        .await;
        let mut orchestrator = started(&fixture).await;

        let joined = node("b");
        fixture
            .store
            .update(|tx| tx.create_node(joined.clone()))
            .await
            .unwrap();
        orchestrator
            .handle_event(StoreEvent::CreateNode(joined.clone()))
            .await;

        let tasks = fixture.live_tasks().await;
        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().any(|t| t.node_id == Some(joined.id)));
    }

    #[tokio::test]
    async fn test_failed_task_goes_to_restart_supervisor() {
        let fixture = Fixture::new();
        let service = global_service("agent", "agent:1");
        seed_store(&fixture.store, &[node("a")], &[service.clone()]).await;
        let mut orchestrator = started(&fixture).await;

        let mut task = fixture.live_tasks().await.remove(0);
        task.status = TaskStatus::new(TaskState::Failed, "exit 1");
        fixture
            .store
            .update(|tx| tx.update_task(task.clone()))
            .await
            .unwrap();

        orchestrator
            .handle_event(StoreEvent::UpdateTask(task.clone()))
            .await;
        assert!(orchestrator.restart_tasks.contains(&task.id));
        assert!(fixture.restarts.restarted().is_empty());

        orchestrator.tick_tasks().await;
        assert!(orchestrator.restart_tasks.is_empty());
        assert_eq!(fixture.restarts.restarted(), vec![task.id]);
        // No extra task was created by the engine itself.
        assert_eq!(fixture.tasks().await.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_task_on_paused_node_is_shut_down() {
        let fixture = Fixture::new();
        let mut paused = node("a");
        let service = global_service("agent", "agent:1");
        seed_store(&fixture.store, &[paused.clone()], &[service]).await;
        let mut orchestrator = started(&fixture).await;

        paused.spec.availability = NodeAvailability::Pause;
        orchestrator
            .handle_event(StoreEvent::UpdateNode(paused))
            .await;

        let mut task = fixture.live_tasks().await.remove(0);
        task.status = TaskStatus::new(TaskState::Failed, "exit 1");
        fixture
            .store
            .update(|tx| tx.update_task(task.clone()))
            .await
            .unwrap();
        orchestrator
            .handle_event(StoreEvent::UpdateTask(task.clone()))
            .await;
        orchestrator.tick_tasks().await;

        assert!(fixture.restarts.restarted().is_empty());
        let stored = fixture
            .store
            .view(|tx| tx.get_task(task.id))
            .await
            .unwrap();
        assert_eq!(stored.desired_state, TaskState::Shutdown);
    }

    #[tokio::test]
    async fn test_unpaused_node_replaces_dirty_task() {
        let fixture = Fixture::new();
        let mut target = node("a");
        let mut service = global_service("agent", "agent:1");
        seed_store(&fixture.store, &[target.clone()], &[service.clone()]).await;
        let mut orchestrator = started(&fixture).await;
        let original = fixture.live_tasks().await.remove(0);

        target.spec.availability = NodeAvailability::Pause;
        fixture
            .store
            .update(|tx| tx.update_node(target.clone()))
            .await
            .unwrap();
        orchestrator
            .handle_event(StoreEvent::UpdateNode(target.clone()))
            .await;

        // The paused node keeps its outdated task.
        service.spec.task.image = "agent:2".to_string();
        fixture
            .store
            .update(|tx| tx.update_service(service.clone()))
            .await
            .unwrap();
        orchestrator
            .handle_event(StoreEvent::UpdateService(service.clone()))
            .await;
        assert_eq!(fixture.live_tasks().await, vec![original.clone()]);
        let calls_before = fixture.updater.calls().len();

        target.spec.availability = NodeAvailability::Active;
        fixture
            .store
            .update(|tx| tx.update_node(target.clone()))
            .await
            .unwrap();
        orchestrator
            .handle_event(StoreEvent::UpdateNode(target.clone()))
            .await;

        let live = fixture.live_tasks().await;
        assert_eq!(live.len(), 1);
        assert_ne!(live[0].id, original.id);
        assert_eq!(live[0].spec.image, "agent:2");
        let stored = fixture
            .store
            .view(|tx| tx.get_task(original.id))
            .await
            .unwrap();
        assert_eq!(stored.desired_state, TaskState::Shutdown);
        assert_eq!(fixture.updater.calls().len(), calls_before);
    }

    #[tokio::test]
    async fn test_duplicate_clean_tasks_trimmed_on_node_reconcile() {
        let fixture = Fixture::new();
        let target = node("a");
        let service = global_service("agent", "agent:1");
        seed_store(&fixture.store, &[target.clone()], &[service.clone()]).await;
        let extra = new_task(None, &service, 0, Some(target.id));
        fixture
            .store
            .update(|tx| tx.create_task(extra.clone()))
            .await
            .unwrap();
        let mut orchestrator = started(&fixture).await;

        orchestrator
            .handle_event(StoreEvent::UpdateNode(target.clone()))
            .await;

        assert_eq!(fixture.live_tasks().await.len(), 1);
    }

    #[tokio::test]
    async fn test_service_delete_marks_tasks_for_removal() {
        let fixture = Fixture::new();
        let service = global_service("agent", "agent:1");
        seed_store(&fixture.store, &[node("a"), node("b")], &[service.clone()]).await;
        let mut orchestrator = started(&fixture).await;

        fixture
            .store
            .update(|tx| tx.delete_service(service.id))
            .await
            .unwrap();
        orchestrator
            .handle_event(StoreEvent::DeleteService(service.clone()))
            .await;

        assert!(orchestrator.services.is_empty());
        assert!(fixture
            .tasks()
            .await
            .iter()
            .all(|t| t.desired_state == TaskState::Remove));
        assert_eq!(fixture.restarts.cleared(), vec![service.id]);
    }

    #[tokio::test]
    async fn test_replicated_services_are_ignored() {
        let fixture = Fixture::new();
        let mut service = global_service("web", "web:1");
        service.spec.mode = drover_core::ServiceMode::Replicated { replicas: 3 };
        seed_store(&fixture.store, &[node("a")], &[service.clone()]).await;
        let mut orchestrator = started(&fixture).await;

        orchestrator
            .handle_event(StoreEvent::UpdateService(service))
            .await;
        assert!(fixture.tasks().await.is_empty());
    }

    #[tokio::test]
    async fn test_initialize_fixes_tasks() {
        let fixture = Fixture::new();
        let live = node("a");
        let mut drained = node("b");
        drained.spec.availability = NodeAvailability::Drain;
        let service = global_service("agent", "agent:1");
        seed_store(
            &fixture.store,
            &[live.clone(), drained.clone()],
            &[service.clone()],
        )
        .await;

        let on_drained = new_task(None, &service, 0, Some(drained.id));
        let mut failed = new_task(None, &service, 0, Some(live.id));
        failed.status = TaskStatus::new(TaskState::Failed, "exit 1");
        let mut delayed = new_task(None, &service, 0, Some(live.id));
        delayed.desired_state = TaskState::Ready;
        fixture
            .store
            .update(|tx| {
                tx.create_task(on_drained.clone())?;
                tx.create_task(failed.clone())?;
                tx.create_task(delayed.clone())
            })
            .await
            .unwrap();

        let mut orchestrator = fixture.orchestrator();
        orchestrator.initialize().await.unwrap();

        let get = |id| {
            let store = fixture.store.clone();
            async move { store.view(|tx| tx.get_task(id)).await.unwrap() }
        };
        assert_eq!(get(on_drained.id).await.desired_state, TaskState::Shutdown);
        assert_eq!(get(delayed.id).await.desired_state, TaskState::Running);
        assert!(orchestrator.restart_tasks.contains(&failed.id));
        assert!(orchestrator.cluster.is_some());
    }

    #[tokio::test]
    async fn test_cluster_events_refresh_settings() {
        let fixture = Fixture::new();
        let mut orchestrator = fixture.orchestrator();

        let mut other = Cluster::new("other");
        other.spec.task_defaults.log_driver = Some("syslog".to_string());
        orchestrator
            .handle_event(StoreEvent::CreateCluster(other))
            .await;
        assert!(orchestrator.cluster.is_none());

        let mut cluster = Cluster::new(DEFAULT_CLUSTER_NAME);
        cluster.spec.task_defaults.log_driver = Some("journald".to_string());
        orchestrator
            .handle_event(StoreEvent::UpdateCluster(cluster.clone()))
            .await;
        assert_eq!(orchestrator.cluster, Some(cluster));
    }

    #[tokio::test]
    async fn test_custom_cluster_name() {
        let fixture = Fixture::new();
        let mut orchestrator = fixture.orchestrator().with_cluster_name("production");

        orchestrator
            .handle_event(StoreEvent::CreateCluster(Cluster::new(DEFAULT_CLUSTER_NAME)))
            .await;
        assert!(orchestrator.cluster.is_none());

        let cluster = Cluster::new("production");
        orchestrator
            .handle_event(StoreEvent::CreateCluster(cluster.clone()))
            .await;
        assert_eq!(orchestrator.cluster, Some(cluster));
    }

    #[tokio::test]
    async fn test_run_and_stop() {
        let fixture = Fixture::new();
        let service = global_service("agent", "agent:1");
        seed_store(&fixture.store, &[node("a")], &[service.clone()]).await;

        let handle = fixture.orchestrator().spawn();
        handle.wait_for(EngineState::Running).await;

        let joined = node("b");
        fixture
            .store
            .update(|tx| tx.create_node(joined.clone()))
            .await
            .unwrap();

        let store = fixture.store.clone();
        tokio::time::timeout(std::time::Duration::from_secs(5), async move {
            loop {
                let count = store
                    .view(|tx| tx.find_tasks(&By::NodeId(joined.id)))
                    .await
                    .len();
                if count == 1 {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        handle.stop().await;
        handle.stop().await;
        assert_eq!(handle.state(), EngineState::Stopped);
        assert_eq!(fixture.updater.cancelled(), 1);
        assert_eq!(fixture.restarts.cancelled(), 1);
    }

    async fn settled(store: &MemoryStore, service: &Service, nodes: &[Node]) -> bool {
        let tasks = store
            .view(|tx| tx.find_tasks(&By::ServiceId(service.id)))
            .await;
        nodes.iter().all(|n| {
            let live: Vec<&Task> = tasks
                .iter()
                .filter(|t| t.node_id == Some(n.id) && !t.is_processed())
                .collect();
            live.len() == 1 && !is_task_dirty(service, live[0], Some(n))
        })
    }

    async fn settle(store: &MemoryStore, service: &Service, nodes: &[Node]) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !settled(store, service, nodes).await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_settles_with_real_supervisors() {
        let store = Arc::new(MemoryStore::new());
        let nodes = vec![node("a"), node("b"), node("c")];
        let mut service = global_service("agent", "agent:1");
        seed_store(&store, &nodes, &[service.clone()]).await;

        let config = OrchestratorConfig {
            restart_delay_ms: 0,
            ..Default::default()
        };
        let restarts = Arc::new(RestartPolicySupervisor::new(store.clone(), &config));
        let updater = Arc::new(RollingUpdateSupervisor::new(
            store.clone(),
            UpdatePolicy::default(),
        ));
        let handle = GlobalOrchestrator::new(store.clone(), updater, restarts).spawn();
        handle.wait_for(EngineState::Running).await;
        settle(&store, &service, &nodes).await;

        // A spec change and a task failure land in the same commit.
        let mut failed = store
            .view(|tx| tx.find_tasks(&By::NodeId(nodes[0].id)))
            .await
            .remove(0);
        failed.status = TaskStatus::new(TaskState::Failed, "exit 1");
        service.spec.task.image = "agent:2".to_string();
        store
            .update(|tx| {
                tx.update_service(service.clone())?;
                tx.update_task(failed.clone())
            })
            .await
            .unwrap();

        settle(&store, &service, &nodes).await;
        // No late replacements after convergence.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(settled(&store, &service, &nodes).await);

        handle.stop().await;
    }
}
