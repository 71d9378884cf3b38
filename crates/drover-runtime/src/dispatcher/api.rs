use std::sync::Arc;
use std::time::Duration;

use drover_core::cluster::{Node, NodeDescription, NodeState, NodeStatus};
use drover_core::config::DispatcherConfig;
use drover_core::service::TaskStatus;
use drover_core::store::{MemoryStore, ReadTx};
use drover_core::{DroverError, NodeId, Result, SessionId, TaskId};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::registry::NodeRegistry;

/// A validated node session.
#[derive(Debug, Clone)]
pub struct Session {
    pub node_id: NodeId,
    pub session_id: SessionId,
    disconnect: CancellationToken,
}

impl Session {
    /// Resolves once the node must drop its stream and re-register.
    pub async fn disconnected(&self) {
        self.disconnect.cancelled().await
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnect.is_cancelled()
    }
}

/// Entry point for node-facing calls: registration, heartbeats and task
/// status reports.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<MemoryStore>,
    registry: Arc<NodeRegistry>,
    /// Held while a node's registration and its stored status change
    /// together, so an expiry never marks down a node that re-registered.
    transitions: Arc<Mutex<()>>,
}

impl Dispatcher {
    pub fn new(store: Arc<MemoryStore>, config: &DispatcherConfig) -> Self {
        let registry = NodeRegistry::new(
            config.heartbeat_period(),
            config.heartbeat_epsilon(),
            config.grace_period_multiplier,
        );
        Self {
            store,
            registry: Arc::new(registry),
            transitions: Arc::new(Mutex::new(())),
        }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    /// Register a node, creating it in the store on first contact, and
    /// return its new session.
    pub async fn register(
        &self,
        node_id: NodeId,
        description: Option<NodeDescription>,
    ) -> Result<SessionId> {
        let _transition = self.transitions.lock().await;
        let mut registered = None;
        self.store
            .update(|tx| {
                let ready = NodeStatus::new(NodeState::Ready, "registered");
                let node = match tx.get_node(node_id) {
                    Some(mut node) => {
                        if description.is_some() {
                            node.description = description;
                        }
                        node.status = ready;
                        tx.update_node(node.clone())?;
                        node
                    }
                    None => {
                        let mut node = Node::new(node_id);
                        node.description = description;
                        node.status = ready;
                        tx.create_node(node.clone())?;
                        node
                    }
                };
                registered = Some(node);
                Ok(())
            })
            .await?;

        let node = registered
            .ok_or_else(|| DroverError::Internal("node registration produced no node".into()))?;

        let store = self.store.clone();
        let registry = self.registry.clone();
        let transitions = self.transitions.clone();
        let entry = self
            .registry
            .add(node, move |session_id| {
                tokio::spawn(async move {
                    expire_node(&store, &registry, &transitions, node_id, session_id).await;
                });
            })
            .await;

        let session_id = entry.session_id();
        tracing::info!(node_id = %node_id, session_id = %session_id, "Node registered");
        Ok(session_id)
    }

    /// Record a heartbeat. Returns the period the node must beat within.
    pub async fn heartbeat(&self, node_id: NodeId, session_id: SessionId) -> Result<Duration> {
        self.registry.heartbeat(node_id, session_id).await
    }

    /// Validate a session and hand back a handle for the node's stream.
    pub async fn session(&self, node_id: NodeId, session_id: SessionId) -> Result<Session> {
        let entry = self.registry.get_with_session(node_id, session_id).await?;
        if entry.is_disconnected() {
            return Err(DroverError::NodeMustDisconnect);
        }
        Ok(Session {
            node_id,
            session_id,
            disconnect: entry.disconnect_token(),
        })
    }

    /// Record observed task states reported by a node.
    ///
    /// Updates for tasks that are unknown or assigned elsewhere are skipped.
    pub async fn update_task_status(
        &self,
        node_id: NodeId,
        session_id: SessionId,
        updates: Vec<(TaskId, TaskStatus)>,
    ) -> Result<()> {
        self.registry.get_with_session(node_id, session_id).await?;

        self.store
            .batch(|batch| {
                for (task_id, status) in updates {
                    let result = batch.update(|tx| {
                        let mut task = tx
                            .get_task(task_id)
                            .ok_or_else(|| DroverError::NotFound(format!("task {}", task_id)))?;
                        if task.node_id != Some(node_id) {
                            return Err(DroverError::InvalidArgument(format!(
                                "task {} is not assigned to node {}",
                                task_id, node_id
                            )));
                        }
                        task.status = status;
                        tx.update_task(task)
                    });
                    if let Err(e) = result {
                        tracing::warn!(
                            node_id = %node_id,
                            task_id = %task_id,
                            error = %e,
                            "Skipping task status update"
                        );
                    }
                }
                Ok(())
            })
            .await
    }

    /// Force a node to drop its stream. The registration stays until it
    /// re-registers or leaves.
    pub async fn disconnect(&self, node_id: NodeId) {
        self.registry.disconnect(node_id).await;
        tracing::debug!(node_id = %node_id, "Node told to disconnect");
    }

    /// Deregister a node that is shutting down cleanly.
    pub async fn leave(&self, node_id: NodeId) -> Result<()> {
        let _transition = self.transitions.lock().await;
        let entry = self
            .registry
            .delete(node_id)
            .await
            .ok_or_else(|| DroverError::NotFound("node not registered".to_string()))?;
        entry.disconnect_token().cancel();
        mark_down(&self.store, node_id, "node left").await?;
        tracing::info!(node_id = %node_id, "Node left");
        Ok(())
    }

    /// Drop every registration.
    pub async fn stop(&self) {
        self.registry.clear().await;
        tracing::info!("Dispatcher stopped");
    }
}

async fn expire_node(
    store: &MemoryStore,
    registry: &NodeRegistry,
    transitions: &Mutex<()>,
    node_id: NodeId,
    session_id: SessionId,
) {
    let _transition = transitions.lock().await;
    let Some(entry) = registry.delete_with_session(node_id, session_id).await else {
        tracing::debug!(node_id = %node_id, "Ignoring expiry of superseded session");
        return;
    };
    entry.disconnect_token().cancel();

    tracing::info!(node_id = %node_id, "Heartbeat expired, marking node down");
    if let Err(e) = mark_down(store, node_id, "heartbeat failure").await {
        tracing::error!(node_id = %node_id, error = %e, "Failed to mark node down");
    }
}

async fn mark_down(store: &MemoryStore, node_id: NodeId, message: &str) -> Result<()> {
    store
        .update(|tx| {
            let mut node = tx
                .get_node(node_id)
                .ok_or_else(|| DroverError::NotFound(format!("node {}", node_id)))?;
            node.status = NodeStatus::new(NodeState::Down, message);
            tx.update_node(node)
        })
        .await
}
