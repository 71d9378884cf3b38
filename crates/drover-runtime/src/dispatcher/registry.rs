use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use drover_core::cluster::Node;
use drover_core::{DroverError, NodeId, Result, SessionId};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::heartbeat::Heartbeat;
use super::period::PeriodChooser;

/// A live registration tying a node to its current session.
///
/// The session never changes for a record; re-registration swaps in a new
/// record under the registry's write lock, so session checks read an
/// immutable value.
#[derive(Debug)]
pub struct RegisteredNode {
    node: Node,
    session_id: SessionId,
    heartbeat: Heartbeat,
    disconnect: CancellationToken,
}

impl RegisteredNode {
    /// The node as it was when it registered.
    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Fail with `SessionInvalid` unless `session_id` is current.
    pub fn check_session(&self, session_id: SessionId) -> Result<()> {
        if self.session_id != session_id {
            return Err(DroverError::SessionInvalid);
        }
        Ok(())
    }

    /// Token cancelled when the node must drop its stream.
    pub fn disconnect_token(&self) -> CancellationToken {
        self.disconnect.clone()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnect.is_cancelled()
    }
}

/// Registry of connected nodes and their heartbeat timers.
pub struct NodeRegistry {
    chooser: PeriodChooser,
    grace_multiplier: u32,
    nodes: RwLock<HashMap<NodeId, Arc<RegisteredNode>>>,
}

impl NodeRegistry {
    /// Create a new node registry.
    pub fn new(period: Duration, epsilon: Duration, grace_multiplier: u32) -> Self {
        Self {
            chooser: PeriodChooser::new(period, epsilon),
            grace_multiplier,
            nodes: RwLock::new(HashMap::new()),
        }
    }

    fn grace_period(&self, period: Duration) -> Duration {
        period.saturating_mul(self.grace_multiplier)
    }

    /// Register a node under a fresh session.
    ///
    /// A prior registration for the same node is replaced: its heartbeat is
    /// stopped but its disconnect token is left alone, so the old stream
    /// learns about the new session on its next call. `on_expire` receives
    /// the session it was registered under.
    pub async fn add<F>(&self, node: Node, on_expire: F) -> Arc<RegisteredNode>
    where
        F: FnOnce(SessionId) + Send + 'static,
    {
        let mut nodes = self.nodes.write().await;
        if let Some(previous) = nodes.remove(&node.id) {
            previous.heartbeat.stop();
            tracing::debug!(node_id = %node.id, "Replacing existing registration");
        }

        let session_id = SessionId::new();
        let grace = self.grace_period(self.chooser.choose());
        let registered = Arc::new(RegisteredNode {
            session_id,
            heartbeat: Heartbeat::start(grace, move || on_expire(session_id)),
            disconnect: CancellationToken::new(),
            node,
        });
        nodes.insert(registered.node.id, registered.clone());
        registered
    }

    /// Look up a registration.
    pub async fn get(&self, node_id: NodeId) -> Result<Arc<RegisteredNode>> {
        self.nodes
            .read()
            .await
            .get(&node_id)
            .cloned()
            .ok_or_else(|| DroverError::NotFound("node not registered".to_string()))
    }

    /// Look up a registration and check that `session_id` is current.
    pub async fn get_with_session(
        &self,
        node_id: NodeId,
        session_id: SessionId,
    ) -> Result<Arc<RegisteredNode>> {
        let registered = self.get(node_id).await?;
        registered.check_session(session_id)?;
        Ok(registered)
    }

    /// Record a heartbeat and return the period the node must beat within.
    pub async fn heartbeat(&self, node_id: NodeId, session_id: SessionId) -> Result<Duration> {
        let registered = self.get_with_session(node_id, session_id).await?;
        let period = self.chooser.choose();
        registered.heartbeat.refresh(self.grace_period(period));
        Ok(period)
    }

    /// Remove a registration and stop its heartbeat.
    pub async fn delete(&self, node_id: NodeId) -> Option<Arc<RegisteredNode>> {
        let removed = self.nodes.write().await.remove(&node_id)?;
        removed.heartbeat.stop();
        Some(removed)
    }

    /// Remove a registration only if `session_id` is still current.
    pub async fn delete_with_session(
        &self,
        node_id: NodeId,
        session_id: SessionId,
    ) -> Option<Arc<RegisteredNode>> {
        let mut nodes = self.nodes.write().await;
        let current = nodes.get(&node_id)?;
        if current.check_session(session_id).is_err() {
            return None;
        }
        let removed = nodes.remove(&node_id)?;
        removed.heartbeat.stop();
        Some(removed)
    }

    /// Signal the node to disconnect and stop its heartbeat. The entry
    /// stays in the registry.
    pub async fn disconnect(&self, node_id: NodeId) {
        if let Some(registered) = self.nodes.read().await.get(&node_id) {
            registered.disconnect.cancel();
            registered.heartbeat.stop();
        }
    }

    /// Drop every registration.
    pub async fn clear(&self) {
        let mut nodes = self.nodes.write().await;
        for (_, registered) in nodes.drain() {
            registered.heartbeat.stop();
        }
    }

    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.nodes.read().await.is_empty()
    }
}
