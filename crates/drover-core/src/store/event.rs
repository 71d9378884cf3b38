use tokio::sync::{mpsc, Mutex};

use crate::cluster::{Cluster, Node};
use crate::service::{Service, Task};

/// A committed change to the store.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    CreateNode(Node),
    UpdateNode(Node),
    DeleteNode(Node),
    CreateService(Service),
    UpdateService(Service),
    DeleteService(Service),
    CreateTask(Task),
    UpdateTask(Task),
    DeleteTask(Task),
    CreateCluster(Cluster),
    UpdateCluster(Cluster),
    DeleteCluster(Cluster),
}

impl StoreEvent {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CreateNode(_) => "create_node",
            Self::UpdateNode(_) => "update_node",
            Self::DeleteNode(_) => "delete_node",
            Self::CreateService(_) => "create_service",
            Self::UpdateService(_) => "update_service",
            Self::DeleteService(_) => "delete_service",
            Self::CreateTask(_) => "create_task",
            Self::UpdateTask(_) => "update_task",
            Self::DeleteTask(_) => "delete_task",
            Self::CreateCluster(_) => "create_cluster",
            Self::UpdateCluster(_) => "update_cluster",
            Self::DeleteCluster(_) => "delete_cluster",
        }
    }
}

/// Subscription to committed store events.
///
/// Events arrive in commit order. The channel is unbounded so a slow
/// consumer never loses events while subscribed.
pub struct Watcher {
    rx: mpsc::UnboundedReceiver<StoreEvent>,
}

impl Watcher {
    /// Wait for the next event. Returns `None` once the store is gone.
    pub async fn recv(&mut self) -> Option<StoreEvent> {
        self.rx.recv().await
    }

    /// Take the next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<StoreEvent> {
        self.rx.try_recv().ok()
    }
}

/// Fan-out queue of store events.
#[derive(Default)]
pub(crate) struct WatchQueue {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<StoreEvent>>>,
}

impl WatchQueue {
    pub(crate) async fn watch(&self) -> Watcher {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().await.push(tx);
        Watcher { rx }
    }

    /// Deliver events to every live subscriber, dropping closed ones.
    pub(crate) async fn publish(&self, events: Vec<StoreEvent>) {
        if events.is_empty() {
            return;
        }
        let mut subscribers = self.subscribers.lock().await;
        subscribers.retain(|sub| events.iter().all(|e| sub.send(e.clone()).is_ok()));
    }
}
