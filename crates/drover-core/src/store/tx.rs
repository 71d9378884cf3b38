use std::collections::BTreeMap;

use super::event::StoreEvent;
use crate::cluster::{Cluster, Node};
use crate::error::{DroverError, Result};
use crate::id::{ClusterId, NodeId, ServiceId, TaskId};
use crate::service::{Service, Task};

/// Lookup filter for `find_*` queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum By {
    /// Every object of the kind.
    All,
    /// Objects with this name. Tasks match on their service name.
    Name(String),
    /// Nodes with this ID, or tasks assigned to this node.
    NodeId(NodeId),
    /// Services with this ID, or tasks belonging to this service.
    ServiceId(ServiceId),
}

/// Read access shared by snapshots and write transactions.
pub trait ReadTx {
    fn get_node(&self, id: NodeId) -> Option<Node>;
    fn get_service(&self, id: ServiceId) -> Option<Service>;
    fn get_task(&self, id: TaskId) -> Option<Task>;
    fn get_cluster(&self, id: ClusterId) -> Option<Cluster>;
    fn find_nodes(&self, by: &By) -> Vec<Node>;
    fn find_services(&self, by: &By) -> Vec<Service>;
    fn find_tasks(&self, by: &By) -> Vec<Task>;
    fn find_clusters(&self, by: &By) -> Vec<Cluster>;
}

/// The store's object tables.
#[derive(Debug, Default)]
pub struct Tables {
    nodes: BTreeMap<NodeId, Node>,
    services: BTreeMap<ServiceId, Service>,
    tasks: BTreeMap<TaskId, Task>,
    clusters: BTreeMap<ClusterId, Cluster>,
}

impl ReadTx for Tables {
    fn get_node(&self, id: NodeId) -> Option<Node> {
        self.nodes.get(&id).cloned()
    }

    fn get_service(&self, id: ServiceId) -> Option<Service> {
        self.services.get(&id).cloned()
    }

    fn get_task(&self, id: TaskId) -> Option<Task> {
        self.tasks.get(&id).cloned()
    }

    fn get_cluster(&self, id: ClusterId) -> Option<Cluster> {
        self.clusters.get(&id).cloned()
    }

    fn find_nodes(&self, by: &By) -> Vec<Node> {
        self.nodes
            .values()
            .filter(|n| match by {
                By::All => true,
                By::Name(name) => &n.spec.name == name,
                By::NodeId(id) => &n.id == id,
                By::ServiceId(_) => false,
            })
            .cloned()
            .collect()
    }

    fn find_services(&self, by: &By) -> Vec<Service> {
        self.services
            .values()
            .filter(|s| match by {
                By::All => true,
                By::Name(name) => &s.spec.name == name,
                By::ServiceId(id) => &s.id == id,
                By::NodeId(_) => false,
            })
            .cloned()
            .collect()
    }

    fn find_tasks(&self, by: &By) -> Vec<Task> {
        self.tasks
            .values()
            .filter(|t| match by {
                By::All => true,
                By::Name(name) => &t.service_name == name,
                By::NodeId(id) => t.node_id.as_ref() == Some(id),
                By::ServiceId(id) => &t.service_id == id,
            })
            .cloned()
            .collect()
    }

    fn find_clusters(&self, by: &By) -> Vec<Cluster> {
        self.clusters
            .values()
            .filter(|c| match by {
                By::All => true,
                By::Name(name) => &c.spec.name == name,
                By::NodeId(_) | By::ServiceId(_) => false,
            })
            .cloned()
            .collect()
    }
}

/// Prior value of a mutated row, replayed on rollback.
enum Undo {
    Node(NodeId, Option<Node>),
    Service(ServiceId, Option<Service>),
    Task(TaskId, Option<Task>),
    Cluster(ClusterId, Option<Cluster>),
}

trait StoreObject: Clone + Sized {
    type Id: Ord + Copy + std::fmt::Display;
    const KIND: &'static str;

    fn id(&self) -> Self::Id;
    fn table(tables: &mut Tables) -> &mut BTreeMap<Self::Id, Self>;
    fn undo(id: Self::Id, prev: Option<Self>) -> Undo;
    fn created(self) -> StoreEvent;
    fn updated(self) -> StoreEvent;
    fn deleted(self) -> StoreEvent;
}

macro_rules! store_object {
    ($ty:ty, $id:ty, $kind:literal, $table:ident, $undo:ident, $create:ident, $update:ident, $delete:ident) => {
        impl StoreObject for $ty {
            type Id = $id;
            const KIND: &'static str = $kind;

            fn id(&self) -> $id {
                self.id
            }

            fn table(tables: &mut Tables) -> &mut BTreeMap<$id, Self> {
                &mut tables.$table
            }

            fn undo(id: $id, prev: Option<Self>) -> Undo {
                Undo::$undo(id, prev)
            }

            fn created(self) -> StoreEvent {
                StoreEvent::$create(self)
            }

            fn updated(self) -> StoreEvent {
                StoreEvent::$update(self)
            }

            fn deleted(self) -> StoreEvent {
                StoreEvent::$delete(self)
            }
        }
    };
}

store_object!(Node, NodeId, "node", nodes, Node, CreateNode, UpdateNode, DeleteNode);
store_object!(Service, ServiceId, "service", services, Service, CreateService, UpdateService, DeleteService);
store_object!(Task, TaskId, "task", tasks, Task, CreateTask, UpdateTask, DeleteTask);
store_object!(Cluster, ClusterId, "cluster", clusters, Cluster, CreateCluster, UpdateCluster, DeleteCluster);

/// A write transaction.
///
/// Mutations apply in place while the store's write lock is held; nothing
/// is visible to readers until the owning `update` or `batch` commits.
pub struct Tx<'a> {
    tables: &'a mut Tables,
    undo: Vec<Undo>,
    events: Vec<StoreEvent>,
}

/// Position to roll back to.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Savepoint {
    undo: usize,
    events: usize,
}

impl<'a> Tx<'a> {
    pub(crate) fn new(tables: &'a mut Tables) -> Self {
        Self {
            tables,
            undo: Vec::new(),
            events: Vec::new(),
        }
    }

    fn create<T: StoreObject>(&mut self, obj: T) -> Result<()> {
        let id = obj.id();
        let table = T::table(self.tables);
        if table.contains_key(&id) {
            return Err(DroverError::AlreadyExists(format!("{} {}", T::KIND, id)));
        }
        table.insert(id, obj.clone());
        self.undo.push(T::undo(id, None));
        self.events.push(obj.created());
        Ok(())
    }

    fn update<T: StoreObject>(&mut self, obj: T) -> Result<()> {
        let id = obj.id();
        let table = T::table(self.tables);
        if !table.contains_key(&id) {
            return Err(DroverError::NotFound(format!("{} {}", T::KIND, id)));
        }
        let prev = table.insert(id, obj.clone());
        self.undo.push(T::undo(id, prev));
        self.events.push(obj.updated());
        Ok(())
    }

    fn delete<T: StoreObject>(&mut self, id: T::Id) -> Result<()> {
        let prev = T::table(self.tables)
            .remove(&id)
            .ok_or_else(|| DroverError::NotFound(format!("{} {}", T::KIND, id)))?;
        self.undo.push(T::undo(id, Some(prev.clone())));
        self.events.push(prev.deleted());
        Ok(())
    }

    pub fn create_node(&mut self, node: Node) -> Result<()> {
        self.create(node)
    }

    pub fn update_node(&mut self, node: Node) -> Result<()> {
        self.update(node)
    }

    pub fn delete_node(&mut self, id: NodeId) -> Result<()> {
        self.delete::<Node>(id)
    }

    pub fn create_service(&mut self, service: Service) -> Result<()> {
        self.create(service)
    }

    pub fn update_service(&mut self, service: Service) -> Result<()> {
        self.update(service)
    }

    pub fn delete_service(&mut self, id: ServiceId) -> Result<()> {
        self.delete::<Service>(id)
    }

    pub fn create_task(&mut self, task: Task) -> Result<()> {
        self.create(task)
    }

    pub fn update_task(&mut self, task: Task) -> Result<()> {
        self.update(task)
    }

    pub fn delete_task(&mut self, id: TaskId) -> Result<()> {
        self.delete::<Task>(id)
    }

    pub fn create_cluster(&mut self, cluster: Cluster) -> Result<()> {
        self.create(cluster)
    }

    pub fn update_cluster(&mut self, cluster: Cluster) -> Result<()> {
        self.update(cluster)
    }

    pub fn delete_cluster(&mut self, id: ClusterId) -> Result<()> {
        self.delete::<Cluster>(id)
    }

    pub(crate) fn savepoint(&self) -> Savepoint {
        Savepoint {
            undo: self.undo.len(),
            events: self.events.len(),
        }
    }

    pub(crate) fn rollback_to(&mut self, savepoint: Savepoint) {
        while self.undo.len() > savepoint.undo {
            let Some(entry) = self.undo.pop() else { break };
            match entry {
                Undo::Node(id, prev) => restore(&mut self.tables.nodes, id, prev),
                Undo::Service(id, prev) => restore(&mut self.tables.services, id, prev),
                Undo::Task(id, prev) => restore(&mut self.tables.tasks, id, prev),
                Undo::Cluster(id, prev) => restore(&mut self.tables.clusters, id, prev),
            }
        }
        self.events.truncate(savepoint.events);
    }

    pub(crate) fn rollback(mut self) {
        self.rollback_to(Savepoint { undo: 0, events: 0 });
    }

    /// Finish the transaction, returning the events to publish.
    pub(crate) fn commit(self) -> Vec<StoreEvent> {
        self.events
    }
}

fn restore<K: Ord, V>(table: &mut BTreeMap<K, V>, id: K, prev: Option<V>) {
    match prev {
        Some(value) => {
            table.insert(id, value);
        }
        None => {
            table.remove(&id);
        }
    }
}

impl ReadTx for Tx<'_> {
    fn get_node(&self, id: NodeId) -> Option<Node> {
        self.tables.get_node(id)
    }

    fn get_service(&self, id: ServiceId) -> Option<Service> {
        self.tables.get_service(id)
    }

    fn get_task(&self, id: TaskId) -> Option<Task> {
        self.tables.get_task(id)
    }

    fn get_cluster(&self, id: ClusterId) -> Option<Cluster> {
        self.tables.get_cluster(id)
    }

    fn find_nodes(&self, by: &By) -> Vec<Node> {
        self.tables.find_nodes(by)
    }

    fn find_services(&self, by: &By) -> Vec<Service> {
        self.tables.find_services(by)
    }

    fn find_tasks(&self, by: &By) -> Vec<Task> {
        self.tables.find_tasks(by)
    }

    fn find_clusters(&self, by: &By) -> Vec<Cluster> {
        self.tables.find_clusters(by)
    }
}

/// A group of updates committed together.
///
/// Each `update` call is a savepoint: if its closure fails, only that
/// closure's changes are discarded.
pub struct Batch<'a> {
    tx: Tx<'a>,
}

impl<'a> Batch<'a> {
    pub(crate) fn new(tx: Tx<'a>) -> Self {
        Self { tx }
    }

    /// Apply one update to the batch.
    pub fn update<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Tx<'a>) -> Result<()>,
    {
        let savepoint = self.tx.savepoint();
        let result = f(&mut self.tx);
        if result.is_err() {
            self.tx.rollback_to(savepoint);
        }
        result
    }

    pub(crate) fn into_tx(self) -> Tx<'a> {
        self.tx
    }
}
