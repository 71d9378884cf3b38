use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use drover_core::cluster::Cluster;
use drover_core::orchestrator::{Slot, UpdateSupervisor};
use drover_core::service::{Service, Task, TaskState, UpdatePolicy};
use drover_core::store::{By, MemoryStore, ReadTx, Tx};
use drover_core::{Result, ServiceId};
use tokio_util::sync::CancellationToken;

use super::{is_task_dirty, new_task};

type InFlight = Arc<Mutex<HashMap<ServiceId, (u64, CancellationToken)>>>;

/// Update supervisor that replaces outdated tasks a few slots at a time.
pub struct RollingUpdateSupervisor {
    store: Arc<MemoryStore>,
    default_policy: UpdatePolicy,
    next_id: AtomicU64,
    updates: InFlight,
}

impl RollingUpdateSupervisor {
    pub fn new(store: Arc<MemoryStore>, default_policy: UpdatePolicy) -> Self {
        Self {
            store,
            default_policy,
            next_id: AtomicU64::new(0),
            updates: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of updates that have not finished or been cancelled.
    pub fn in_flight(&self) -> usize {
        self.updates.lock().map(|updates| updates.len()).unwrap_or(0)
    }
}

impl UpdateSupervisor for RollingUpdateSupervisor {
    fn update(&self, cluster: Option<&Cluster>, service: &Service, slots: Vec<Slot>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        match self.updates.lock() {
            Ok(mut updates) => {
                if let Some((_, previous)) = updates.insert(service.id, (id, token.clone())) {
                    previous.cancel();
                }
            }
            Err(_) => return,
        }

        let policy = service.spec.update.unwrap_or(self.default_policy);
        let store = self.store.clone();
        let updates = self.updates.clone();
        let cluster = cluster.cloned();
        let service = service.clone();

        tokio::spawn(async move {
            run_update(&store, cluster.as_ref(), &service, slots, policy, &token).await;
            token.cancel();
            // A newer update for the service owns the entry now.
            if let Ok(mut updates) = updates.lock() {
                if updates.get(&service.id).is_some_and(|(current, _)| *current == id) {
                    updates.remove(&service.id);
                }
            }
        });
    }

    fn cancel_all(&self) {
        if let Ok(mut updates) = self.updates.lock() {
            for (_, (_, token)) in updates.drain() {
                token.cancel();
            }
        }
    }
}

async fn run_update(
    store: &MemoryStore,
    cluster: Option<&Cluster>,
    service: &Service,
    slots: Vec<Slot>,
    policy: UpdatePolicy,
    token: &CancellationToken,
) {
    let group_size = match policy.parallelism {
        0 => slots.len().max(1),
        n => usize::try_from(n).unwrap_or(usize::MAX),
    };

    tracing::debug!(
        service_id = %service.id,
        slots = slots.len(),
        parallelism = policy.parallelism,
        "Rolling update started"
    );

    let mut updated = 0usize;
    for (i, group) in slots.chunks(group_size).enumerate() {
        if i > 0 && !policy.delay.is_zero() {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(policy.delay) => {}
            }
        }

        for slot in group {
            if token.is_cancelled() {
                tracing::debug!(service_id = %service.id, "Rolling update cancelled");
                return;
            }

            let mut changed = false;
            let result = store
                .update(|tx| {
                    changed = update_slot(tx, cluster, service, slot)?;
                    Ok(())
                })
                .await;
            match result {
                Ok(()) if changed => updated += 1,
                Ok(()) => {}
                Err(e) => {
                    tracing::error!(service_id = %service.id, error = %e, "Failed to update slot");
                }
            }
        }
    }

    if updated > 0 {
        tracing::info!(service_id = %service.id, updated, "Rolling update completed");
    }
}

/// Bring one slot to a single task on the current spec. Returns whether
/// anything changed.
///
/// The slot is read again inside the transaction, since restarts may have
/// replaced tasks after the snapshot was taken.
fn update_slot(
    tx: &mut Tx<'_>,
    cluster: Option<&Cluster>,
    service: &Service,
    slot: &[Task],
) -> Result<bool> {
    let Some(first) = slot.first() else {
        return Ok(false);
    };
    let node = first.node_id.and_then(|id| tx.get_node(id));
    let tasks = live_slot_tasks(tx, service, slot, first);

    let keep = tasks
        .iter()
        .position(|t| !is_task_dirty(service, t, node.as_ref()));
    if keep.is_some() && tasks.len() == 1 {
        return Ok(false);
    }

    let mut changed = false;
    for (i, task) in tasks.iter().enumerate() {
        if Some(i) == keep {
            continue;
        }
        let mut task = task.clone();
        task.desired_state = TaskState::Shutdown;
        tx.update_task(task)?;
        changed = true;
    }

    if keep.is_none() {
        tx.create_task(new_task(cluster, service, first.slot, first.node_id))?;
        changed = true;
    }
    Ok(changed)
}

/// Runnable tasks currently in the same slot as `first`, snapshot tasks
/// first in snapshot order.
fn live_slot_tasks(tx: &Tx<'_>, service: &Service, slot: &[Task], first: &Task) -> Vec<Task> {
    let candidates = match first.node_id {
        Some(node_id) => tx.find_tasks(&By::NodeId(node_id)),
        None => tx.find_tasks(&By::ServiceId(service.id)),
    };
    let mut tasks: Vec<Task> = candidates
        .into_iter()
        .filter(|t| t.service_id == service.id)
        .filter(|t| t.node_id == first.node_id && t.slot == first.slot)
        .filter(|t| t.desired_state <= TaskState::Running)
        .collect();
    tasks.sort_by_key(|t| {
        slot.iter()
            .position(|s| s.id == t.id)
            .unwrap_or(usize::MAX)
    });
    tasks
}
