use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use drover_core::cluster::Cluster;
use drover_core::config::OrchestratorConfig;
use drover_core::orchestrator::{RestartSupervisor, Slot};
use drover_core::service::{RestartCondition, RestartPolicy, Service, Task, TaskState};
use drover_core::store::{MemoryStore, ReadTx, Tx};
use drover_core::{NodeId, Result, ServiceId, TaskId};
use tokio_util::sync::CancellationToken;

use super::new_task;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SlotKey {
    service_id: ServiceId,
    slot: u64,
    node_id: Option<NodeId>,
}

impl SlotKey {
    fn of(service: &Service, task: &Task) -> Self {
        Self {
            service_id: task.service_id,
            slot: task.slot,
            // Global slots are identified by node.
            node_id: if service.is_global() { task.node_id } else { None },
        }
    }
}

/// Restart supervisor applying each service's restart policy.
///
/// Replacements are created inside the caller's transaction. With a
/// restart delay the replacement starts with desired state `Ready` and is
/// promoted to `Running` once the delay elapses.
pub struct RestartPolicySupervisor {
    store: Arc<MemoryStore>,
    default_delay: Duration,
    default_max_attempts: u64,
    history: Mutex<HashMap<SlotKey, u64>>,
    cancel: Mutex<CancellationToken>,
}

impl RestartPolicySupervisor {
    pub fn new(store: Arc<MemoryStore>, config: &OrchestratorConfig) -> Self {
        Self {
            store,
            default_delay: config.restart_delay(),
            default_max_attempts: config.restart_max_attempts,
            history: Mutex::new(HashMap::new()),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    fn policy(&self, service: &Service) -> RestartPolicy {
        service.spec.task.restart.clone().unwrap_or(RestartPolicy {
            condition: RestartCondition::Any,
            delay: Some(self.default_delay),
            max_attempts: self.default_max_attempts,
        })
    }

    fn delay(&self, policy: &RestartPolicy) -> Duration {
        policy.delay.unwrap_or(self.default_delay)
    }

    fn restart_count(&self, key: &SlotKey) -> u64 {
        match self.history.lock() {
            Ok(history) => history.get(key).copied().unwrap_or(0),
            Err(_) => 0,
        }
    }

    fn record_restart(&self, key: SlotKey) {
        if let Ok(mut history) = self.history.lock() {
            *history.entry(key).or_insert(0) += 1;
        }
    }

    fn should_restart(&self, task: &Task, service: &Service) -> bool {
        let policy = self.policy(service);
        match policy.condition {
            RestartCondition::None => return false,
            RestartCondition::OnFailure if task.status.state == TaskState::Complete => {
                return false
            }
            _ => {}
        }
        if policy.max_attempts == 0 {
            return true;
        }
        self.restart_count(&SlotKey::of(service, task)) < policy.max_attempts
    }

    fn delay_start(&self, task_id: TaskId, delay: Duration) {
        let token = match self.cancel.lock() {
            Ok(cancel) => cancel.child_token(),
            Err(_) => return,
        };
        let store = self.store.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!(task_id = %task_id, "Delayed start cancelled");
                }
                _ = tokio::time::sleep(delay) => {
                    let result = store
                        .update(|tx| {
                            let Some(mut task) = tx.get_task(task_id) else {
                                return Ok(());
                            };
                            if task.desired_state != TaskState::Ready {
                                return Ok(());
                            }
                            task.desired_state = TaskState::Running;
                            tx.update_task(task)
                        })
                        .await;
                    if let Err(e) = result {
                        tracing::error!(task_id = %task_id, error = %e, "Failed to start delayed task");
                    }
                }
            }
        });
    }
}

impl RestartSupervisor for RestartPolicySupervisor {
    fn updatable_tasks_in_slot(&self, slot: &[Task], service: &Service) -> Slot {
        let running: Slot = slot
            .iter()
            .filter(|t| t.desired_state <= TaskState::Running)
            .cloned()
            .collect();
        if !running.is_empty() || self.policy(service).condition == RestartCondition::Any {
            return running;
        }

        // A task that was not restarted can still be replaced by an update.
        match slot.iter().max_by_key(|t| t.status.timestamp) {
            Some(latest) if !self.should_restart(latest, service) => vec![latest.clone()],
            _ => Vec::new(),
        }
    }

    fn restart(
        &self,
        tx: &mut Tx<'_>,
        cluster: Option<&Cluster>,
        service: &Service,
        task: Task,
    ) -> Result<()> {
        let Some(mut current) = tx.get_task(task.id) else {
            return Ok(());
        };
        if current.desired_state > TaskState::Running {
            return Ok(());
        }

        current.desired_state = TaskState::Shutdown;
        tx.update_task(current.clone())?;

        if !self.should_restart(&current, service) {
            tracing::debug!(
                task_id = %current.id,
                service_id = %service.id,
                "Restart policy declined restart"
            );
            return Ok(());
        }

        let delay = self.delay(&self.policy(service));
        let mut replacement = new_task(cluster, service, current.slot, current.node_id);
        if !delay.is_zero() {
            replacement.desired_state = TaskState::Ready;
        }
        let replacement_id = replacement.id;
        tx.create_task(replacement)?;

        self.record_restart(SlotKey::of(service, &current));
        if !delay.is_zero() {
            self.delay_start(replacement_id, delay);
        }

        tracing::info!(
            task_id = %current.id,
            replacement_id = %replacement_id,
            service_id = %service.id,
            delay_ms = millis(delay),
            "Restarting task"
        );
        Ok(())
    }

    fn clear_service_history(&self, service_id: ServiceId) {
        if let Ok(mut history) = self.history.lock() {
            history.retain(|key, _| key.service_id != service_id);
        }
    }

    fn cancel_all(&self) {
        if let Ok(mut cancel) = self.cancel.lock() {
            cancel.cancel();
            *cancel = CancellationToken::new();
        }
    }
}

/// Whole milliseconds, saturating at `u64::MAX`.
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
