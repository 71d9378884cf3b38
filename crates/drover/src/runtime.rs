//! Manager runtime.
//!
//! Wires the store, the dispatcher and the global orchestrator together and
//! runs them until shutdown.

use std::sync::Arc;

use tokio::sync::broadcast;

use drover_core::cluster::Cluster;
use drover_core::config::DroverConfig;
use drover_core::error::Result;
use drover_core::store::{By, MemoryStore, ReadTx};
use drover_runtime::dispatcher::Dispatcher;
use drover_runtime::orchestrator::{
    GlobalOrchestrator, RestartPolicySupervisor, RollingUpdateSupervisor,
};

/// A single control-plane manager.
pub struct Manager {
    config: DroverConfig,
    store: Arc<MemoryStore>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Manager {
    pub fn new(config: DroverConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            store: Arc::new(MemoryStore::new()),
            shutdown_tx,
        }
    }

    pub fn config(&self) -> &DroverConfig {
        &self.config
    }

    /// The manager's object store.
    pub fn store(&self) -> Arc<MemoryStore> {
        self.store.clone()
    }

    /// Run until Ctrl-C or [`Manager::shutdown`].
    pub async fn run(&self) -> Result<()> {
        tracing::info!("drover manager starting");
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        self.ensure_cluster().await?;

        let dispatcher = Dispatcher::new(self.store.clone(), &self.config.dispatcher);
        let restarts = Arc::new(RestartPolicySupervisor::new(
            self.store.clone(),
            &self.config.orchestrator,
        ));
        let updater = Arc::new(RollingUpdateSupervisor::new(
            self.store.clone(),
            self.config.orchestrator.default_update_policy(),
        ));
        let orchestrator = GlobalOrchestrator::new(self.store.clone(), updater, restarts)
            .with_cluster_name(self.config.cluster.name.clone())
            .spawn();

        tracing::info!(
            cluster = %self.config.cluster.name,
            heartbeat_period_ms = self.config.dispatcher.heartbeat_period_ms,
            "drover manager started"
        );

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received shutdown signal");
            }
            _ = shutdown_rx.recv() => {
                tracing::info!("Received shutdown notification");
            }
        }

        tracing::info!("Starting graceful shutdown...");
        orchestrator.stop().await;
        dispatcher.stop().await;
        tracing::info!("drover manager stopped");
        Ok(())
    }

    /// Request shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Create the cluster object, or bring its task defaults in line with
    /// the configuration.
    async fn ensure_cluster(&self) -> Result<()> {
        let name = self.config.cluster.name.clone();
        let log_driver = self.config.cluster.log_driver.clone();

        self.store
            .update(|tx| {
                match tx.find_clusters(&By::Name(name.clone())).pop() {
                    Some(mut cluster) => {
                        if cluster.spec.task_defaults.log_driver != log_driver {
                            cluster.spec.task_defaults.log_driver = log_driver;
                            tx.update_cluster(cluster)?;
                        }
                    }
                    None => {
                        let mut cluster = Cluster::new(name.clone());
                        cluster.spec.task_defaults.log_driver = log_driver;
                        tx.create_cluster(cluster)?;
                    }
                }
                Ok(())
            })
            .await
    }
}
