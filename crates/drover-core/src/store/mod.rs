//! In-memory transactional object store.
//!
//! Reads go through consistent snapshots, writes through transactions or
//! batches that become visible atomically, and every committed change is
//! published to watchers in commit order.

mod event;
mod tx;

pub use event::{StoreEvent, Watcher};
pub use tx::{Batch, By, ReadTx, Tables, Tx};

use tokio::sync::RwLock;

use crate::error::Result;
use event::WatchQueue;

/// Concurrency-safe in-memory store.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    queue: WatchQueue,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run a read-only function against a consistent snapshot.
    pub async fn view<R>(&self, f: impl FnOnce(&Tables) -> R) -> R {
        let tables = self.tables.read().await;
        f(&tables)
    }

    /// Run a single transaction. Either every change applies or none do.
    pub async fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Tx<'_>) -> Result<()>,
    {
        let mut tables = self.tables.write().await;
        let mut tx = Tx::new(&mut tables);
        match f(&mut tx) {
            Ok(()) => {
                let events = tx.commit();
                self.queue.publish(events).await;
                Ok(())
            }
            Err(e) => {
                tx.rollback();
                Err(e)
            }
        }
    }

    /// Run a batch of updates that commit together.
    ///
    /// Failures of individual `Batch::update` calls are returned to the
    /// caller and do not abort the batch. An error from `f` itself discards
    /// the whole batch.
    pub async fn batch<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Batch<'_>) -> Result<()>,
    {
        let mut tables = self.tables.write().await;
        let mut batch = Batch::new(Tx::new(&mut tables));
        let result = f(&mut batch);
        let tx = batch.into_tx();
        match result {
            Ok(()) => {
                let events = tx.commit();
                self.queue.publish(events).await;
                Ok(())
            }
            Err(e) => {
                tx.rollback();
                Err(e)
            }
        }
    }

    /// Subscribe to every change committed from now on.
    pub async fn watch(&self) -> Watcher {
        self.queue.watch().await
    }
}
