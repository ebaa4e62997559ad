//! Per-process factory for coordination primitives.

use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use strom_core::CoordinationStore;
use tracing::debug;

use crate::distributed_loop::DistributedLoop;
use crate::lock::DistributedLock;
use crate::lock::LockConfig;
use crate::queue::DurableQueue;
use crate::queue::QueueConfig;

/// Anything the provider must wind down on shutdown.
#[async_trait]
pub trait Disposable: Send + Sync {
    async fn dispose(&self);
}

#[async_trait]
impl<T, S> Disposable for DurableQueue<T, S>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
    S: CoordinationStore + ?Sized + 'static,
{
    async fn dispose(&self) {
        DurableQueue::dispose(self).await;
    }
}

/// Hands out locks, loops and queues over one shared store and disposes
/// of everything it created in reverse creation order.
pub struct CoordinationProvider<S: CoordinationStore + ?Sized + 'static> {
    store: Arc<S>,
    disposables: Mutex<Vec<Arc<dyn Disposable>>>,
}

impl<S: CoordinationStore + ?Sized + 'static> CoordinationProvider<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            disposables: Mutex::new(Vec::new()),
        }
    }

    pub fn store(&self) -> Arc<S> {
        Arc::clone(&self.store)
    }

    pub fn lock(&self, name: impl Into<String>) -> DistributedLock<S> {
        DistributedLock::new(Arc::clone(&self.store), name, LockConfig::default())
    }

    pub fn loop_runner(&self, name: impl Into<String>, stop_on_error: bool) -> DistributedLoop<S> {
        DistributedLoop::new(Arc::clone(&self.store), name, stop_on_error)
    }

    /// Create a queue and register it for disposal.
    pub fn queue<T>(&self, name: impl Into<String>, config: QueueConfig) -> Arc<DurableQueue<T, S>>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let queue = Arc::new(DurableQueue::new(Arc::clone(&self.store), name, config));
        self.disposables_guard().push(Arc::clone(&queue) as Arc<dyn Disposable>);
        queue
    }

    /// Dispose of all registered resources, newest first.
    pub async fn dispose(&self) {
        let disposables: Vec<Arc<dyn Disposable>> = {
            let mut guard = self.disposables_guard();
            guard.drain(..).collect()
        };
        for disposable in disposables.into_iter().rev() {
            disposable.dispose().await;
        }
        debug!("coordination provider disposed");
    }

    fn disposables_guard(&self) -> std::sync::MutexGuard<'_, Vec<Arc<dyn Disposable>>> {
        self.disposables
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
