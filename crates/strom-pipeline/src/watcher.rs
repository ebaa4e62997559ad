//! Catalog freshness watcher.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use strom_coordination::DistributedLoop;
use strom_coordination::DurableQueue;
use strom_coordination::LoopController;
use strom_core::CoordinationStore;
use tracing::info;

use crate::collaborators::CatalogSource;
use crate::jobs::ImportJob;

/// Leader-elected loop that polls the catalog source and enqueues an
/// [`ImportJob`] whenever a newer catalog is advertised.
///
/// The high-water mark is per process; after a leadership change the new
/// leader may enqueue an import for a catalog that was already handled.
/// That duplicate is harmless: entry ids are content-derived, so a
/// re-import upserts the same records.
pub struct CatalogWatcher<S: CoordinationStore + ?Sized + 'static> {
    store: Arc<S>,
    source: Arc<dyn CatalogSource>,
    import_queue: Arc<DurableQueue<ImportJob, S>>,
    last_enqueued: Arc<AtomicU64>,
}

impl<S: CoordinationStore + ?Sized + 'static> CatalogWatcher<S> {
    pub fn new(
        store: Arc<S>,
        source: Arc<dyn CatalogSource>,
        import_queue: Arc<DurableQueue<ImportJob, S>>,
    ) -> Self {
        Self {
            store,
            source,
            import_queue,
            last_enqueued: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Start watching. Stop via the returned controller.
    pub fn run(&self, interval: Duration, accuracy: Duration) -> LoopController {
        let source = Arc::clone(&self.source);
        let import_queue = Arc::clone(&self.import_queue);
        let last_enqueued = Arc::clone(&self.last_enqueued);

        DistributedLoop::new(Arc::clone(&self.store), "catalog-watcher", false).run(
            move |_handle| {
                let source = Arc::clone(&source);
                let import_queue = Arc::clone(&import_queue);
                let last_enqueued = Arc::clone(&last_enqueued);
                async move {
                    let latest = source.latest_timestamp().await?;
                    if latest > last_enqueued.load(Ordering::SeqCst) {
                        import_queue
                            .enqueue(ImportJob {
                                catalog_timestamp: latest,
                            })
                            .await?;
                        last_enqueued.store(latest, Ordering::SeqCst);
                        info!(catalog_timestamp = latest, "newer catalog found, import enqueued");
                    }
                    Ok(())
                }
            },
            interval,
            accuracy,
        )
    }
}
