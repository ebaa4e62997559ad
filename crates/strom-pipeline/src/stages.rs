//! Queue-driven pipeline stages: import, save, index.
//!
//! Each stage is a plain consumer loop over its input queue. A failed
//! job is logged and left unacknowledged, so the queue's retry sweep
//! redelivers it (at-least-once); a job that exhausts its retries lands
//! in the dead-letter stream for operators. Stages exit when their queue
//! is disposed.

use std::sync::Arc;

use strom_coordination::DurableQueue;
use strom_coordination::Job;
use strom_core::CoordinationStore;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::collaborators::CatalogSource;
use crate::collaborators::EntryRepository;
use crate::collaborators::SearchIndexer;
use crate::jobs::ImportJob;
use crate::jobs::IndexBatch;
use crate::jobs::SaveBatch;

/// Turns an [`ImportJob`] into chunks of entries on the save queue.
pub struct Importer<S: CoordinationStore + ?Sized + 'static> {
    source: Arc<dyn CatalogSource>,
    import_queue: Arc<DurableQueue<ImportJob, S>>,
    save_queue: Arc<DurableQueue<SaveBatch, S>>,
    chunk_size: usize,
}

impl<S: CoordinationStore + ?Sized + 'static> Importer<S> {
    pub fn new(
        source: Arc<dyn CatalogSource>,
        import_queue: Arc<DurableQueue<ImportJob, S>>,
        save_queue: Arc<DurableQueue<SaveBatch, S>>,
        chunk_size: usize,
    ) -> Self {
        Self {
            source,
            import_queue,
            save_queue,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Consume import jobs until the queue is disposed.
    pub async fn run(&self) {
        let mut consumer = self.import_queue.consumer();
        while let Some(job) = consumer.next().await {
            match self.import(&job.data).await {
                Ok(count) => {
                    info!(
                        catalog_timestamp = job.data.catalog_timestamp,
                        entries = count,
                        "catalog imported",
                    );
                    self.finish(job).await;
                }
                Err(error) => {
                    warn!(
                        catalog_timestamp = job.data.catalog_timestamp,
                        error = %error,
                        "import failed, job will be retried",
                    );
                }
            }
        }
        debug!("importer stopped");
    }

    async fn import(&self, job: &ImportJob) -> anyhow::Result<usize> {
        let entries = self.source.fetch(job.catalog_timestamp).await?;
        let total = entries.len();
        for chunk in entries.chunks(self.chunk_size) {
            self.save_queue
                .enqueue(SaveBatch {
                    entries: chunk.to_vec(),
                })
                .await?;
        }
        Ok(total)
    }

    async fn finish(&self, job: Job<ImportJob>) {
        if let Err(error) = self.import_queue.acknowledge(&[job]).await {
            warn!(error = %error, "import acknowledge failed, job will be redelivered");
        }
    }
}

/// Persists entry chunks and forwards their ids to the index queue.
pub struct Saver<S: CoordinationStore + ?Sized + 'static> {
    repository: Arc<dyn EntryRepository>,
    save_queue: Arc<DurableQueue<SaveBatch, S>>,
    index_queue: Arc<DurableQueue<IndexBatch, S>>,
}

impl<S: CoordinationStore + ?Sized + 'static> Saver<S> {
    pub fn new(
        repository: Arc<dyn EntryRepository>,
        save_queue: Arc<DurableQueue<SaveBatch, S>>,
        index_queue: Arc<DurableQueue<IndexBatch, S>>,
    ) -> Self {
        Self {
            repository,
            save_queue,
            index_queue,
        }
    }

    pub async fn run(&self) {
        let mut consumer = self.save_queue.consumer();
        while let Some(job) = consumer.next().await {
            match self.save(&job.data).await {
                Ok(()) => {
                    debug!(entries = job.data.entries.len(), "entry chunk saved");
                    if let Err(error) = self.save_queue.acknowledge(&[job]).await {
                        warn!(error = %error, "save acknowledge failed, chunk will be redelivered");
                    }
                }
                Err(error) => {
                    warn!(error = %error, "saving entry chunk failed, chunk will be retried");
                }
            }
        }
        debug!("saver stopped");
    }

    async fn save(&self, batch: &SaveBatch) -> anyhow::Result<()> {
        self.repository.save(&batch.entries).await?;
        let ids = batch.entries.iter().map(|entry| entry.id.clone()).collect();
        self.index_queue.enqueue(IndexBatch { ids }).await?;
        Ok(())
    }
}

/// Loads persisted entries by id and feeds them to the search backend.
pub struct Indexer<S: CoordinationStore + ?Sized + 'static> {
    repository: Arc<dyn EntryRepository>,
    search: Arc<dyn SearchIndexer>,
    index_queue: Arc<DurableQueue<IndexBatch, S>>,
}

impl<S: CoordinationStore + ?Sized + 'static> Indexer<S> {
    pub fn new(
        repository: Arc<dyn EntryRepository>,
        search: Arc<dyn SearchIndexer>,
        index_queue: Arc<DurableQueue<IndexBatch, S>>,
    ) -> Self {
        Self {
            repository,
            search,
            index_queue,
        }
    }

    pub async fn run(&self) {
        let mut consumer = self.index_queue.consumer();
        while let Some(job) = consumer.next().await {
            match self.index(&job.data).await {
                Ok(count) => {
                    debug!(entries = count, "entries indexed");
                    if let Err(error) = self.index_queue.acknowledge(&[job]).await {
                        warn!(error = %error, "index acknowledge failed, batch will be redelivered");
                    }
                }
                Err(error) => {
                    warn!(error = %error, "indexing failed, batch will be retried");
                }
            }
        }
        debug!("indexer stopped");
    }

    async fn index(&self, batch: &IndexBatch) -> anyhow::Result<usize> {
        let entries = self.repository.load(&batch.ids).await?;
        self.search.index(&entries).await?;
        Ok(entries.len())
    }
}
