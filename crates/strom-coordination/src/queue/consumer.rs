//! Queue consumers.
//!
//! Each consumer registers under a random name in the queue's consumer
//! group and holds a distributed lock on that name for as long as it
//! lives. The eviction sweep treats the lock as the liveness signal, so
//! a consumer that merely has nothing to read is never evicted while
//! its process is up.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use strom_core::CoordinationStore;
use strom_core::StreamEntry;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;
use uuid::Uuid;

use crate::lock::DistributedLock;
use crate::lock::LockConfig;
use crate::queue::Job;
use crate::queue::JobRecord;
use crate::queue::QueueInner;

/// Receives batches of jobs from one queue consumer.
///
/// Dropping the consumer (or calling [`BatchConsumer::stop`]) stops the
/// producer task; unacknowledged jobs it had claimed are requeued by the
/// retry sweep.
pub struct BatchConsumer<T> {
    batches: mpsc::Receiver<Vec<Job<T>>>,
    cancel: CancellationToken,
}

impl<T> BatchConsumer<T> {
    pub(crate) fn new(batches: mpsc::Receiver<Vec<Job<T>>>, cancel: CancellationToken) -> Self {
        Self { batches, cancel }
    }

    /// The next non-empty batch, or `None` once the consumer has stopped.
    pub async fn next_batch(&mut self) -> Option<Vec<Job<T>>> {
        self.batches.recv().await
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl<T> Drop for BatchConsumer<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Adapter turning a [`BatchConsumer`] into a one-job-at-a-time stream.
pub struct JobConsumer<T> {
    batches: BatchConsumer<T>,
    buffered: VecDeque<Job<T>>,
}

impl<T> JobConsumer<T> {
    pub(crate) fn new(batches: BatchConsumer<T>) -> Self {
        Self {
            batches,
            buffered: VecDeque::new(),
        }
    }

    /// The next job, or `None` once the consumer has stopped.
    pub async fn next(&mut self) -> Option<Job<T>> {
        loop {
            if let Some(job) = self.buffered.pop_front() {
                return Some(job);
            }
            match self.batches.next_batch().await {
                Some(batch) => self.buffered.extend(batch),
                None => return None,
            }
        }
    }

    pub fn stop(&self) {
        self.batches.stop();
    }
}

/// Producer half of a consumer: reads batches from the group and pushes
/// them into a bounded channel (capacity one, so at most one batch is
/// claimed ahead of the handler).
pub(crate) async fn consume_batches<T, S>(
    inner: Arc<QueueInner<S>>,
    batch_size: usize,
    acquire_budget: Duration,
    block: Duration,
    read_error_backoff: Duration,
    batches: mpsc::Sender<Vec<Job<T>>>,
    cancel: CancellationToken,
) where
    T: DeserializeOwned + Send + 'static,
    S: CoordinationStore + ?Sized + 'static,
{
    let consumer_name = Uuid::new_v4().to_string();
    let lock = DistributedLock::new(
        Arc::clone(&inner.store),
        consumer_name.clone(),
        LockConfig::default(),
    );
    match lock.acquire(acquire_budget).await {
        Ok(true) => {}
        Ok(false) => {
            warn!(
                queue = %inner.name,
                consumer = %consumer_name,
                "consumer name lock contended, not starting",
            );
            return;
        }
        Err(error) => {
            warn!(
                queue = %inner.name,
                consumer = %consumer_name,
                error = %error,
                "could not claim consumer name lock",
            );
            return;
        }
    }
    debug!(queue = %inner.name, consumer = %consumer_name, "consumer started");

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = inner.store.read_group(
                &inner.stream,
                &inner.group,
                &consumer_name,
                batch_size,
                block,
            ) => read,
        };

        match read {
            Ok(entries) => {
                let jobs = parse_batch(&inner, entries);
                if jobs.is_empty() {
                    continue;
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = batches.send(jobs) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
            Err(error) => {
                warn!(
                    queue = %inner.name,
                    consumer = %consumer_name,
                    error = %error,
                    "group read failed, backing off",
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(read_error_backoff) => {}
                }
            }
        }
    }

    if let Err(error) = lock.release(false).await {
        warn!(
            queue = %inner.name,
            consumer = %consumer_name,
            error = %error,
            "failed to release consumer name lock",
        );
    }
    debug!(queue = %inner.name, consumer = %consumer_name, "consumer stopped");
}

/// Decode delivered entries, dropping any that fail to parse. Undecodable
/// entries stay pending and are dealt with by the retry sweep.
fn parse_batch<T, S>(inner: &QueueInner<S>, entries: Vec<StreamEntry>) -> Vec<Job<T>>
where
    T: DeserializeOwned,
    S: ?Sized,
{
    entries
        .into_iter()
        .filter_map(|entry| {
            let id = entry.id;
            match parse_job(entry) {
                Ok(job) => Some(job),
                Err(error) => {
                    warn!(
                        queue = %inner.name,
                        id = %id,
                        error = %error,
                        "skipping undecodable job",
                    );
                    None
                }
            }
        })
        .collect()
}

pub(crate) fn parse_job<T: DeserializeOwned>(entry: StreamEntry) -> Result<Job<T>, serde_json::Error> {
    let record: JobRecord = serde_json::from_str(&entry.value)?;
    let data: T = serde_json::from_str(&record.payload)?;
    Ok(Job {
        id: entry.id,
        data,
        retries: record.retries,
        enqueued_at_ms: record.enqueued_at_ms,
    })
}
