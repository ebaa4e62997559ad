//! Durable competing-consumer job queue.
//!
//! Jobs live in a stream in the coordination store; a single consumer
//! group (per queue) tracks delivery, so each job is handed to exactly
//! one consumer at a time but survives consumer crashes. Two
//! leader-elected maintenance loops run per queue: a retry sweep that
//! requeues jobs left unacknowledged past `retry_after_ms` (moving jobs
//! that exhausted their retries to the dead-letter stream), and an
//! eviction sweep that deletes consumers gone idle with nothing pending.
//!
//! Delivery is at-least-once. Job handlers must tolerate seeing a job
//! twice; `Job::retries` says how often it came back.

mod consumer;
mod sweeps;
mod types;

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use strom_core::now_unix_ms;
use strom_core::CoordinationStore;
use strom_core::EntryId;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;
use tracing::info;

use crate::error::CoordinationError;
use crate::error::InitializationLockSnafu;
use crate::lock::DistributedLock;
use crate::lock::LockConfig;
use crate::distributed_loop::DistributedLoop;
use crate::distributed_loop::LoopController;

pub use consumer::BatchConsumer;
pub use consumer::JobConsumer;
pub use types::Job;
pub use types::QueueConfig;
pub(crate) use types::JobRecord;

/// Every queue uses a single consumer group of this name.
const GROUP: &str = "queue";
/// How long a group read blocks waiting for new entries.
const BLOCK_DURATION: Duration = Duration::from_millis(2_500);
/// Budget for the cross-process initialization lock.
const INITIALIZE_BUDGET: Duration = Duration::from_millis(2_500);
/// Budget for claiming a fresh consumer's name lock.
const CONSUMER_ACQUIRE_BUDGET: Duration = Duration::from_millis(1_000);
/// Backoff after a failed group read before trying again.
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(1_000);
/// Cadence of the idle-consumer eviction loop.
const EVICTION_INTERVAL: Duration = Duration::from_millis(3_000);
const EVICTION_ACCURACY: Duration = Duration::from_millis(1_500);
/// A consumer with no pending jobs and no read for this long is evicted.
const CONSUMER_IDLE_BEFORE_EVICTION_MS: u64 = 10_000;

pub(crate) struct QueueInner<S: ?Sized> {
    pub(crate) name: String,
    pub(crate) stream: String,
    pub(crate) dead_stream: String,
    pub(crate) group: String,
    pub(crate) config: QueueConfig,
    pub(crate) store: Arc<S>,
}

/// A durable queue of `T`-typed jobs over a [`CoordinationStore`].
///
/// Cheap to construct; [`DurableQueue::initialize`] must run once per
/// process before consuming (any number of processes may race it).
pub struct DurableQueue<T, S: CoordinationStore + ?Sized + 'static> {
    inner: Arc<QueueInner<S>>,
    sweeps: Mutex<Vec<LoopController>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    _payload: PhantomData<fn() -> T>,
}

impl<T, S> DurableQueue<T, S>
where
    T: Serialize + DeserializeOwned + Send + 'static,
    S: CoordinationStore + ?Sized + 'static,
{
    pub fn new(store: Arc<S>, name: impl Into<String>, config: QueueConfig) -> Self {
        let name = name.into();
        Self {
            inner: Arc::new(QueueInner {
                stream: format!("stream:{name}"),
                dead_stream: format!("stream:{name}:dead"),
                group: GROUP.to_string(),
                name,
                config,
                store,
            }),
            sweeps: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            _payload: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Create the queue's consumer group (under a cross-process lock so
    /// concurrent initializers don't race) and start the maintenance
    /// loops on this process. Idempotent per instance.
    pub async fn initialize(&self) -> Result<(), CoordinationError> {
        let inner = &self.inner;
        let lock = DistributedLock::new(
            Arc::clone(&inner.store),
            format!("queue:{}:initialize", inner.name),
            LockConfig::default(),
        );
        let init_inner = Arc::clone(inner);
        let initialized = lock
            .acquire_with(INITIALIZE_BUDGET, move || async move {
                let inner = init_inner;
                if !inner.store.group_exists(&inner.stream, &inner.group).await? {
                    inner.store.create_group(&inner.stream, &inner.group, true).await?;
                    info!(queue = %inner.name, "created queue consumer group");
                }
                Ok(())
            })
            .await?;
        if initialized.is_none() {
            return InitializationLockSnafu { queue: inner.name.clone() }.fail();
        }

        let mut sweeps = self.sweeps_guard();
        if sweeps.is_empty() {
            let retry_after = Duration::from_millis(inner.config.retry_after_ms);
            let retry_inner = Arc::clone(inner);
            let retry_loop = DistributedLoop::new(
                Arc::clone(&inner.store),
                format!("queue:{}:retry", inner.name),
                false,
            )
            .run(
                move |_handle| {
                    let inner = Arc::clone(&retry_inner);
                    async move { sweeps::retry_overdue_jobs(&inner).await }
                },
                retry_after,
                retry_after / 2,
            );

            let evict_inner = Arc::clone(inner);
            let evict_loop = DistributedLoop::new(
                Arc::clone(&inner.store),
                format!("queue:{}:consumer-delete", inner.name),
                false,
            )
            .run(
                move |_handle| {
                    let inner = Arc::clone(&evict_inner);
                    async move {
                        sweeps::evict_idle_consumers(&inner, CONSUMER_IDLE_BEFORE_EVICTION_MS).await
                    }
                },
                EVICTION_INTERVAL,
                EVICTION_ACCURACY,
            );

            sweeps.push(retry_loop);
            sweeps.push(evict_loop);
        }
        Ok(())
    }

    /// Append one job. Returns it with its assigned entry id.
    pub async fn enqueue(&self, data: T) -> Result<Job<T>, CoordinationError> {
        let enqueued_at_ms = now_unix_ms();
        let record = JobRecord {
            retries: 0,
            enqueued_at_ms,
            payload: serde_json::to_string(&data)?,
        };
        let id = self
            .inner
            .store
            .append(&self.inner.stream, serde_json::to_string(&record)?)
            .await?;
        debug!(queue = %self.inner.name, id = %id, "job enqueued");
        Ok(Job {
            id,
            data,
            retries: 0,
            enqueued_at_ms,
        })
    }

    /// Append a batch of jobs atomically: either all land in the stream
    /// or none do. Ids are assigned in input order.
    pub async fn enqueue_many(&self, data: Vec<T>) -> Result<Vec<Job<T>>, CoordinationError> {
        let enqueued_at_ms = now_unix_ms();
        let mut records = Vec::with_capacity(data.len());
        for item in &data {
            let record = JobRecord {
                retries: 0,
                enqueued_at_ms,
                payload: serde_json::to_string(item)?,
            };
            records.push(serde_json::to_string(&record)?);
        }
        let ids = self.inner.store.append_many(&self.inner.stream, records).await?;
        debug!(queue = %self.inner.name, count = ids.len(), "jobs enqueued");

        Ok(ids
            .into_iter()
            .zip(data)
            .map(|(id, data)| Job {
                id,
                data,
                retries: 0,
                enqueued_at_ms,
            })
            .collect())
    }

    /// Acknowledge finished jobs, removing them from the queue for good.
    pub async fn acknowledge(&self, jobs: &[Job<T>]) -> Result<(), CoordinationError> {
        if jobs.is_empty() {
            return Ok(());
        }
        let ids: Vec<EntryId> = jobs.iter().map(|job| job.id).collect();
        self.inner
            .store
            .acknowledge(&self.inner.stream, &self.inner.group, &ids)
            .await?;
        Ok(())
    }

    /// Start a consumer delivering batches of up to `batch_size` jobs.
    ///
    /// The producer task reads ahead by at most one batch; dropping the
    /// returned consumer stops it.
    pub fn batch_consumer(&self, batch_size: usize) -> BatchConsumer<T> {
        let (batch_tx, batch_rx) = mpsc::channel(1);
        let cancel = self.shutdown.child_token();
        self.tracker.spawn(consumer::consume_batches(
            Arc::clone(&self.inner),
            batch_size,
            CONSUMER_ACQUIRE_BUDGET,
            BLOCK_DURATION,
            READ_ERROR_BACKOFF,
            batch_tx,
            cancel.clone(),
        ));
        BatchConsumer::new(batch_rx, cancel)
    }

    /// Like [`DurableQueue::batch_consumer`] but delivering jobs one at
    /// a time, reading ahead in batches of `batch_size`.
    pub fn job_consumer(&self, batch_size: usize) -> JobConsumer<T> {
        JobConsumer::new(self.batch_consumer(batch_size))
    }

    /// One-at-a-time consumer with no read-ahead beyond a single job.
    pub fn consumer(&self) -> JobConsumer<T> {
        self.job_consumer(1)
    }

    /// Jobs that exhausted their retries, most recent arrivals last.
    pub async fn dead_letters(&self, count: usize) -> Result<Vec<Job<T>>, CoordinationError> {
        let entries = self.inner.store.range(&self.inner.dead_stream, count).await?;
        let mut jobs = Vec::with_capacity(entries.len());
        for entry in entries {
            jobs.push(consumer::parse_job(entry)?);
        }
        Ok(jobs)
    }

    /// Drop all queued jobs. Pending deliveries stay pending until their
    /// consumers acknowledge or the retry sweep finds the entries gone.
    pub async fn clear(&self) -> Result<u64, CoordinationError> {
        let removed = self.inner.store.trim(&self.inner.stream, 0).await?;
        Ok(removed)
    }

    /// Stop maintenance loops and all consumers, waiting for their tasks
    /// to finish.
    pub async fn dispose(&self) {
        self.shutdown.cancel();
        let sweeps: Vec<LoopController> = self.sweeps_guard().drain(..).collect();
        for controller in sweeps {
            controller.stop().await;
        }
        self.tracker.close();
        self.tracker.wait().await;
        debug!(queue = %self.inner.name, "queue disposed");
    }

    fn sweeps_guard(&self) -> std::sync::MutexGuard<'_, Vec<LoopController>> {
        self.sweeps.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
