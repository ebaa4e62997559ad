use serde::Deserialize;
use serde::Serialize;
use strom_core::EntryId;

/// Retry policy for a [`DurableQueue`](super::DurableQueue).
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// How long a delivered job may sit unacknowledged before the retry
    /// sweep requeues it.
    pub retry_after_ms: u64,
    /// Requeue attempts before a job is moved to the dead-letter stream.
    pub max_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            retry_after_ms: 30_000,
            max_retries: 3,
        }
    }
}

/// Wire form of a queued job. The payload stays an opaque JSON string so
/// the sweeps can rewrite retry metadata without knowing the job type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct JobRecord {
    pub retries: u32,
    pub enqueued_at_ms: u64,
    pub payload: String,
}

/// A job delivered to (or returned from) a queue.
#[derive(Debug, Clone)]
pub struct Job<T> {
    /// Stream entry id. Changes on every requeue.
    pub id: EntryId,
    pub data: T,
    /// How many times this job has been requeued after going overdue.
    pub retries: u32,
    pub enqueued_at_ms: u64,
}
