//! Maintenance sweeps run by the queue's leader-elected loops.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use strom_core::now_unix_ms;
use strom_core::CoordinationStore;
use strom_core::EntryId;
use tracing::info;
use tracing::warn;

use crate::lock::DistributedLock;
use crate::lock::LockConfig;
use crate::queue::JobRecord;
use crate::queue::QueueInner;

/// How many pending entries one sweep pass inspects.
const PENDING_FETCH_COUNT: usize = 50;

/// Requeue jobs that sat unacknowledged past the retry window.
///
/// Jobs with retries left are atomically deleted and re-appended with a
/// bumped retry count, giving them a fresh entry id and clearing their
/// pending state in one step. Jobs out of retries, and entries that no
/// longer decode, move to the dead-letter stream instead so the queue
/// never stalls on a poison job. Pending entries whose backing stream
/// entry is gone (the stream was cleared mid-delivery) are acknowledged
/// away so they cannot pin their consumer forever.
pub(crate) async fn retry_overdue_jobs<S>(inner: &QueueInner<S>) -> anyhow::Result<()>
where
    S: CoordinationStore + ?Sized,
{
    let pending = inner
        .store
        .pending_entries(&inner.stream, &inner.group, PENDING_FETCH_COUNT)
        .await?;
    let overdue: Vec<EntryId> = pending
        .iter()
        .filter(|entry| entry.idle_ms > inner.config.retry_after_ms)
        .map(|entry| entry.id)
        .collect();
    if overdue.is_empty() {
        return Ok(());
    }

    let entries = inner.store.entries(&inner.stream, &overdue).await?;

    let fetched: HashSet<EntryId> = entries.iter().map(|entry| entry.id).collect();
    let orphaned: Vec<EntryId> = overdue
        .iter()
        .copied()
        .filter(|id| !fetched.contains(id))
        .collect();
    if !orphaned.is_empty() {
        inner
            .store
            .acknowledge(&inner.stream, &inner.group, &orphaned)
            .await?;
        info!(
            queue = %inner.name,
            count = orphaned.len(),
            "dropped pending entries with no backing job",
        );
    }

    let mut requeue_ids = Vec::new();
    let mut requeue_records = Vec::new();
    let mut exhausted = Vec::new();
    for entry in entries {
        let record: JobRecord = match serde_json::from_str(&entry.value) {
            Ok(record) => record,
            Err(error) => {
                warn!(
                    queue = %inner.name,
                    id = %entry.id,
                    error = %error,
                    "dead-lettering undecodable entry",
                );
                exhausted.push(entry.id);
                continue;
            }
        };

        if record.retries < inner.config.max_retries {
            let requeued = JobRecord {
                retries: record.retries + 1,
                enqueued_at_ms: now_unix_ms(),
                payload: record.payload,
            };
            requeue_ids.push(entry.id);
            requeue_records.push(serde_json::to_string(&requeued)?);
        } else {
            exhausted.push(entry.id);
        }
    }

    if !requeue_ids.is_empty() {
        let requeued = inner
            .store
            .delete_then_append(&inner.stream, &inner.group, &requeue_ids, requeue_records)
            .await?;
        info!(queue = %inner.name, count = requeued.len(), "requeued overdue jobs");
    }
    if !exhausted.is_empty() {
        inner
            .store
            .transfer(&inner.stream, &inner.group, &exhausted, &inner.dead_stream)
            .await?;
        warn!(
            queue = %inner.name,
            count = exhausted.len(),
            "jobs out of retries moved to the dead-letter stream",
        );
    }
    Ok(())
}

/// Delete consumers that have nothing pending and have not read for
/// `idle_threshold_ms`.
///
/// A consumer's name lock is held for its whole lifetime, so an idle but
/// healthy consumer (its lock is still leased) is skipped. Only after
/// its process dies and the lease expires does the sweep reap the group
/// entry.
pub(crate) async fn evict_idle_consumers<S>(
    inner: &QueueInner<S>,
    idle_threshold_ms: u64,
) -> anyhow::Result<()>
where
    S: CoordinationStore + ?Sized + 'static,
{
    let consumers = inner.store.consumers(&inner.stream, &inner.group).await?;
    for consumer in consumers
        .into_iter()
        .filter(|consumer| consumer.pending == 0 && consumer.idle_ms >= idle_threshold_ms)
    {
        let lock = DistributedLock::new(
            Arc::clone(&inner.store),
            consumer.name.clone(),
            LockConfig::default(),
        );
        let name = consumer.name.clone();
        let deleted = lock
            .acquire_with(Duration::ZERO, move || async move {
                inner
                    .store
                    .delete_consumer(&inner.stream, &inner.group, &name)
                    .await?;
                Ok(())
            })
            .await?;
        if deleted.is_some() {
            info!(queue = %inner.name, consumer = %consumer.name, "evicted idle consumer");
        }
    }
    Ok(())
}
