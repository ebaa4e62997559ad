//! Store traits backing the coordination primitives.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::types::ConsumerInfo;
use crate::types::EntryId;
use crate::types::PendingEntry;
use crate::types::StreamEntry;

/// Outcome of an atomic lease acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseAcquire {
    /// The lease was free or expired and is now owned by the caller.
    Acquired,
    /// Another holder owns a valid lease.
    Held,
    /// The caller already owns a valid lease on this key.
    AlreadyOwner,
}

/// Key/holder leases with expiry and compare-and-set semantics.
///
/// Expiry timestamps are Unix milliseconds; validity comparisons are the
/// store's responsibility so that a single clock decides lease expiry.
/// Every operation is atomic with respect to concurrent callers.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Acquire the lease if it is free or expired, setting `expires_at_ms`
    /// for `holder`.
    async fn acquire_lease(&self, key: &str, holder: &str, expires_at_ms: u64) -> Result<LeaseAcquire, StoreError>;

    /// Extend the lease to `expires_at_ms` if `holder` still owns it.
    /// Returns false if ownership was lost.
    async fn refresh_lease(&self, key: &str, holder: &str, expires_at_ms: u64) -> Result<bool, StoreError>;

    /// Delete the lease if `holder` owns it. Returns whether a lease was
    /// deleted.
    async fn release_lease(&self, key: &str, holder: &str) -> Result<bool, StoreError>;

    /// Delete the lease regardless of owner. Returns whether a lease existed.
    async fn clear_lease(&self, key: &str) -> Result<bool, StoreError>;

    /// Current expiry of the lease if `holder` owns it and it has not
    /// expired, else 0.
    async fn lease_expiry(&self, key: &str, holder: &str) -> Result<u64, StoreError>;
}

/// Append-only ordered logs with competing-consumer groups.
///
/// Entries are assigned strictly increasing [`EntryId`]s. A consumer group
/// tracks the last delivered id and a pending entries list (PEL) of
/// delivered-but-unacknowledged entries. Multi-entry operations
/// (`append_many`, `delete_then_append`, `transfer`) apply atomically or
/// fail without partial effect.
#[async_trait]
pub trait StreamStore: Send + Sync {
    /// Append one entry, creating the stream if missing.
    async fn append(&self, stream: &str, value: String) -> Result<EntryId, StoreError>;

    /// Append several entries as a unit.
    async fn append_many(&self, stream: &str, values: Vec<String>) -> Result<Vec<EntryId>, StoreError>;

    /// Read up to `count` undelivered entries for `consumer` in `group`,
    /// blocking up to `block` when the stream is empty. Delivered entries
    /// enter the group's PEL.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StoreError>;

    /// Acknowledge entries: remove them from the PEL and the log.
    /// Returns the number of entries acknowledged.
    async fn acknowledge(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<u64, StoreError>;

    /// Atomically acknowledge and delete `delete_ids`, then append
    /// `values`. Returns the new ids.
    async fn delete_then_append(
        &self,
        stream: &str,
        group: &str,
        delete_ids: &[EntryId],
        values: Vec<String>,
    ) -> Result<Vec<EntryId>, StoreError>;

    /// Atomically acknowledge and delete `ids` and append their values to
    /// `dest_stream` (created if missing). Returns the ids assigned by the
    /// destination stream.
    async fn transfer(
        &self,
        stream: &str,
        group: &str,
        ids: &[EntryId],
        dest_stream: &str,
    ) -> Result<Vec<EntryId>, StoreError>;

    /// Fetch full entries by id. Missing ids are silently omitted.
    async fn entries(&self, stream: &str, ids: &[EntryId]) -> Result<Vec<StreamEntry>, StoreError>;

    /// Read up to `count` entries from the start of the stream without
    /// delivering them to any group.
    async fn range(&self, stream: &str, count: usize) -> Result<Vec<StreamEntry>, StoreError>;

    /// List up to `count` PEL entries for `group`, ordered by entry id.
    async fn pending_entries(&self, stream: &str, group: &str, count: usize) -> Result<Vec<PendingEntry>, StoreError>;

    /// List the consumers known to `group`.
    async fn consumers(&self, stream: &str, group: &str) -> Result<Vec<ConsumerInfo>, StoreError>;

    /// Remove a consumer from the group, dropping its PEL entries.
    /// Returns the number of pending entries that were dropped.
    async fn delete_consumer(&self, stream: &str, group: &str, consumer: &str) -> Result<u64, StoreError>;

    /// Create a consumer group delivering from the start of the stream.
    /// With `create_stream`, an empty stream is created if missing.
    async fn create_group(&self, stream: &str, group: &str, create_stream: bool) -> Result<(), StoreError>;

    /// Whether the group exists on the stream. False if the stream itself
    /// is missing.
    async fn group_exists(&self, stream: &str, group: &str) -> Result<bool, StoreError>;

    /// Drop entries until at most `max_len` remain. Returns the number
    /// removed.
    async fn trim(&self, stream: &str, max_len: u64) -> Result<u64, StoreError>;
}

/// Combined surface required by the coordination runtime.
pub trait CoordinationStore: LeaseStore + StreamStore {}

impl<T: LeaseStore + StreamStore + ?Sized> CoordinationStore for T {}

#[async_trait]
impl<T: LeaseStore + ?Sized> LeaseStore for Arc<T> {
    async fn acquire_lease(&self, key: &str, holder: &str, expires_at_ms: u64) -> Result<LeaseAcquire, StoreError> {
        (**self).acquire_lease(key, holder, expires_at_ms).await
    }

    async fn refresh_lease(&self, key: &str, holder: &str, expires_at_ms: u64) -> Result<bool, StoreError> {
        (**self).refresh_lease(key, holder, expires_at_ms).await
    }

    async fn release_lease(&self, key: &str, holder: &str) -> Result<bool, StoreError> {
        (**self).release_lease(key, holder).await
    }

    async fn clear_lease(&self, key: &str) -> Result<bool, StoreError> {
        (**self).clear_lease(key).await
    }

    async fn lease_expiry(&self, key: &str, holder: &str) -> Result<u64, StoreError> {
        (**self).lease_expiry(key, holder).await
    }
}

#[async_trait]
impl<T: StreamStore + ?Sized> StreamStore for Arc<T> {
    async fn append(&self, stream: &str, value: String) -> Result<EntryId, StoreError> {
        (**self).append(stream, value).await
    }

    async fn append_many(&self, stream: &str, values: Vec<String>) -> Result<Vec<EntryId>, StoreError> {
        (**self).append_many(stream, values).await
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        (**self).read_group(stream, group, consumer, count, block).await
    }

    async fn acknowledge(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<u64, StoreError> {
        (**self).acknowledge(stream, group, ids).await
    }

    async fn delete_then_append(
        &self,
        stream: &str,
        group: &str,
        delete_ids: &[EntryId],
        values: Vec<String>,
    ) -> Result<Vec<EntryId>, StoreError> {
        (**self).delete_then_append(stream, group, delete_ids, values).await
    }

    async fn transfer(
        &self,
        stream: &str,
        group: &str,
        ids: &[EntryId],
        dest_stream: &str,
    ) -> Result<Vec<EntryId>, StoreError> {
        (**self).transfer(stream, group, ids, dest_stream).await
    }

    async fn entries(&self, stream: &str, ids: &[EntryId]) -> Result<Vec<StreamEntry>, StoreError> {
        (**self).entries(stream, ids).await
    }

    async fn range(&self, stream: &str, count: usize) -> Result<Vec<StreamEntry>, StoreError> {
        (**self).range(stream, count).await
    }

    async fn pending_entries(&self, stream: &str, group: &str, count: usize) -> Result<Vec<PendingEntry>, StoreError> {
        (**self).pending_entries(stream, group, count).await
    }

    async fn consumers(&self, stream: &str, group: &str) -> Result<Vec<ConsumerInfo>, StoreError> {
        (**self).consumers(stream, group).await
    }

    async fn delete_consumer(&self, stream: &str, group: &str, consumer: &str) -> Result<u64, StoreError> {
        (**self).delete_consumer(stream, group, consumer).await
    }

    async fn create_group(&self, stream: &str, group: &str, create_stream: bool) -> Result<(), StoreError> {
        (**self).create_group(stream, group, create_stream).await
    }

    async fn group_exists(&self, stream: &str, group: &str) -> Result<bool, StoreError> {
        (**self).group_exists(stream, group).await
    }

    async fn trim(&self, stream: &str, max_len: u64) -> Result<u64, StoreError> {
        (**self).trim(stream, max_len).await
    }
}
