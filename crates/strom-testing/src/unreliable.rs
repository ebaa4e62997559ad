//! Fault-injecting store wrapper for error-path tests.

use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use strom_core::ConsumerInfo;
use strom_core::EntryId;
use strom_core::LeaseAcquire;
use strom_core::LeaseStore;
use strom_core::PendingEntry;
use strom_core::StoreError;
use strom_core::StreamEntry;
use strom_core::StreamStore;

/// Wraps a store and fails a configurable number of upcoming operations
/// with [`StoreError::Unavailable`].
///
/// Instrumented operations: group reads (consumer loops), lease
/// refreshes (lock refresh task) and lease releases (scoped lock
/// teardown). Everything else delegates unchanged.
pub struct UnreliableStore<S: ?Sized> {
    inner: Arc<S>,
    failing_reads: AtomicU32,
    failing_refreshes: AtomicU32,
    failing_releases: AtomicU32,
}

impl<S: ?Sized> UnreliableStore<S> {
    /// Wrap `inner` with no failures armed.
    pub fn new(inner: Arc<S>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            failing_reads: AtomicU32::new(0),
            failing_refreshes: AtomicU32::new(0),
            failing_releases: AtomicU32::new(0),
        })
    }

    /// Fail the next `count` calls to `read_group`.
    pub fn fail_next_reads(&self, count: u32) {
        self.failing_reads.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` calls to `refresh_lease`.
    pub fn fail_next_refreshes(&self, count: u32) {
        self.failing_refreshes.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` calls to `release_lease`.
    pub fn fail_next_releases(&self, count: u32) {
        self.failing_releases.store(count, Ordering::SeqCst);
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl<S: LeaseStore + ?Sized> LeaseStore for UnreliableStore<S> {
    async fn acquire_lease(&self, key: &str, holder: &str, expires_at_ms: u64) -> Result<LeaseAcquire, StoreError> {
        self.inner.acquire_lease(key, holder, expires_at_ms).await
    }

    async fn refresh_lease(&self, key: &str, holder: &str, expires_at_ms: u64) -> Result<bool, StoreError> {
        if Self::take_failure(&self.failing_refreshes) {
            return Err(StoreError::Unavailable {
                reason: "injected refresh failure".to_string(),
            });
        }
        self.inner.refresh_lease(key, holder, expires_at_ms).await
    }

    async fn release_lease(&self, key: &str, holder: &str) -> Result<bool, StoreError> {
        if Self::take_failure(&self.failing_releases) {
            return Err(StoreError::Unavailable {
                reason: "injected release failure".to_string(),
            });
        }
        self.inner.release_lease(key, holder).await
    }

    async fn clear_lease(&self, key: &str) -> Result<bool, StoreError> {
        self.inner.clear_lease(key).await
    }

    async fn lease_expiry(&self, key: &str, holder: &str) -> Result<u64, StoreError> {
        self.inner.lease_expiry(key, holder).await
    }
}

#[async_trait]
impl<S: StreamStore + ?Sized> StreamStore for UnreliableStore<S> {
    async fn append(&self, stream: &str, value: String) -> Result<EntryId, StoreError> {
        self.inner.append(stream, value).await
    }

    async fn append_many(&self, stream: &str, values: Vec<String>) -> Result<Vec<EntryId>, StoreError> {
        self.inner.append_many(stream, values).await
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        if Self::take_failure(&self.failing_reads) {
            return Err(StoreError::Unavailable {
                reason: "injected read failure".to_string(),
            });
        }
        self.inner.read_group(stream, group, consumer, count, block).await
    }

    async fn acknowledge(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<u64, StoreError> {
        self.inner.acknowledge(stream, group, ids).await
    }

    async fn delete_then_append(
        &self,
        stream: &str,
        group: &str,
        delete_ids: &[EntryId],
        values: Vec<String>,
    ) -> Result<Vec<EntryId>, StoreError> {
        self.inner.delete_then_append(stream, group, delete_ids, values).await
    }

    async fn transfer(
        &self,
        stream: &str,
        group: &str,
        ids: &[EntryId],
        dest_stream: &str,
    ) -> Result<Vec<EntryId>, StoreError> {
        self.inner.transfer(stream, group, ids, dest_stream).await
    }

    async fn entries(&self, stream: &str, ids: &[EntryId]) -> Result<Vec<StreamEntry>, StoreError> {
        self.inner.entries(stream, ids).await
    }

    async fn range(&self, stream: &str, count: usize) -> Result<Vec<StreamEntry>, StoreError> {
        self.inner.range(stream, count).await
    }

    async fn pending_entries(&self, stream: &str, group: &str, count: usize) -> Result<Vec<PendingEntry>, StoreError> {
        self.inner.pending_entries(stream, group, count).await
    }

    async fn consumers(&self, stream: &str, group: &str) -> Result<Vec<ConsumerInfo>, StoreError> {
        self.inner.consumers(stream, group).await
    }

    async fn delete_consumer(&self, stream: &str, group: &str, consumer: &str) -> Result<u64, StoreError> {
        self.inner.delete_consumer(stream, group, consumer).await
    }

    async fn create_group(&self, stream: &str, group: &str, create_stream: bool) -> Result<(), StoreError> {
        self.inner.create_group(stream, group, create_stream).await
    }

    async fn group_exists(&self, stream: &str, group: &str) -> Result<bool, StoreError> {
        self.inner.group_exists(stream, group).await
    }

    async fn trim(&self, stream: &str, max_len: u64) -> Result<u64, StoreError> {
        self.inner.trim(stream, max_len).await
    }
}
