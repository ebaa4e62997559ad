//! In-memory coordination store.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use strom_core::ConsumerInfo;
use strom_core::EntryId;
use strom_core::LeaseAcquire;
use strom_core::LeaseStore;
use strom_core::PendingEntry;
use strom_core::StoreError;
use strom_core::StreamEntry;
use strom_core::StreamStore;
use strom_core::now_unix_ms;
use tokio::sync::Notify;

struct Lease {
    holder: String,
    expires_at_ms: u64,
}

struct PelEntry {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u32,
}

#[derive(Default)]
struct GroupState {
    last_delivered: u64,
    pel: BTreeMap<u64, PelEntry>,
    consumers: HashMap<String, Instant>,
}

#[derive(Default)]
struct StreamState {
    entries: BTreeMap<u64, String>,
    groups: HashMap<String, GroupState>,
}

/// A deterministic in-memory coordination store.
///
/// Entry ids are assigned from a single monotonic counter, so ids are
/// strictly increasing within every stream. Lease expiry is judged against
/// this process's clock, which doubles as the store clock in tests.
pub struct MemoryCoordinationStore {
    leases: Mutex<HashMap<String, Lease>>,
    streams: Mutex<HashMap<String, StreamState>>,
    next_id: AtomicU64,
    appended: Notify,
}

impl Default for MemoryCoordinationStore {
    fn default() -> Self {
        Self::new_inner()
    }
}

impl MemoryCoordinationStore {
    /// Create a new store wrapped in `Arc`.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::new_inner())
    }

    fn new_inner() -> Self {
        Self {
            leases: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            appended: Notify::new(),
        }
    }

    fn assign_id(&self) -> EntryId {
        EntryId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn streams(&self) -> std::sync::MutexGuard<'_, HashMap<String, StreamState>> {
        self.streams.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn leases(&self) -> std::sync::MutexGuard<'_, HashMap<String, Lease>> {
        self.leases.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Try to deliver up to `count` undelivered entries to `consumer`.
    /// Returns `Ok(None)` when the group has nothing new.
    fn try_claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Option<Vec<StreamEntry>>, StoreError> {
        let mut streams = self.streams();
        let state = streams.get_mut(stream).ok_or_else(|| StoreError::GroupNotFound {
            stream: stream.to_string(),
            group: group.to_string(),
        })?;
        let group_state = state.groups.get_mut(group).ok_or_else(|| StoreError::GroupNotFound {
            stream: stream.to_string(),
            group: group.to_string(),
        })?;

        // Reading registers the consumer and refreshes its idle clock.
        group_state.consumers.insert(consumer.to_string(), Instant::now());

        let claimed: Vec<StreamEntry> = state
            .entries
            .range((group_state.last_delivered + 1)..)
            .take(count)
            .map(|(id, value)| StreamEntry {
                id: EntryId(*id),
                value: value.clone(),
            })
            .collect();

        if claimed.is_empty() {
            return Ok(None);
        }

        for entry in &claimed {
            group_state.last_delivered = entry.id.0;
            group_state.pel.insert(entry.id.0, PelEntry {
                consumer: consumer.to_string(),
                delivered_at: Instant::now(),
                delivery_count: 1,
            });
        }

        Ok(Some(claimed))
    }

    fn append_locked(state: &mut StreamState, id: EntryId, value: String) {
        state.entries.insert(id.0, value);
    }
}

#[async_trait]
impl LeaseStore for MemoryCoordinationStore {
    async fn acquire_lease(&self, key: &str, holder: &str, expires_at_ms: u64) -> Result<LeaseAcquire, StoreError> {
        let mut leases = self.leases();
        let now = now_unix_ms();

        match leases.get(key) {
            Some(lease) if lease.expires_at_ms > now => {
                if lease.holder == holder {
                    Ok(LeaseAcquire::AlreadyOwner)
                } else {
                    Ok(LeaseAcquire::Held)
                }
            }
            _ => {
                leases.insert(key.to_string(), Lease {
                    holder: holder.to_string(),
                    expires_at_ms,
                });
                Ok(LeaseAcquire::Acquired)
            }
        }
    }

    async fn refresh_lease(&self, key: &str, holder: &str, expires_at_ms: u64) -> Result<bool, StoreError> {
        let mut leases = self.leases();
        let now = now_unix_ms();

        match leases.get_mut(key) {
            Some(lease) if lease.holder == holder && lease.expires_at_ms > now => {
                lease.expires_at_ms = expires_at_ms;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lease(&self, key: &str, holder: &str) -> Result<bool, StoreError> {
        let mut leases = self.leases();
        match leases.get(key) {
            Some(lease) if lease.holder == holder => {
                leases.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn clear_lease(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.leases().remove(key).is_some())
    }

    async fn lease_expiry(&self, key: &str, holder: &str) -> Result<u64, StoreError> {
        let leases = self.leases();
        let now = now_unix_ms();
        match leases.get(key) {
            Some(lease) if lease.holder == holder && lease.expires_at_ms > now => Ok(lease.expires_at_ms),
            _ => Ok(0),
        }
    }
}

#[async_trait]
impl StreamStore for MemoryCoordinationStore {
    async fn append(&self, stream: &str, value: String) -> Result<EntryId, StoreError> {
        let id = self.assign_id();
        {
            let mut streams = self.streams();
            let state = streams.entry(stream.to_string()).or_default();
            Self::append_locked(state, id, value);
        }
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn append_many(&self, stream: &str, values: Vec<String>) -> Result<Vec<EntryId>, StoreError> {
        let mut ids = Vec::with_capacity(values.len());
        {
            let mut streams = self.streams();
            let state = streams.entry(stream.to_string()).or_default();
            for value in values {
                let id = self.assign_id();
                Self::append_locked(state, id, value);
                ids.push(id);
            }
        }
        self.appended.notify_waiters();
        Ok(ids)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let deadline = Instant::now() + block;

        loop {
            let notified = self.appended.notified();

            if let Some(entries) = self.try_claim(stream, group, consumer, count)? {
                return Ok(entries);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(remaining) => return Ok(Vec::new()),
            }
        }
    }

    async fn acknowledge(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<u64, StoreError> {
        let mut streams = self.streams();
        let state = match streams.get_mut(stream) {
            Some(state) => state,
            None => return Ok(0),
        };

        let mut acknowledged = 0u64;
        for id in ids {
            if let Some(group_state) = state.groups.get_mut(group) {
                if group_state.pel.remove(&id.0).is_some() {
                    acknowledged += 1;
                }
            }
            state.entries.remove(&id.0);
        }

        Ok(acknowledged)
    }

    async fn delete_then_append(
        &self,
        stream: &str,
        group: &str,
        delete_ids: &[EntryId],
        values: Vec<String>,
    ) -> Result<Vec<EntryId>, StoreError> {
        let mut new_ids = Vec::with_capacity(values.len());
        {
            let mut streams = self.streams();
            let state = streams.get_mut(stream).ok_or_else(|| StoreError::StreamNotFound {
                stream: stream.to_string(),
            })?;

            for id in delete_ids {
                if let Some(group_state) = state.groups.get_mut(group) {
                    group_state.pel.remove(&id.0);
                }
                state.entries.remove(&id.0);
            }

            for value in values {
                let id = self.assign_id();
                Self::append_locked(state, id, value);
                new_ids.push(id);
            }
        }
        self.appended.notify_waiters();
        Ok(new_ids)
    }

    async fn transfer(
        &self,
        stream: &str,
        group: &str,
        ids: &[EntryId],
        dest_stream: &str,
    ) -> Result<Vec<EntryId>, StoreError> {
        let mut new_ids = Vec::with_capacity(ids.len());
        {
            let mut streams = self.streams();

            let mut values = Vec::with_capacity(ids.len());
            {
                let state = streams.get_mut(stream).ok_or_else(|| StoreError::StreamNotFound {
                    stream: stream.to_string(),
                })?;

                for id in ids {
                    if let Some(group_state) = state.groups.get_mut(group) {
                        group_state.pel.remove(&id.0);
                    }
                    if let Some(value) = state.entries.remove(&id.0) {
                        values.push(value);
                    }
                }
            }

            let dest = streams.entry(dest_stream.to_string()).or_default();
            for value in values {
                let id = self.assign_id();
                Self::append_locked(dest, id, value);
                new_ids.push(id);
            }
        }
        self.appended.notify_waiters();
        Ok(new_ids)
    }

    async fn entries(&self, stream: &str, ids: &[EntryId]) -> Result<Vec<StreamEntry>, StoreError> {
        let streams = self.streams();
        let state = match streams.get(stream) {
            Some(state) => state,
            None => return Ok(Vec::new()),
        };

        Ok(ids
            .iter()
            .filter_map(|id| {
                state.entries.get(&id.0).map(|value| StreamEntry {
                    id: *id,
                    value: value.clone(),
                })
            })
            .collect())
    }

    async fn range(&self, stream: &str, count: usize) -> Result<Vec<StreamEntry>, StoreError> {
        let streams = self.streams();
        let state = match streams.get(stream) {
            Some(state) => state,
            None => return Ok(Vec::new()),
        };

        Ok(state
            .entries
            .iter()
            .take(count)
            .map(|(id, value)| StreamEntry {
                id: EntryId(*id),
                value: value.clone(),
            })
            .collect())
    }

    async fn pending_entries(&self, stream: &str, group: &str, count: usize) -> Result<Vec<PendingEntry>, StoreError> {
        let streams = self.streams();
        let state = streams.get(stream).ok_or_else(|| StoreError::StreamNotFound {
            stream: stream.to_string(),
        })?;
        let group_state = state.groups.get(group).ok_or_else(|| StoreError::GroupNotFound {
            stream: stream.to_string(),
            group: group.to_string(),
        })?;

        Ok(group_state
            .pel
            .iter()
            .take(count)
            .map(|(id, entry)| PendingEntry {
                id: EntryId(*id),
                consumer: entry.consumer.clone(),
                idle_ms: entry.delivered_at.elapsed().as_millis() as u64,
                delivery_count: entry.delivery_count,
            })
            .collect())
    }

    async fn consumers(&self, stream: &str, group: &str) -> Result<Vec<ConsumerInfo>, StoreError> {
        let streams = self.streams();
        let state = streams.get(stream).ok_or_else(|| StoreError::StreamNotFound {
            stream: stream.to_string(),
        })?;
        let group_state = state.groups.get(group).ok_or_else(|| StoreError::GroupNotFound {
            stream: stream.to_string(),
            group: group.to_string(),
        })?;

        Ok(group_state
            .consumers
            .iter()
            .map(|(name, last_active)| ConsumerInfo {
                name: name.clone(),
                pending: group_state.pel.values().filter(|e| &e.consumer == name).count() as u64,
                idle_ms: last_active.elapsed().as_millis() as u64,
            })
            .collect())
    }

    async fn delete_consumer(&self, stream: &str, group: &str, consumer: &str) -> Result<u64, StoreError> {
        let mut streams = self.streams();
        let state = match streams.get_mut(stream) {
            Some(state) => state,
            None => return Ok(0),
        };
        let group_state = match state.groups.get_mut(group) {
            Some(group_state) => group_state,
            None => return Ok(0),
        };

        group_state.consumers.remove(consumer);
        let before = group_state.pel.len();
        group_state.pel.retain(|_, entry| entry.consumer != consumer);
        Ok((before - group_state.pel.len()) as u64)
    }

    async fn create_group(&self, stream: &str, group: &str, create_stream: bool) -> Result<(), StoreError> {
        let mut streams = self.streams();

        if !streams.contains_key(stream) {
            if !create_stream {
                return Err(StoreError::StreamNotFound {
                    stream: stream.to_string(),
                });
            }
            streams.insert(stream.to_string(), StreamState::default());
        }

        let state = streams.get_mut(stream).expect("stream inserted above");
        state.groups.entry(group.to_string()).or_default();
        Ok(())
    }

    async fn group_exists(&self, stream: &str, group: &str) -> Result<bool, StoreError> {
        let streams = self.streams();
        Ok(streams.get(stream).map(|s| s.groups.contains_key(group)).unwrap_or(false))
    }

    async fn trim(&self, stream: &str, max_len: u64) -> Result<u64, StoreError> {
        let mut streams = self.streams();
        let state = match streams.get_mut(stream) {
            Some(state) => state,
            None => return Ok(0),
        };

        let mut removed = 0u64;
        while state.entries.len() as u64 > max_len {
            let first = *state.entries.keys().next().expect("non-empty map");
            state.entries.remove(&first);
            removed += 1;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lease_acquire_refresh_release() {
        let store = MemoryCoordinationStore::new();
        let expiry = now_unix_ms() + 1_000;

        assert_eq!(store.acquire_lease("l", "a", expiry).await.unwrap(), LeaseAcquire::Acquired);
        assert_eq!(store.acquire_lease("l", "b", expiry).await.unwrap(), LeaseAcquire::Held);
        assert_eq!(store.acquire_lease("l", "a", expiry).await.unwrap(), LeaseAcquire::AlreadyOwner);

        assert!(store.refresh_lease("l", "a", expiry + 500).await.unwrap());
        assert!(!store.refresh_lease("l", "b", expiry + 500).await.unwrap());

        assert!(!store.release_lease("l", "b").await.unwrap());
        assert!(store.release_lease("l", "a").await.unwrap());
        assert_eq!(store.lease_expiry("l", "a").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn expired_lease_is_acquirable() {
        let store = MemoryCoordinationStore::new();
        let past = now_unix_ms().saturating_sub(10);

        assert_eq!(store.acquire_lease("l", "a", past).await.unwrap(), LeaseAcquire::Acquired);
        assert_eq!(
            store.acquire_lease("l", "b", now_unix_ms() + 1_000).await.unwrap(),
            LeaseAcquire::Acquired
        );
    }

    #[tokio::test]
    async fn group_read_tracks_pending() {
        let store = MemoryCoordinationStore::new();
        store.create_group("s", "g", true).await.unwrap();

        let id = store.append("s", "one".to_string()).await.unwrap();
        let entries = store.read_group("s", "g", "c1", 10, Duration::ZERO).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, id);

        // Same consumer gets nothing more; entry sits in the PEL.
        let again = store.read_group("s", "g", "c1", 10, Duration::ZERO).await.unwrap();
        assert!(again.is_empty());

        let pending = store.pending_entries("s", "g", 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].consumer, "c1");

        let acked = store.acknowledge("s", "g", &[id]).await.unwrap();
        assert_eq!(acked, 1);
        assert!(store.pending_entries("s", "g", 10).await.unwrap().is_empty());
        assert!(store.entries("s", &[id]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn blocked_read_wakes_on_append() {
        let store = MemoryCoordinationStore::new();
        store.create_group("s", "g", true).await.unwrap();

        let reader = {
            let store = store.clone();
            tokio::spawn(
                async move { store.read_group("s", "g", "c1", 1, Duration::from_secs(5)).await },
            )
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        store.append("s", "late".to_string()).await.unwrap();

        let entries = reader.await.unwrap().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].value, "late");
    }

    #[tokio::test]
    async fn delete_then_append_is_atomic_swap() {
        let store = MemoryCoordinationStore::new();
        store.create_group("s", "g", true).await.unwrap();

        let id = store.append("s", "v1".to_string()).await.unwrap();
        store.read_group("s", "g", "c1", 1, Duration::ZERO).await.unwrap();

        let new_ids = store
            .delete_then_append("s", "g", &[id], vec!["v2".to_string()])
            .await
            .unwrap();
        assert_eq!(new_ids.len(), 1);
        assert!(new_ids[0] > id);

        assert!(store.pending_entries("s", "g", 10).await.unwrap().is_empty());
        let redelivered = store.read_group("s", "g", "c2", 1, Duration::ZERO).await.unwrap();
        assert_eq!(redelivered[0].value, "v2");
    }

    #[tokio::test]
    async fn transfer_moves_entries_between_streams() {
        let store = MemoryCoordinationStore::new();
        store.create_group("s", "g", true).await.unwrap();

        let id = store.append("s", "doomed".to_string()).await.unwrap();
        store.read_group("s", "g", "c1", 1, Duration::ZERO).await.unwrap();

        store.transfer("s", "g", &[id], "s:dead").await.unwrap();

        assert!(store.entries("s", &[id]).await.unwrap().is_empty());
        let dead = store.range("s:dead", 10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].value, "doomed");
    }

    #[tokio::test]
    async fn delete_consumer_drops_its_pending() {
        let store = MemoryCoordinationStore::new();
        store.create_group("s", "g", true).await.unwrap();
        store.append("s", "x".to_string()).await.unwrap();
        store.read_group("s", "g", "c1", 1, Duration::ZERO).await.unwrap();

        let dropped = store.delete_consumer("s", "g", "c1").await.unwrap();
        assert_eq!(dropped, 1);
        assert!(store.consumers("s", "g").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_group_requires_stream_unless_told() {
        let store = MemoryCoordinationStore::new();
        assert!(store.create_group("missing", "g", false).await.is_err());
        store.create_group("made", "g", true).await.unwrap();
        assert!(store.group_exists("made", "g").await.unwrap());
        assert!(!store.group_exists("missing", "g").await.unwrap());
    }
}
