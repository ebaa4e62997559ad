//! Lease-based distributed lock.
//!
//! A lock name maps to a lease record in the coordination store. Holding
//! the lock means owning an unexpired lease for that name; the store's
//! compare-and-set acquire ("grant if free, expired, or already mine")
//! makes acquisition race-free without any coordination beyond the store.
//!
//! While held, a background task refreshes the lease before it expires.
//! If refresh definitively fails (another holder took over) or the lease
//! lapses during a store outage, ownership is dropped locally and the
//! [`DistributedLock::lock_lost`] channel fires once.

use std::future::Future;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use strom_core::now_unix_ms;
use strom_core::LeaseAcquire;
use strom_core::LeaseStore;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;
use uuid::Uuid;

use crate::error::AlreadyOwnedSnafu;
use crate::error::CoordinationError;

/// Lease timing for a [`DistributedLock`].
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// How long each granted or refreshed lease is valid.
    pub lease_ms: u64,
    /// Delay between acquisition attempts while contended, and the floor
    /// for the refresh interval.
    pub retry_delay_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_ms: 10_000,
            retry_delay_ms: 50,
        }
    }
}

/// Named mutual exclusion across processes, backed by a [`LeaseStore`].
///
/// Each instance has a unique holder id, so two locks for the same name
/// in the same process still contend like separate processes.
pub struct DistributedLock<S: LeaseStore + ?Sized> {
    store: Arc<S>,
    key: String,
    holder_id: String,
    config: LockConfig,
    /// Local view of our lease expiry; 0 when not held.
    expires_at_ms: Arc<AtomicU64>,
    lock_lost: watch::Sender<bool>,
    refresh_cancel: Mutex<Option<CancellationToken>>,
}

impl<S: LeaseStore + ?Sized + 'static> DistributedLock<S> {
    pub fn new(store: Arc<S>, key: impl Into<String>, config: LockConfig) -> Self {
        let (lock_lost, _) = watch::channel(false);
        Self {
            store,
            key: key.into(),
            holder_id: Uuid::new_v4().to_string(),
            config,
            expires_at_ms: Arc::new(AtomicU64::new(0)),
            lock_lost,
            refresh_cancel: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether this instance currently believes it holds the lock.
    ///
    /// Local view only; the refresh task keeps it honest within one
    /// refresh interval.
    pub fn owned(&self) -> bool {
        self.expires_at_ms.load(Ordering::SeqCst) > now_unix_ms()
    }

    /// Receiver that flips to `true` exactly once if a held lock is lost
    /// without an explicit release.
    pub fn lock_lost(&self) -> watch::Receiver<bool> {
        self.lock_lost.subscribe()
    }

    /// Try to acquire the lock, retrying for up to `budget`.
    ///
    /// A zero budget still makes exactly one attempt. Returns `Ok(false)`
    /// when the budget elapses without acquisition, and
    /// [`CoordinationError::AlreadyOwned`] if this instance already holds
    /// the lock.
    pub async fn acquire(&self, budget: Duration) -> Result<bool, CoordinationError> {
        let started = Instant::now();
        loop {
            let expires_at_ms = now_unix_ms() + self.config.lease_ms;
            match self
                .store
                .acquire_lease(&self.key, &self.holder_id, expires_at_ms)
                .await?
            {
                LeaseAcquire::Acquired => {
                    self.expires_at_ms.store(expires_at_ms, Ordering::SeqCst);
                    self.start_refresh_task();
                    debug!(key = %self.key, "lock acquired");
                    return Ok(true);
                }
                LeaseAcquire::AlreadyOwner => {
                    return AlreadyOwnedSnafu { key: self.key.clone() }.fail();
                }
                LeaseAcquire::Held => {}
            }

            if started.elapsed() >= budget {
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
        }
    }

    /// Run `f` under the lock, releasing afterwards even if `f` fails.
    ///
    /// Returns `Ok(None)` when the lock could not be acquired within
    /// `budget`. A store failure during release is surfaced, unless `f`
    /// itself failed, in which case `f`'s error takes precedence and the
    /// release failure is only logged (the lease expires on its own).
    pub async fn acquire_with<F, Fut, T>(
        &self,
        budget: Duration,
        f: F,
    ) -> Result<Option<T>, CoordinationError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CoordinationError>>,
    {
        if !self.acquire(budget).await? {
            return Ok(None);
        }
        let outcome = f().await;
        let released = self.release(false).await;
        match outcome {
            Ok(value) => {
                released?;
                Ok(Some(value))
            }
            Err(error) => {
                if let Err(release_error) = released {
                    warn!(key = %self.key, error = %release_error, "failed to release scoped lock");
                }
                Err(error)
            }
        }
    }

    /// Release the lock. With `force`, the lease is cleared regardless of
    /// who holds it; otherwise only our own lease is removed.
    ///
    /// Returns whether a lease was actually removed. Releasing a lock we
    /// do not hold is a no-op returning `Ok(false)`.
    pub async fn release(&self, force: bool) -> Result<bool, CoordinationError> {
        self.stop_refresh_task();
        let released = if force {
            self.store.clear_lease(&self.key).await?
        } else {
            self.store.release_lease(&self.key, &self.holder_id).await?
        };
        self.expires_at_ms.store(0, Ordering::SeqCst);
        if released {
            debug!(key = %self.key, force, "lock released");
        }
        Ok(released)
    }

    /// Re-read our lease from the store and adopt its expiry as the local
    /// view. Useful after a suspected partition to resynchronize.
    pub async fn force_update_owned(&self) -> Result<bool, CoordinationError> {
        let expires_at_ms = self.store.lease_expiry(&self.key, &self.holder_id).await?;
        self.expires_at_ms.store(expires_at_ms, Ordering::SeqCst);
        Ok(expires_at_ms > now_unix_ms())
    }

    /// Spawn the lease refresh task for a freshly acquired lock.
    fn start_refresh_task(&self) {
        let token = CancellationToken::new();
        {
            let mut slot = match self.refresh_cancel.lock() {
                Ok(slot) => slot,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(previous) = slot.replace(token.clone()) {
                previous.cancel();
            }
        }

        let store = Arc::clone(&self.store);
        let key = self.key.clone();
        let holder_id = self.holder_id.clone();
        let expires_at_ms = Arc::clone(&self.expires_at_ms);
        let lock_lost = self.lock_lost.clone();
        let config = self.config.clone();

        tokio::spawn(async move {
            let mut lost = false;
            loop {
                // Sleep a quarter of the remaining lease so several refresh
                // attempts fit into one lease window, tolerating transient
                // store failures.
                let remaining = expires_at_ms
                    .load(Ordering::SeqCst)
                    .saturating_sub(now_unix_ms());
                let delay = (remaining / 4).max(config.retry_delay_ms);
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                }

                let new_expiry = now_unix_ms() + config.lease_ms;
                match store.refresh_lease(&key, &holder_id, new_expiry).await {
                    Ok(true) => {
                        expires_at_ms.store(new_expiry, Ordering::SeqCst);
                    }
                    Ok(false) => {
                        // The lease is gone or another holder took over.
                        lost = true;
                        break;
                    }
                    Err(error) => {
                        warn!(key = %key, error = %error, "lease refresh attempt failed");
                        if expires_at_ms.load(Ordering::SeqCst) <= now_unix_ms() {
                            lost = true;
                            break;
                        }
                    }
                }
            }

            if lost && !token.is_cancelled() {
                expires_at_ms.store(0, Ordering::SeqCst);
                warn!(key = %key, "lock lost");
                lock_lost.send_replace(true);
            }
        });
    }

    fn stop_refresh_task(&self) {
        let token = {
            let mut slot = match self.refresh_cancel.lock() {
                Ok(slot) => slot,
                Err(poisoned) => poisoned.into_inner(),
            };
            slot.take()
        };
        if let Some(token) = token {
            token.cancel();
        }
    }
}

impl<S: LeaseStore + ?Sized> Drop for DistributedLock<S> {
    fn drop(&mut self) {
        // Stop refreshing so an unreleased lease expires on its own.
        let token = {
            let mut slot = match self.refresh_cancel.lock() {
                Ok(slot) => slot,
                Err(poisoned) => poisoned.into_inner(),
            };
            slot.take()
        };
        if let Some(token) = token {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strom_testing::MemoryCoordinationStore;
    use strom_testing::UnreliableStore;

    fn fast_config() -> LockConfig {
        LockConfig {
            lease_ms: 200,
            retry_delay_ms: 20,
        }
    }

    #[tokio::test]
    async fn single_winner_under_contention() {
        let store = MemoryCoordinationStore::new();
        let mut handles = Vec::new();
        for _ in 0..5 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let lock = DistributedLock::new(store, "contended", LockConfig::default());
                lock.acquire(Duration::ZERO).await.unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn zero_budget_makes_one_attempt() {
        let store = MemoryCoordinationStore::new();
        let first = DistributedLock::new(Arc::clone(&store), "once", LockConfig::default());
        assert!(first.acquire(Duration::ZERO).await.unwrap());

        let second = DistributedLock::new(store, "once", LockConfig::default());
        let started = Instant::now();
        assert!(!second.acquire(Duration::ZERO).await.unwrap());
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn reacquire_while_held_is_an_error() {
        let store = MemoryCoordinationStore::new();
        let lock = DistributedLock::new(store, "double", LockConfig::default());
        assert!(lock.acquire(Duration::ZERO).await.unwrap());
        let error = lock.acquire(Duration::ZERO).await.unwrap_err();
        assert!(matches!(error, CoordinationError::AlreadyOwned { .. }));
    }

    #[tokio::test]
    async fn budget_bounds_the_retry_window() {
        let store = MemoryCoordinationStore::new();
        let first = DistributedLock::new(Arc::clone(&store), "budget", LockConfig::default());
        assert!(first.acquire(Duration::ZERO).await.unwrap());

        let second = DistributedLock::new(store, "budget", fast_config());
        let started = Instant::now();
        assert!(!second.acquire(Duration::from_millis(100)).await.unwrap());
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn expired_lease_of_dead_holder_is_acquirable() {
        let store = MemoryCoordinationStore::new();
        let dead = DistributedLock::new(Arc::clone(&store), "crashy", fast_config());
        assert!(dead.acquire(Duration::ZERO).await.unwrap());
        // Dropping without release stops the refresh task; the lease then
        // runs out on its own.
        drop(dead);
        tokio::time::sleep(Duration::from_millis(300)).await;

        let successor = DistributedLock::new(store, "crashy", fast_config());
        assert!(successor.acquire(Duration::ZERO).await.unwrap());
    }

    #[tokio::test]
    async fn refresh_keeps_lease_alive_past_its_duration() {
        let store = MemoryCoordinationStore::new();
        let lock = DistributedLock::new(Arc::clone(&store), "held", fast_config());
        assert!(lock.acquire(Duration::ZERO).await.unwrap());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(lock.owned());

        let rival = DistributedLock::new(store, "held", fast_config());
        assert!(!rival.acquire(Duration::ZERO).await.unwrap());
    }

    #[tokio::test]
    async fn transient_refresh_failures_are_tolerated() {
        let memory = MemoryCoordinationStore::new();
        let store = UnreliableStore::new(Arc::clone(&memory));
        let lock = DistributedLock::new(
            Arc::clone(&store),
            "flaky",
            LockConfig {
                lease_ms: 400,
                retry_delay_ms: 20,
            },
        );
        assert!(lock.acquire(Duration::ZERO).await.unwrap());

        store.fail_next_refreshes(2);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(lock.owned());
    }

    #[tokio::test]
    async fn lock_lost_fires_once_when_lease_vanishes() {
        let store = MemoryCoordinationStore::new();
        let lock = DistributedLock::new(Arc::clone(&store), "stolen", fast_config());
        let mut lost = lock.lock_lost();
        assert!(lock.acquire(Duration::ZERO).await.unwrap());

        // Simulate an operator wiping the lease out from under us.
        assert!(store.clear_lease("stolen").await.unwrap());

        tokio::time::timeout(Duration::from_secs(2), lost.changed())
            .await
            .expect("lock loss was not signalled")
            .unwrap();
        assert!(*lost.borrow());
        assert!(!lock.owned());
    }

    #[tokio::test]
    async fn release_without_holding_returns_false() {
        let store = MemoryCoordinationStore::new();
        let lock = DistributedLock::new(store, "never-held", LockConfig::default());
        assert!(!lock.release(false).await.unwrap());
    }

    #[tokio::test]
    async fn forced_release_evicts_a_foreign_holder() {
        let store = MemoryCoordinationStore::new();
        let owner = DistributedLock::new(Arc::clone(&store), "evicted", LockConfig::default());
        assert!(owner.acquire(Duration::ZERO).await.unwrap());

        let other = DistributedLock::new(store, "evicted", LockConfig::default());
        assert!(!other.release(false).await.unwrap());
        assert!(other.release(true).await.unwrap());
        assert!(other.acquire(Duration::ZERO).await.unwrap());
    }

    #[tokio::test]
    async fn scoped_acquire_releases_on_error() {
        let store = MemoryCoordinationStore::new();
        let lock = DistributedLock::new(Arc::clone(&store), "scoped", LockConfig::default());

        let result: Result<Option<()>, _> = lock
            .acquire_with(Duration::ZERO, || async {
                Err(CoordinationError::from(strom_core::StoreError::Unavailable {
                    reason: "boom".to_string(),
                }))
            })
            .await;
        assert!(result.is_err());

        // The lock must be free again despite the failed closure.
        let next = DistributedLock::new(store, "scoped", LockConfig::default());
        assert!(next.acquire(Duration::ZERO).await.unwrap());
    }

    #[tokio::test]
    async fn scoped_acquire_surfaces_release_failure() {
        let memory = MemoryCoordinationStore::new();
        let store = UnreliableStore::new(Arc::clone(&memory));
        let lock = DistributedLock::new(Arc::clone(&store), "sticky", LockConfig::default());

        store.fail_next_releases(1);
        let result = lock.acquire_with(Duration::ZERO, || async { Ok(7) }).await;
        assert!(matches!(result, Err(CoordinationError::Storage { .. })));

        // When the closure itself failed, its error wins over the
        // release failure.
        let rerun = DistributedLock::new(store.clone(), "sticky2", LockConfig::default());
        store.fail_next_releases(1);
        let result: Result<Option<()>, _> = rerun
            .acquire_with(Duration::ZERO, || async {
                Err(CoordinationError::AlreadyOwned {
                    key: "inner".to_string(),
                })
            })
            .await;
        assert!(matches!(result, Err(CoordinationError::AlreadyOwned { .. })));
    }

    #[tokio::test]
    async fn scoped_acquire_reports_contention_as_none() {
        let store = MemoryCoordinationStore::new();
        let owner = DistributedLock::new(Arc::clone(&store), "busy", LockConfig::default());
        assert!(owner.acquire(Duration::ZERO).await.unwrap());

        let other = DistributedLock::new(store, "busy", LockConfig::default());
        let outcome = other
            .acquire_with(Duration::ZERO, || async { Ok(42) })
            .await
            .unwrap();
        assert_eq!(outcome, None);
    }

    #[tokio::test]
    async fn force_update_adopts_the_stored_expiry() {
        let store = MemoryCoordinationStore::new();
        let lock = DistributedLock::new(Arc::clone(&store), "synced", LockConfig::default());
        assert!(lock.acquire(Duration::ZERO).await.unwrap());

        assert!(lock.force_update_owned().await.unwrap());

        assert!(store.clear_lease("synced").await.unwrap());
        assert!(!lock.force_update_owned().await.unwrap());
        assert!(!lock.owned());
    }
}
