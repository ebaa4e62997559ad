//! Leader-elected periodic loop.
//!
//! Every participating process runs the same tick cycle: try to grab the
//! loop's lock with a zero budget, and if that single attempt wins, run
//! the iteration function, hold the lock until the interval has passed,
//! then release it. Losers nap for the accuracy window and try again, so
//! the tick cadence is kept within `accuracy` of the target even when the
//! current leader dies mid-hold.

use std::future::Future;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use strom_core::LeaseStore;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::lock::DistributedLock;
use crate::lock::LockConfig;

struct LoopShared {
    stop: CancellationToken,
    paused: watch::Sender<bool>,
    interval_ms: AtomicU64,
    accuracy_ms: AtomicU64,
}

/// Cloneable control surface for a running loop.
///
/// The iteration function receives one of these, so a loop can pause or
/// retime itself from inside a tick.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    /// Stop scheduling new iterations on this process. Other processes
    /// are unaffected. An iteration already in flight finishes.
    pub fn pause(&self) {
        self.shared.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.shared.paused.send_replace(false);
    }

    /// Adjust interval and/or accuracy. Takes effect from the next tick.
    pub fn set_timing(&self, interval: Option<Duration>, accuracy: Option<Duration>) {
        if let Some(interval) = interval {
            self.shared
                .interval_ms
                .store(interval.as_millis() as u64, Ordering::SeqCst);
        }
        if let Some(accuracy) = accuracy {
            self.shared
                .accuracy_ms
                .store(accuracy.as_millis() as u64, Ordering::SeqCst);
        }
    }

    /// Ask the loop task to wind down.
    pub fn request_stop(&self) {
        self.shared.stop.cancel();
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(self.shared.interval_ms.load(Ordering::SeqCst))
    }

    fn accuracy(&self) -> Duration {
        Duration::from_millis(self.shared.accuracy_ms.load(Ordering::SeqCst))
    }
}

/// Owner of a running loop task. Dropping it does not stop the loop;
/// call [`LoopController::stop`] for a clean shutdown.
pub struct LoopController {
    handle: LoopHandle,
    errors: mpsc::UnboundedReceiver<anyhow::Error>,
    task: JoinHandle<()>,
}

impl LoopController {
    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    pub fn pause(&self) {
        self.handle.pause();
    }

    pub fn resume(&self) {
        self.handle.resume();
    }

    pub fn set_timing(&self, interval: Option<Duration>, accuracy: Option<Duration>) {
        self.handle.set_timing(interval, accuracy);
    }

    /// Receive the next iteration error. Errors are reported here whether
    /// or not the loop is configured to stop on them.
    pub async fn recv_error(&mut self) -> Option<anyhow::Error> {
        self.errors.recv().await
    }

    /// Stop the loop and wait for the task to finish. Any held loop lock
    /// is released on the way out.
    pub async fn stop(self) {
        self.handle.request_stop();
        if let Err(error) = self.task.await {
            warn!(error = %error, "loop task terminated abnormally");
        }
    }
}

/// Factory for leader-elected loops over a shared [`LeaseStore`].
pub struct DistributedLoop<S: LeaseStore + ?Sized> {
    store: Arc<S>,
    name: String,
    stop_on_error: bool,
    lock_config: LockConfig,
}

impl<S: LeaseStore + ?Sized + 'static> DistributedLoop<S> {
    /// `stop_on_error` makes an iteration error terminate this process's
    /// participation; otherwise errors are logged, reported and the loop
    /// carries on.
    pub fn new(store: Arc<S>, name: impl Into<String>, stop_on_error: bool) -> Self {
        Self {
            store,
            name: name.into(),
            stop_on_error,
            lock_config: LockConfig::default(),
        }
    }

    /// Override the lease timing of the loop's internal lock.
    pub fn with_lock_config(mut self, lock_config: LockConfig) -> Self {
        self.lock_config = lock_config;
        self
    }

    /// Start ticking `f` every `interval`, electing a leader per tick.
    ///
    /// `accuracy` bounds how stale a dead leader's tick slot can get: it
    /// is the retry cadence of the non-leaders.
    pub fn run<F, Fut>(&self, mut f: F, interval: Duration, accuracy: Duration) -> LoopController
    where
        F: FnMut(LoopHandle) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let shared = Arc::new(LoopShared {
            stop: CancellationToken::new(),
            paused: watch::channel(false).0,
            interval_ms: AtomicU64::new(interval.as_millis() as u64),
            accuracy_ms: AtomicU64::new(accuracy.as_millis() as u64),
        });
        let handle = LoopHandle { shared };
        let (error_tx, error_rx) = mpsc::unbounded_channel();

        let store = Arc::clone(&self.store);
        let name = self.name.clone();
        let lock_config = self.lock_config.clone();
        let stop_on_error = self.stop_on_error;
        let loop_handle = handle.clone();

        let task = tokio::spawn(async move {
            let lock = DistributedLock::new(store, format!("loop:{name}"), lock_config);
            let stop = loop_handle.shared.stop.clone();
            let mut paused = loop_handle.shared.paused.subscribe();

            loop {
                if stop.is_cancelled() {
                    break;
                }

                // Wait out a pause before contending for the tick.
                tokio::select! {
                    _ = stop.cancelled() => break,
                    result = paused.wait_for(|paused| !*paused) => {
                        if result.is_err() {
                            break;
                        }
                    }
                }

                let tick_started = Instant::now();
                match lock.acquire(Duration::ZERO).await {
                    Ok(true) => {
                        let failed = match f(loop_handle.clone()).await {
                            Ok(()) => false,
                            Err(error) => {
                                warn!(name = %name, error = %error, "loop iteration failed");
                                let _ = error_tx.send(error);
                                true
                            }
                        };

                        if failed && stop_on_error {
                            if let Err(error) = lock.release(false).await {
                                warn!(name = %name, error = %error, "failed to release loop lock");
                            }
                            debug!(name = %name, "loop stopping after iteration error");
                            break;
                        }

                        // Hold the lock for the rest of the interval so no
                        // other process double-fires this tick.
                        let hold = loop_handle.interval().saturating_sub(tick_started.elapsed());
                        tokio::select! {
                            _ = stop.cancelled() => {}
                            _ = tokio::time::sleep(hold) => {}
                        }
                        if let Err(error) = lock.release(false).await {
                            warn!(name = %name, error = %error, "failed to release loop lock");
                        }
                    }
                    Ok(false) => {
                        let nap = loop_handle.accuracy().saturating_sub(tick_started.elapsed());
                        tokio::select! {
                            _ = stop.cancelled() => {}
                            _ = tokio::time::sleep(nap) => {}
                        }
                    }
                    Err(error) => {
                        warn!(name = %name, error = %error, "loop lock acquisition failed");
                        let _ = error_tx.send(anyhow::Error::new(error));
                        tokio::select! {
                            _ = stop.cancelled() => {}
                            _ = tokio::time::sleep(loop_handle.accuracy()) => {}
                        }
                    }
                }
            }

            if lock.owned() {
                if let Err(error) = lock.release(false).await {
                    warn!(name = %name, error = %error, "failed to release loop lock");
                }
            }
        });

        LoopController {
            handle,
            errors: error_rx,
            task,
        }
    }
}
