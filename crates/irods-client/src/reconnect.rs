//! Periodic socket renewal
//!
//! A server that issued a reconnect cookie accepts a fresh socket on its
//! reconnect port in place of the current one. The manager does that on a
//! fixed interval from its own task until it is stopped or the connection
//! it serves is dropped.

use crate::error::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Something whose socket can be renewed in place
#[async_trait]
pub(crate) trait Reconnectable: Send + Sync + 'static {
    /// Open a new socket, present the cookie and swap it in
    async fn reconnect_once(&self) -> Result<()>;
}

/// Snapshot of reconnection counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconnectStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct Counters {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl Counters {
    fn record(&self, result: &Result<()>) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        match result {
            Ok(()) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                *self.last_error.lock() = Some(e.to_string());
            }
        }
    }

    fn snapshot(&self) -> ReconnectStats {
        ReconnectStats {
            attempts: self.attempts.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            last_error: self.last_error.lock().clone(),
        }
    }
}

/// Handle to a running reconnection task
pub(crate) struct ReconnectionManager {
    stop_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
    counters: Arc<Counters>,
}

impl ReconnectionManager {
    /// Spawn the task. The first attempt happens one `interval` from now.
    pub(crate) fn start<T: Reconnectable>(target: Weak<T>, interval: Duration) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let counters = Arc::new(Counters::default());
        let task_counters = counters.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!("Reconnection task started, interval {:?}", interval);

            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        let Some(target) = target.upgrade() else {
                            debug!("Connection dropped, reconnection task exiting");
                            break;
                        };
                        let result = target.reconnect_once().await;
                        match &result {
                            Ok(()) => info!("Reconnected"),
                            Err(e) => warn!("Reconnection attempt failed: {}", e),
                        }
                        task_counters.record(&result);
                    }
                }
            }
            debug!("Reconnection task stopped");
        });

        Self {
            stop_tx,
            handle,
            counters,
        }
    }

    pub(crate) fn stats(&self) -> ReconnectStats {
        self.counters.snapshot()
    }

    /// Signal the task and wait for it to finish any attempt in flight
    pub(crate) async fn stop(self) -> ReconnectStats {
        // the task may already have exited on its own
        let _ = self.stop_tx.send(());
        if let Err(e) = self.handle.await {
            warn!("Reconnection task ended abnormally: {}", e);
        }
        self.counters.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct Target {
        calls: AtomicU64,
        fail: AtomicBool,
    }

    #[async_trait]
    impl Reconnectable for Target {
        async fn reconnect_once(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::ConnectionError("reconnect port closed".into()));
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_until_stopped() {
        let target = Arc::new(Target::default());
        let manager = ReconnectionManager::start(Arc::downgrade(&target), Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(35)).await;
        let stats = manager.stop().await;
        assert_eq!(stats.attempts, 3);
        assert_eq!(stats.successes, 3);
        assert_eq!(stats.failures, 0);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(target.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_counted_not_fatal() {
        let target = Arc::new(Target::default());
        target.fail.store(true, Ordering::SeqCst);
        let manager = ReconnectionManager::start(Arc::downgrade(&target), Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(2500)).await;
        let stats = manager.stats();
        assert_eq!(stats.failures, 2);
        assert!(stats.last_error.unwrap().contains("reconnect port closed"));

        target.fail.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(1)).await;
        let stats = manager.stop().await;
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exits_when_target_dropped() {
        let target = Arc::new(Target::default());
        let manager = ReconnectionManager::start(Arc::downgrade(&target), Duration::from_secs(1));
        drop(target);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(manager.handle.is_finished());
        assert_eq!(manager.stop().await.attempts, 0);
    }
}
