use std::{
    collections::HashMap,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, trace, warn};

use crate::{StoreError, StoreResult};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct ContentionCounters {
    acquisitions: AtomicU64,
    contended: AtomicU64,
    timeouts: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContentionSnapshot {
    pub acquisitions: u64,
    pub contended: u64,
    pub timeouts: u64,
}

/// Per-key mutual exclusion with a bounded wait. Locks for different keys
/// never block each other.
#[derive(Debug)]
pub struct DatasetGate {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    wait_timeout: Duration,
    counters: ContentionCounters,
}

/// Held for the duration of a critical section; dropping it releases the key,
/// including on early return and panic.
#[derive(Debug)]
pub struct GateGuard {
    key: String,
    acquired_at: Instant,
    _guard: OwnedMutexGuard<()>,
}

impl GateGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        trace!(
            key = %self.key,
            held_ms = self.acquired_at.elapsed().as_millis() as u64,
            "dataset lock released"
        );
    }
}

impl Default for DatasetGate {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT)
    }
}

impl DatasetGate {
    pub fn new(wait_timeout: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            wait_timeout,
            counters: ContentionCounters::default(),
        }
    }

    pub fn wait_timeout(&self) -> Duration {
        self.wait_timeout
    }

    fn lock_for(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock();
        Arc::clone(
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    pub async fn acquire(&self, key: &str) -> StoreResult<GateGuard> {
        let lock = self.lock_for(key);
        let guard = match Arc::clone(&lock).try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                self.counters.contended.fetch_add(1, Ordering::Relaxed);
                debug!(key, "waiting for dataset lock");
                match tokio::time::timeout(self.wait_timeout, lock.lock_owned()).await {
                    Ok(guard) => guard,
                    Err(_) => {
                        self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            key,
                            waited_ms = self.wait_timeout.as_millis() as u64,
                            "gave up waiting for dataset lock"
                        );
                        return Err(StoreError::LockTimeout {
                            key: key.to_string(),
                            waited: self.wait_timeout,
                        });
                    }
                }
            }
        };
        self.counters.acquisitions.fetch_add(1, Ordering::Relaxed);
        Ok(GateGuard {
            key: key.to_string(),
            acquired_at: Instant::now(),
            _guard: guard,
        })
    }

    /// Runs `operation` while holding `key`. The operation's own error is
    /// returned unchanged and the key is released either way.
    pub async fn with_lock<T, F, Fut>(&self, key: &str, operation: F) -> StoreResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let _guard = self.acquire(key).await?;
        operation().await
    }

    pub fn contention(&self) -> ContentionSnapshot {
        ContentionSnapshot {
            acquisitions: self.counters.acquisitions.load(Ordering::Relaxed),
            contended: self.counters.contended.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
        }
    }
}
