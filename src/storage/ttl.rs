//! TTL eviction scheduling.
//!
//! A sweeper owns at most one armed timer. It repeatedly takes the earliest
//! recorded push timestamp, waits until that timestamp is `ttl` old and then
//! removes every item scored at or below it. Timestamps that are already
//! expired are skipped without waiting; a later threshold covers them.
//!
//! The first pass after startup is mandatory: when no timestamp is recorded it
//! uses "now" as the threshold, so data left over from a previous process is
//! evaluated once before the storage reports itself ready.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::now_millis;
use crate::error::StorageError;

/// Backoff after a failed sweep step.
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// The storage side of TTL eviction.
#[async_trait]
pub(crate) trait SweepTarget: Send + Sync {
    /// Queue name, for logging.
    fn name(&self) -> &str;

    /// Removes and returns the earliest recorded push timestamp.
    async fn next_timestamp(&self) -> Result<Option<i64>, StorageError>;

    /// Removes every item pushed at or before `threshold`; returns how many.
    async fn remove_up_to(&self, threshold: i64) -> Result<usize, StorageError>;
}

/// Handle to a running sweeper task.
pub(crate) struct TtlSweeper {
    wake: Arc<Notify>,
    ready: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl TtlSweeper {
    /// Spawns the sweeper for `target`.
    pub(crate) fn spawn(target: Arc<dyn SweepTarget>, ttl: Duration) -> Self {
        let wake = Arc::new(Notify::new());
        let ready = Arc::new(AtomicBool::new(false));

        let handle = tokio::spawn(run(
            target,
            ttl,
            Arc::clone(&wake),
            Arc::clone(&ready),
        ));

        Self {
            wake,
            ready,
            handle,
        }
    }

    /// Signals that a new timestamp was recorded.
    pub(crate) fn notify_push(&self) {
        self.wake.notify_one();
    }

    /// Whether the mandatory startup sweep has completed.
    pub(crate) fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

impl Drop for TtlSweeper {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Finds the next threshold to wait for and how long to wait.
async fn next_deadline(
    target: &dyn SweepTarget,
    ttl_ms: i64,
    startup: bool,
) -> Result<Option<(i64, Duration)>, StorageError> {
    loop {
        let threshold = match target.next_timestamp().await? {
            Some(ts) => ts,
            None if startup => now_millis(),
            None => return Ok(None),
        };

        let delay = threshold + ttl_ms - now_millis();
        if delay >= 0 {
            return Ok(Some((threshold, Duration::from_millis(delay as u64))));
        }
        debug!(queue = %target.name(), threshold, "Skipping already expired timestamp");
    }
}

async fn run(target: Arc<dyn SweepTarget>, ttl: Duration, wake: Arc<Notify>, ready: Arc<AtomicBool>) {
    let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    let mut startup = true;

    loop {
        match next_deadline(target.as_ref(), ttl_ms, startup).await {
            Ok(Some((threshold, delay))) => {
                debug!(
                    queue = %target.name(),
                    threshold,
                    delay_ms = delay.as_millis() as u64,
                    "TTL cleanup scheduled"
                );
                tokio::time::sleep(delay).await;

                match target.remove_up_to(threshold).await {
                    Ok(removed) => {
                        info!(
                            queue = %target.name(),
                            removed,
                            threshold,
                            "TTL cleanup removed expired items"
                        );
                        if startup {
                            startup = false;
                            ready.store(true, Ordering::SeqCst);
                        }
                    }
                    Err(e) => {
                        error!(queue = %target.name(), error = %e, "TTL cleanup failed");
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
            }
            Ok(None) => {
                // Nothing to schedule until the next push.
                wake.notified().await;
            }
            Err(e) => {
                error!(queue = %target.name(), error = %e, "Failed to read TTL timestamps");
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// In-memory stand-in for a sorted-set backend.
    struct FakeTarget {
        timestamps: Mutex<VecDeque<i64>>,
        items: Mutex<Vec<i64>>,
        sweeps: Mutex<Vec<i64>>,
    }

    impl FakeTarget {
        fn new() -> Self {
            Self {
                timestamps: Mutex::new(VecDeque::new()),
                items: Mutex::new(Vec::new()),
                sweeps: Mutex::new(Vec::new()),
            }
        }

        fn push(&self, ts: i64) {
            self.timestamps.lock().expect("lock").push_back(ts);
            self.items.lock().expect("lock").push(ts);
        }

        fn remaining(&self) -> usize {
            self.items.lock().expect("lock").len()
        }
    }

    #[async_trait]
    impl SweepTarget for FakeTarget {
        fn name(&self) -> &str {
            "fake"
        }

        async fn next_timestamp(&self) -> Result<Option<i64>, StorageError> {
            Ok(self.timestamps.lock().expect("lock").pop_front())
        }

        async fn remove_up_to(&self, threshold: i64) -> Result<usize, StorageError> {
            self.sweeps.lock().expect("lock").push(threshold);
            let mut items = self.items.lock().expect("lock");
            let before = items.len();
            items.retain(|&ts| ts > threshold);
            Ok(before - items.len())
        }
    }

    #[tokio::test]
    async fn test_startup_sweep_gates_readiness() {
        let target = Arc::new(FakeTarget::new());
        let sweeper = TtlSweeper::spawn(target.clone(), Duration::from_millis(100));

        assert!(!sweeper.is_ready());
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(sweeper.is_ready());
        assert_eq!(target.sweeps.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn test_stale_items_removed_by_startup_pass() {
        let target = Arc::new(FakeTarget::new());
        let old = now_millis() - 10_000;
        target.push(old);
        target.push(old + 1);

        let sweeper = TtlSweeper::spawn(target.clone(), Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert!(sweeper.is_ready());
        assert_eq!(target.remaining(), 0);
    }

    #[tokio::test]
    async fn test_pushed_item_expires_after_ttl() {
        let target = Arc::new(FakeTarget::new());
        let sweeper = TtlSweeper::spawn(target.clone(), Duration::from_millis(500));

        tokio::time::sleep(Duration::from_millis(20)).await;
        target.push(now_millis());
        sweeper.notify_push();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(target.remaining(), 1, "item must survive before its TTL");

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(target.remaining(), 0, "item must be evicted after its TTL");
    }

    #[tokio::test]
    async fn test_idle_sweeper_wakes_on_push() {
        let target = Arc::new(FakeTarget::new());
        let sweeper = TtlSweeper::spawn(target.clone(), Duration::from_millis(50));

        // Startup pass completes, then the sweeper idles.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(sweeper.is_ready());

        target.push(now_millis());
        sweeper.notify_push();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(target.remaining(), 0);
        assert_eq!(target.sweeps.lock().expect("lock").len(), 2);
    }
}
