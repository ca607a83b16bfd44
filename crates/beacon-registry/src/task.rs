//! Periodic background task
//!
//! TigerStyle: Explicit task lifecycle, graceful shutdown via channel,
//! bounded wait on stop.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// How a task ended after `stop`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Exited on its own within the grace period
    Graceful,
    /// Still running after the grace period and was aborted
    Aborted,
    /// Was not running
    NotRunning,
}

/// Runs a tick closure every `interval` until stopped
///
/// The first tick fires one interval after spawn. A slow tick delays the
/// next one rather than queueing a burst.
pub struct PeriodicTask {
    name: String,
    handle: Option<JoinHandle<()>>,
    shutdown_tx: Option<watch::Sender<bool>>,
}

impl PeriodicTask {
    /// Spawn the loop on the current tokio runtime
    pub fn spawn<F, Fut>(name: impl Into<String>, interval: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        assert!(!interval.is_zero(), "interval must be positive");
        let name = name.into();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            debug!(task = %task_name, interval_ms = interval.as_millis() as u64, "task started");

            loop {
                tokio::select! {
                    biased;
                    changed = shutdown_rx.changed() => {
                        // A dropped sender also means stop.
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => tick().await,
                }
            }
            info!(task = %task_name, "task shutting down");
        });

        Self {
            name,
            handle: Some(handle),
            shutdown_tx: Some(shutdown_tx),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signal shutdown without waiting
    pub fn signal_stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
    }

    /// Signal shutdown and wait up to `grace` for the loop to exit
    pub async fn stop(&mut self, grace: Duration) -> StopOutcome {
        self.signal_stop();
        let Some(mut handle) = self.handle.take() else {
            return StopOutcome::NotRunning;
        };

        match tokio::time::timeout(grace, &mut handle).await {
            Ok(_) => StopOutcome::Graceful,
            Err(_) => {
                warn!(
                    task = %self.name,
                    grace_ms = grace.as_millis() as u64,
                    "task did not stop within grace period, aborting"
                );
                handle.abort();
                let _ = handle.await;
                StopOutcome::Aborted
            }
        }
    }
}

impl std::fmt::Debug for PeriodicTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicTask")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.signal_stop();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_ticks_until_stopped() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_tick = count.clone();
        let mut task = PeriodicTask::spawn("counter", Duration::from_millis(10), move || {
            let count = count_tick.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert!(task.is_running());

        tokio::time::sleep(Duration::from_millis(55)).await;
        let outcome = task.stop(Duration::from_millis(100)).await;
        assert_eq!(outcome, StopOutcome::Graceful);
        assert!(!task.is_running());

        let ticks = count.load(Ordering::SeqCst);
        assert!(ticks >= 3, "expected several ticks, got {}", ticks);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), ticks);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_tick_is_aborted() {
        let mut task = PeriodicTask::spawn("slow", Duration::from_millis(5), || async {
            tokio::time::sleep(Duration::from_secs(10)).await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let outcome = task.stop(Duration::from_millis(50)).await;
        assert_eq!(outcome, StopOutcome::Aborted);
        assert!(!task.is_running());
    }

    #[tokio::test]
    async fn test_stop_twice() {
        let mut task = PeriodicTask::spawn("idle", Duration::from_secs(60), || async {});
        assert_eq!(
            task.stop(Duration::from_secs(1)).await,
            StopOutcome::Graceful
        );
        assert_eq!(
            task.stop(Duration::from_secs(1)).await,
            StopOutcome::NotRunning
        );
    }
}
