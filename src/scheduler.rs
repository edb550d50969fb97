//! Periodic tasks with a per-task reentrancy guard.
//!
//! Each [`PeriodicTask`] owns its own in-flight flag. A tick that fires while
//! the previous run is still going is skipped with a warning, never queued.
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct PeriodicTask {
    name: &'static str,
    interval: Duration,
    immediate: bool,
    in_flight: Arc<AtomicBool>,
}

/// Held for the duration of one run; clears the in-flight flag on drop.
#[derive(Debug)]
pub struct RunGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

impl PeriodicTask {
    pub fn new(name: &'static str, interval: Duration) -> Self {
        Self {
            name,
            interval,
            immediate: false,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Also run once right away instead of waiting a full interval.
    pub fn immediate(mut self, yes: bool) -> Self {
        self.immediate = yes;
        self
    }

    /// Claim the task for one run, or `None` if a run is already in flight.
    pub fn try_begin(&self) -> Option<RunGuard> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunGuard {
                flag: Arc::clone(&self.in_flight),
            })
    }

    /// Tick forever on the configured interval, spawning `job` for each tick
    /// that finds the task idle.
    pub fn spawn<F, Fut>(self, job: F) -> JoinHandle<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let job = Arc::new(job);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            if !self.immediate {
                ticker.tick().await; // skip immediate first tick
            }
            info!(task = self.name, interval_secs = self.interval.as_secs(), "periodic task started");
            loop {
                ticker.tick().await;
                let Some(guard) = self.try_begin() else {
                    warn!(task = self.name, "previous run still in flight; skipping");
                    continue;
                };
                let job = Arc::clone(&job);
                tokio::spawn(async move {
                    let _guard = guard;
                    job().await;
                });
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn guard_blocks_reentrant_run() {
        let task = PeriodicTask::new("test", Duration::from_secs(60));
        let guard = task.try_begin().expect("first claim");
        assert!(task.in_flight.load(Ordering::SeqCst));
        assert!(task.try_begin().is_none());

        drop(guard);
        assert!(!task.in_flight.load(Ordering::SeqCst));
        assert!(task.try_begin().is_some());
        assert!(!task.in_flight.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_ticks_are_skipped_not_queued() {
        let runs = Arc::new(AtomicUsize::new(0));
        let task = PeriodicTask::new("slow", Duration::from_secs(1)).immediate(true);
        let observer = task.clone();
        let counter = Arc::clone(&runs);
        let handle = task.spawn(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(3500)).await;
            }
        });

        // Ticks at 0s..5s; the first run occupies 0s..3.5s, the next one starts at 4s.
        tokio::time::sleep(Duration::from_millis(4500)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert!(observer.in_flight.load(Ordering::SeqCst));
        handle.abort();
    }
}
