//! Second-stage dispatch: hands units to the audio worker through a
//! throttled, serial queue.
//!
//! [`Dispatcher`] is the cheap, cloneable front half used by the evaluator,
//! sweep and ingress. [`DispatchQueue`] is the single task that drains jobs in
//! FIFO order, fires each send without awaiting its outcome and then waits
//! the stagger delay before the next one.
//!
//! A claim (`dispatched_at`) is a lease, not a delivery receipt. Jobs lost
//! with the process are found by the sweep once the lease expires and are
//! handed out again through [`Dispatcher::redispatch_stale`].
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::db::{self, Pool};
use crate::model::Unit;
use crate::worker::{AudioRequest, WorkerService};

#[derive(Debug, Clone)]
pub struct DispatchPolicy {
    /// Delay between two consecutive sends.
    pub stagger: Duration,
    /// `max_retries` for ledger entries opened on send failure.
    pub max_retries: i32,
    /// Cap for the first ledger backoff.
    pub max_backoff_secs: i64,
    /// Where the audio worker should post its result.
    pub callback_url: Option<String>,
    /// Age after which a claimed unit without an artifact is dispatched again.
    pub lease: chrono::Duration,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            stagger: Duration::from_secs(1),
            max_retries: 3,
            max_backoff_secs: 300,
            callback_url: None,
            lease: chrono::Duration::minutes(30),
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    pool: Pool,
    tx: mpsc::UnboundedSender<AudioRequest>,
    policy: Arc<DispatchPolicy>,
}

pub struct DispatchQueue {
    pool: Pool,
    rx: mpsc::UnboundedReceiver<AudioRequest>,
    worker: Arc<dyn WorkerService>,
    policy: Arc<DispatchPolicy>,
}

impl Dispatcher {
    pub fn new(
        pool: Pool,
        worker: Arc<dyn WorkerService>,
        policy: DispatchPolicy,
    ) -> (Self, DispatchQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        let policy = Arc::new(policy);
        let dispatcher = Self {
            pool: pool.clone(),
            tx,
            policy: Arc::clone(&policy),
        };
        let queue = DispatchQueue {
            pool,
            rx,
            worker,
            policy,
        };
        (dispatcher, queue)
    }

    /// Enqueue every unit of the batch that lacks an artifact and was not yet
    /// handed out. Returns the number of jobs enqueued.
    ///
    /// Does nothing once the batch has reached `audio_requested` or beyond.
    #[instrument(skip_all, fields(batch_id = %batch_id))]
    pub async fn dispatch_batch(&self, batch_id: &str) -> Result<usize> {
        let status = db::fetch_batch_status(&self.pool, batch_id)
            .await?
            .ok_or_else(|| anyhow!("batch {} not found", batch_id))?;
        if status.audio_engaged() {
            info!(%status, "audio already requested for batch; skipping dispatch");
            return Ok(0);
        }

        let candidates = db::list_dispatch_candidates(&self.pool, batch_id).await?;
        let mut enqueued = 0;
        for unit in candidates {
            if self.claim_and_enqueue(&unit).await? {
                enqueued += 1;
            }
        }
        info!(enqueued, "dispatch pass finished");
        Ok(enqueued)
    }

    /// Enqueue a single unit regardless of batch status. Used for units that
    /// arrive after their batch has already been dispatched as a whole.
    #[instrument(skip_all, fields(unit_id = %unit.unit_id))]
    pub async fn dispatch_unit(&self, unit: &Unit) -> Result<bool> {
        if unit.artifact_generated {
            return Ok(false);
        }
        self.claim_and_enqueue(unit).await
    }

    /// Claim instants at or before this are expired as of `now`.
    pub fn lease_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.policy.lease
    }

    /// Re-enqueue units of the batch whose claim expired without an artifact
    /// arriving. The renewed claim is stamped with `now`.
    #[instrument(skip_all, fields(batch_id = %batch_id))]
    pub async fn redispatch_stale(&self, batch_id: &str, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = self.lease_cutoff(now);
        let mut enqueued = 0;
        for unit in db::list_stale_dispatched_units(&self.pool, batch_id, cutoff).await? {
            if !db::reclaim_stale_unit(&self.pool, &unit.unit_id, cutoff, now).await? {
                continue;
            }
            warn!(unit_id = %unit.unit_id, "dispatch lease expired without artifact; sending again");
            self.enqueue(&unit, now).await?;
            enqueued += 1;
        }
        Ok(enqueued)
    }

    async fn claim_and_enqueue(&self, unit: &Unit) -> Result<bool> {
        let now = Utc::now();
        if !db::claim_unit_for_dispatch(&self.pool, &unit.unit_id, now).await? {
            debug!(unit_id = %unit.unit_id, "unit already claimed");
            return Ok(false);
        }
        self.enqueue(unit, now).await?;
        Ok(true)
    }

    async fn enqueue(&self, unit: &Unit, now: DateTime<Utc>) -> Result<()> {
        let req = AudioRequest {
            batch_id: unit.batch_id.clone(),
            unit_id: unit.unit_id.clone(),
            user_id: unit.user_id.clone(),
            content: unit.content.clone(),
            callback_url: self.policy.callback_url.clone(),
        };
        if let Err(err) = self.tx.send(req) {
            // The queue is gone (shutdown); hand the unit to the retry ledger instead.
            let req = err.0;
            warn!(unit_id = %req.unit_id, "dispatch queue closed; deferring unit to retry ledger");
            let next = now + chrono::Duration::seconds(db::backoff_secs(0, self.policy.max_backoff_secs));
            db::open_retry_entry(
                &self.pool,
                &req.batch_id,
                &req.unit_id,
                self.policy.max_retries,
                "dispatch queue closed",
                next,
            )
            .await?;
        }
        Ok(())
    }
}

impl DispatchQueue {
    /// Drain the queue until every [`Dispatcher`] handle is dropped, then wait
    /// for the sends still in flight.
    pub async fn run(mut self) {
        info!(stagger_ms = self.policy.stagger.as_millis() as u64, "dispatch queue started");
        let mut in_flight = JoinSet::new();
        while let Some(req) = self.rx.recv().await {
            while in_flight.try_join_next().is_some() {}
            let worker = Arc::clone(&self.worker);
            let pool = self.pool.clone();
            let policy = Arc::clone(&self.policy);
            in_flight.spawn(send_one(pool, worker, policy, req));
            if !self.policy.stagger.is_zero() {
                tokio::time::sleep(self.policy.stagger).await;
            }
        }
        let pending = in_flight.len();
        if pending > 0 {
            info!(pending, "dispatch queue closed; waiting for in-flight sends");
        }
        while in_flight.join_next().await.is_some() {}
        info!("dispatch queue stopped");
    }
}

async fn send_one(
    pool: Pool,
    worker: Arc<dyn WorkerService>,
    policy: Arc<DispatchPolicy>,
    req: AudioRequest,
) {
    match worker.request_audio(&req).await {
        Ok(()) => debug!(unit_id = %req.unit_id, "audio job accepted"),
        Err(err) => {
            warn!(?err, batch_id = %req.batch_id, unit_id = %req.unit_id, "audio job send failed");
            let next = Utc::now()
                + chrono::Duration::seconds(db::backoff_secs(0, policy.max_backoff_secs));
            if let Err(err) = db::open_retry_entry(
                &pool,
                &req.batch_id,
                &req.unit_id,
                policy.max_retries,
                &err.to_string(),
                next,
            )
            .await
            {
                warn!(?err, unit_id = %req.unit_id, "failed to record retry entry");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;
    use tokio::time::Instant;

    use crate::worker::SummaryRequest;

    /// Records when each audio job reached the worker. Sends for `hang_on`
    /// never return; every other send takes `latency`.
    #[derive(Default)]
    struct TimedWorker {
        calls: Mutex<Vec<(String, Instant)>>,
        finished: AtomicUsize,
        hang_on: Option<&'static str>,
        latency: Duration,
    }

    #[async_trait]
    impl WorkerService for TimedWorker {
        async fn request_summary(&self, _req: &SummaryRequest) -> Result<()> {
            Ok(())
        }

        async fn request_audio(&self, req: &AudioRequest) -> Result<()> {
            self.calls
                .lock()
                .await
                .push((req.user_id.clone(), Instant::now()));
            if self.hang_on == Some(req.user_id.as_str()) {
                std::future::pending::<()>().await;
            }
            tokio::time::sleep(self.latency).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn job(user: &str) -> AudioRequest {
        AudioRequest {
            batch_id: "b1".into(),
            unit_id: format!("unit-{}", user),
            user_id: user.into(),
            content: "text".into(),
            callback_url: None,
        }
    }

    fn queue_with(worker: Arc<TimedWorker>) -> (Dispatcher, DispatchQueue) {
        // Never connects: no send in these tests fails, so the ledger is untouched.
        let pool = SqlitePoolOptions::new()
            .connect_lazy("sqlite::memory:")
            .unwrap();
        Dispatcher::new(
            pool,
            worker,
            DispatchPolicy {
                stagger: Duration::from_secs(1),
                ..DispatchPolicy::default()
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn sends_are_fifo_and_staggered_without_waiting_on_each_send() {
        let worker = Arc::new(TimedWorker {
            hang_on: Some("b"),
            ..TimedWorker::default()
        });
        let (dispatcher, queue) = queue_with(Arc::clone(&worker));
        for user in ["a", "b", "c", "d"] {
            dispatcher.tx.send(job(user)).unwrap();
        }
        let start = Instant::now();
        let handle = tokio::spawn(queue.run());

        tokio::time::sleep(Duration::from_millis(3500)).await;
        let calls = worker.calls.lock().await.clone();
        let order: Vec<&str> = calls.iter().map(|(u, _)| u.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c", "d"]);
        for pair in calls.windows(2) {
            assert!(pair[1].1 - pair[0].1 >= Duration::from_secs(1));
        }
        // "b" never returns, yet "c" went out one stagger later.
        assert_eq!(calls[2].1 - start, Duration::from_secs(2));
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn run_waits_for_in_flight_sends_after_close() {
        let worker = Arc::new(TimedWorker {
            latency: Duration::from_secs(10),
            ..TimedWorker::default()
        });
        let (dispatcher, queue) = queue_with(Arc::clone(&worker));
        dispatcher.tx.send(job("a")).unwrap();
        dispatcher.tx.send(job("b")).unwrap();
        drop(dispatcher);

        queue.run().await;
        assert_eq!(worker.finished.load(Ordering::SeqCst), 2);
    }
}
