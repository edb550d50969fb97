#![allow(dead_code)]

use anyhow::{anyhow, Result};
use briefcast_orchestrator::db::Pool;
use briefcast_orchestrator::dispatcher::{DispatchPolicy, Dispatcher};
use briefcast_orchestrator::worker::{AudioRequest, SummaryRequest, WorkerService};
use sqlx::sqlite::SqlitePoolOptions;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub async fn setup_pool() -> Pool {
    // One connection keeps the in-memory database alive and serialises writers.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

#[derive(Clone, Default)]
pub struct RecordingWorker {
    summary_responses: Arc<Mutex<VecDeque<Result<()>>>>,
    audio_responses: Arc<Mutex<VecDeque<Result<()>>>>,
    summary_calls: Arc<Mutex<Vec<SummaryRequest>>>,
    audio_calls: Arc<Mutex<Vec<AudioRequest>>>,
}

impl RecordingWorker {
    pub fn failing_audio(times: usize) -> Self {
        let responses: VecDeque<Result<()>> = (0..times)
            .map(|i| Err(anyhow!("audio worker unavailable ({})", i)))
            .collect();
        Self {
            audio_responses: Arc::new(Mutex::new(responses)),
            ..Default::default()
        }
    }

    pub async fn push_summary_response(&self, res: Result<()>) {
        self.summary_responses.lock().await.push_back(res);
    }

    pub async fn summary_calls(&self) -> Vec<SummaryRequest> {
        self.summary_calls.lock().await.clone()
    }

    pub async fn audio_calls(&self) -> Vec<AudioRequest> {
        self.audio_calls.lock().await.clone()
    }

    /// Wait until the dispatch queue has delivered at least `n` audio jobs.
    pub async fn wait_for_audio(&self, n: usize) -> Vec<AudioRequest> {
        for _ in 0..200 {
            let calls = self.audio_calls().await;
            if calls.len() >= n {
                return calls;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let calls = self.audio_calls().await;
        panic!("expected {} audio calls, saw {}", n, calls.len());
    }
}

#[async_trait::async_trait]
impl WorkerService for RecordingWorker {
    async fn request_summary(&self, req: &SummaryRequest) -> Result<()> {
        self.summary_calls.lock().await.push(req.clone());
        self.summary_responses.lock().await.pop_front().unwrap_or(Ok(()))
    }

    async fn request_audio(&self, req: &AudioRequest) -> Result<()> {
        self.audio_calls.lock().await.push(req.clone());
        self.audio_responses.lock().await.pop_front().unwrap_or(Ok(()))
    }
}

pub fn test_policy() -> DispatchPolicy {
    DispatchPolicy {
        stagger: Duration::ZERO,
        max_retries: 3,
        max_backoff_secs: 60,
        callback_url: Some("http://orchestrator.test/webhooks/audio".into()),
        lease: chrono::Duration::minutes(10),
    }
}

/// Dispatcher wired to `worker`, with its queue already running.
pub fn start_dispatcher(pool: &Pool, worker: &RecordingWorker, policy: DispatchPolicy) -> Dispatcher {
    let (dispatcher, queue) = Dispatcher::new(pool.clone(), Arc::new(worker.clone()), policy);
    tokio::spawn(queue.run());
    dispatcher
}
