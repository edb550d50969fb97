mod common;

use anyhow::anyhow;
use briefcast_orchestrator::db;
use briefcast_orchestrator::generation::run_generation_cycle;
use briefcast_orchestrator::model::BatchStatus;
use chrono::Duration;
use common::{setup_pool, RecordingWorker};

#[tokio::test]
async fn generation_opens_batch_and_requests_each_summary() {
    let pool = setup_pool().await;
    let worker = RecordingWorker::default();
    worker.push_summary_response(Ok(())).await;
    worker.push_summary_response(Err(anyhow!("summarizer overloaded"))).await;

    let users = vec!["alice".to_string(), "bob".to_string(), "carol".to_string()];
    let outcome = run_generation_cycle(
        &pool,
        &worker,
        &users,
        Duration::minutes(45),
        Some("http://orchestrator.test/webhooks/summary"),
    )
    .await
    .unwrap();

    assert_eq!(outcome.requested, 2);
    assert_eq!(outcome.failed, 1);

    let batch = db::fetch_batch(&pool, &outcome.ticket.batch_id).await.unwrap().unwrap();
    assert_eq!(batch.status, BatchStatus::Pending);
    assert_eq!(batch.expected_count, 3);
    assert_eq!(batch.user_ids, users);
    assert_eq!(batch.timeout_at, outcome.ticket.timeout_at);

    let calls = worker.summary_calls().await;
    let called: Vec<&str> = calls.iter().map(|c| c.user_id.as_str()).collect();
    assert_eq!(called, vec!["alice", "bob", "carol"]);
    assert!(calls.iter().all(|c| c.batch_id == outcome.ticket.batch_id));
    assert!(calls
        .iter()
        .all(|c| c.callback_url.as_deref() == Some("http://orchestrator.test/webhooks/summary")));
}

#[tokio::test]
async fn generation_without_participants_creates_nothing() {
    let pool = setup_pool().await;
    let worker = RecordingWorker::default();

    let res = run_generation_cycle(&pool, &worker, &[], Duration::minutes(45), None).await;
    assert!(res.is_err());
    assert!(db::list_recent_batches(&pool, 10).await.unwrap().is_empty());
    assert!(worker.summary_calls().await.is_empty());
}

#[tokio::test]
async fn repeated_and_blank_participants_are_asked_once() {
    let pool = setup_pool().await;
    let worker = RecordingWorker::default();
    let users = vec!["alice".to_string(), " alice".to_string(), "  ".to_string()];

    let outcome = run_generation_cycle(&pool, &worker, &users, Duration::minutes(45), None)
        .await
        .unwrap();
    assert_eq!(outcome.requested, 1);
    assert_eq!(outcome.failed, 0);

    let batch = db::fetch_batch(&pool, &outcome.ticket.batch_id).await.unwrap().unwrap();
    assert_eq!(batch.expected_count, 1);
    assert_eq!(batch.user_ids, vec!["alice".to_string()]);

    let called: Vec<String> = worker
        .summary_calls()
        .await
        .into_iter()
        .map(|c| c.user_id)
        .collect();
    assert_eq!(called, vec!["alice".to_string()]);
}
