//! Batch lifecycle: creation boundary and the race-safe transition protocol.
//!
//! There is no in-process lock around a batch. Every transition is one
//! conditional update against the persisted record; callers branch on
//! whether they won before performing side effects.
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::db::{self, Pool};
use crate::model::{Batch, BatchStatus};

#[derive(Debug, Error)]
pub enum CreateBatchError {
    #[error("expected_count must be at least 1")]
    EmptyBatch,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewBatch {
    pub expected_count: i64,
    #[serde(default)]
    pub user_ids: Vec<String>,
}

/// What a caller gets back from [`create_batch`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchTicket {
    pub batch_id: String,
    pub timeout_at: DateTime<Utc>,
}

/// Trim participant ids and drop blanks and repeats, keeping first-seen order.
pub fn normalize_participants(ids: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(ids.len());
    for id in ids {
        let id = id.trim();
        if !id.is_empty() && !out.iter().any(|seen| seen == id) {
            out.push(id.to_string());
        }
    }
    out
}

#[instrument(skip_all, fields(expected = new.expected_count))]
pub async fn create_batch(
    pool: &Pool,
    new: NewBatch,
    timeout: chrono::Duration,
    now: DateTime<Utc>,
) -> Result<BatchTicket, CreateBatchError> {
    if new.expected_count < 1 {
        return Err(CreateBatchError::EmptyBatch);
    }
    let user_ids = normalize_participants(&new.user_ids);

    let batch = Batch {
        batch_id: Uuid::new_v4().to_string(),
        expected_count: new.expected_count,
        received_count: 0,
        status: BatchStatus::Pending,
        user_ids,
        created_at: now,
        timeout_at: now + timeout,
        partial_completed_at: None,
        completed_at: None,
        audio_requested_at: None,
        audio_completed_at: None,
        audio_failed_at: None,
        failed_at: None,
        audio_url: None,
        failure_reason: None,
    };
    db::insert_batch(pool, &batch).await?;
    info!(batch_id = %batch.batch_id, timeout_at = %batch.timeout_at, "batch created");
    Ok(BatchTicket {
        batch_id: batch.batch_id,
        timeout_at: batch.timeout_at,
    })
}

/// Terminal payload carried along with a transition.
#[derive(Debug, Clone, Copy, Default)]
pub struct Payload<'a> {
    pub audio_url: Option<&'a str>,
    pub failure_reason: Option<&'a str>,
}

/// Attempt `from -> to` for each listed source state in order. Returns the
/// source state this call won from, or `None` when the record was not in any
/// of them (a concurrent caller already moved it, or it never qualified).
#[instrument(skip_all, fields(batch_id = %batch_id, to = %to))]
pub async fn transition(
    pool: &Pool,
    batch_id: &str,
    from: &[BatchStatus],
    to: BatchStatus,
    payload: Payload<'_>,
) -> Result<Option<BatchStatus>> {
    let now = Utc::now();
    for &source in from {
        if !source.can_transition_to(to) {
            warn!(from = %source, "refusing transition outside the lifecycle table");
            continue;
        }
        let won = db::cas_status(
            pool,
            batch_id,
            source,
            to,
            now,
            payload.audio_url,
            payload.failure_reason,
        )
        .await?;
        if won {
            info!(from = %source, "batch transitioned");
            return Ok(Some(source));
        }
    }
    info!(?from, "transition not applied; batch already moved on");
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_pool() -> Pool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    #[test]
    fn participants_are_trimmed_and_deduplicated() {
        let raw: Vec<String> = vec!["a".into(), " b".into(), "a ".into(), "".into(), "c".into()];
        assert_eq!(normalize_participants(&raw), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn create_rejects_empty_batches() {
        let pool = setup_pool().await;
        let err = create_batch(
            &pool,
            NewBatch { expected_count: 0, user_ids: vec![] },
            chrono::Duration::minutes(30),
            Utc::now(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CreateBatchError::EmptyBatch));
    }

    #[tokio::test]
    async fn create_sets_deadline_and_dedups_participants() {
        let pool = setup_pool().await;
        let now = Utc::now();
        let ticket = create_batch(
            &pool,
            NewBatch {
                expected_count: 2,
                user_ids: vec!["a".into(), "a".into(), " b ".into(), "".into()],
            },
            chrono::Duration::minutes(30),
            now,
        )
        .await
        .unwrap();
        assert_eq!(ticket.timeout_at, now + chrono::Duration::minutes(30));

        let batch = db::fetch_batch(&pool, &ticket.batch_id).await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Pending);
        assert_eq!(batch.user_ids, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(batch.expected_count, 2);
    }

    #[tokio::test]
    async fn transition_reports_winning_source() {
        let pool = setup_pool().await;
        let ticket = create_batch(
            &pool,
            NewBatch { expected_count: 2, user_ids: vec![] },
            chrono::Duration::minutes(30),
            Utc::now(),
        )
        .await
        .unwrap();
        let id = ticket.batch_id.as_str();

        let won = transition(&pool, id, &[BatchStatus::Pending], BatchStatus::PartialComplete, Payload::default())
            .await
            .unwrap();
        assert_eq!(won, Some(BatchStatus::Pending));

        let won = transition(
            &pool,
            id,
            &[BatchStatus::Pending, BatchStatus::PartialComplete],
            BatchStatus::Complete,
            Payload::default(),
        )
        .await
        .unwrap();
        assert_eq!(won, Some(BatchStatus::PartialComplete));

        // Already complete: a second attempt is a quiet no-op.
        let again = transition(
            &pool,
            id,
            &[BatchStatus::Pending, BatchStatus::PartialComplete],
            BatchStatus::Complete,
            Payload::default(),
        )
        .await
        .unwrap();
        assert_eq!(again, None);
    }

    #[tokio::test]
    async fn transition_skips_edges_outside_table() {
        let pool = setup_pool().await;
        let ticket = create_batch(
            &pool,
            NewBatch { expected_count: 1, user_ids: vec![] },
            chrono::Duration::minutes(30),
            Utc::now(),
        )
        .await
        .unwrap();
        let won = transition(
            &pool,
            &ticket.batch_id,
            &[BatchStatus::Pending],
            BatchStatus::AudioComplete,
            Payload::default(),
        )
        .await
        .unwrap();
        assert_eq!(won, None);
        let status = db::fetch_batch_status(&pool, &ticket.batch_id).await.unwrap();
        assert_eq!(status, Some(BatchStatus::Pending));
    }
}
