//! Completion evaluator: decides whether a batch crossed a threshold and
//! performs the matching transition.
//!
//! Safe to call concurrently and redundantly for the same batch. Only the
//! caller that wins a transition dispatches, and the dispatch itself claims
//! each unit individually, so no unit is handed to the audio worker twice.
use anyhow::{anyhow, Result};
use serde::Serialize;
use tracing::{debug, instrument};

use crate::db::{self, Pool};
use crate::dispatcher::Dispatcher;
use crate::model::{BatchStatus, FULL_THRESHOLD, PARTIAL_THRESHOLD};
use crate::tracker::{self, Payload};

/// What a single evaluation did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Evaluation {
    /// Transitions won by this call, in order, as `(from, to)`.
    pub transitions: Vec<(BatchStatus, BatchStatus)>,
    /// Units this call enqueued for the audio worker.
    pub dispatched: usize,
}

impl Evaluation {
    pub fn won(&self, to: BatchStatus) -> bool {
        self.transitions.iter().any(|(_, t)| *t == to)
    }

    fn merge(&mut self, other: Evaluation) {
        self.transitions.extend(other.transitions);
        self.dispatched += other.dispatched;
    }
}

/// Evaluate first-stage thresholds for a batch after a unit arrived (or when
/// the sweep suspects a lost evaluation).
#[instrument(skip_all, fields(batch_id = %batch_id))]
pub async fn evaluate(pool: &Pool, dispatcher: &Dispatcher, batch_id: &str) -> Result<Evaluation> {
    let received = db::reconcile_received_count(pool, batch_id)
        .await?
        .ok_or_else(|| anyhow!("batch {} not found", batch_id))?;
    let batch = db::fetch_batch(pool, batch_id)
        .await?
        .ok_or_else(|| anyhow!("batch {} not found", batch_id))?;
    let ratio = batch.completion_ratio();
    debug!(received, expected = batch.expected_count, ratio, status = %batch.status, "evaluating batch");

    let mut eval = Evaluation::default();

    if ratio >= FULL_THRESHOLD
        && matches!(batch.status, BatchStatus::Pending | BatchStatus::PartialComplete)
    {
        let won = tracker::transition(
            pool,
            batch_id,
            &[BatchStatus::Pending, BatchStatus::PartialComplete],
            BatchStatus::Complete,
            Payload::default(),
        )
        .await?;
        if let Some(from) = won {
            eval.transitions.push((from, BatchStatus::Complete));
            eval.merge(advance_completed(pool, dispatcher, batch_id).await?);
        }
        return Ok(eval);
    }

    if ratio >= PARTIAL_THRESHOLD && batch.status == BatchStatus::Pending {
        let won = tracker::transition(
            pool,
            batch_id,
            &[BatchStatus::Pending],
            BatchStatus::PartialComplete,
            Payload::default(),
        )
        .await?;
        if won.is_some() {
            eval.transitions
                .push((BatchStatus::Pending, BatchStatus::PartialComplete));
            eval.dispatched += dispatcher.dispatch_batch(batch_id).await?;
        }
    }

    Ok(eval)
}

/// Drive a batch that just entered `complete` towards the audio stage: skip
/// straight to `audio_complete` when every unit already has its artifact,
/// otherwise dispatch what is left and move to `audio_requested`.
#[instrument(skip_all, fields(batch_id = %batch_id))]
pub async fn advance_completed(
    pool: &Pool,
    dispatcher: &Dispatcher,
    batch_id: &str,
) -> Result<Evaluation> {
    let mut eval = Evaluation::default();
    let counts = db::count_units(pool, batch_id).await?;

    if counts.all_have_artifacts() {
        if tracker::transition(
            pool,
            batch_id,
            &[BatchStatus::Complete],
            BatchStatus::AudioComplete,
            Payload::default(),
        )
        .await?
        .is_some()
        {
            eval.transitions
                .push((BatchStatus::Complete, BatchStatus::AudioComplete));
        }
        return Ok(eval);
    }

    eval.dispatched += dispatcher.dispatch_batch(batch_id).await?;
    if tracker::transition(
        pool,
        batch_id,
        &[BatchStatus::Complete],
        BatchStatus::AudioRequested,
        Payload::default(),
    )
    .await?
    .is_some()
    {
        eval.transitions
            .push((BatchStatus::Complete, BatchStatus::AudioRequested));
        // Artifacts may have landed while the batch was still `complete`.
        if check_audio_completion(pool, batch_id, None).await? {
            eval.transitions
                .push((BatchStatus::AudioRequested, BatchStatus::AudioComplete));
        }
    }
    Ok(eval)
}

/// Move an `audio_requested` batch to `audio_complete` once every received
/// unit carries an artifact. Returns whether this call made that transition.
#[instrument(skip_all, fields(batch_id = %batch_id))]
pub async fn check_audio_completion(
    pool: &Pool,
    batch_id: &str,
    audio_url: Option<&str>,
) -> Result<bool> {
    let Some(received) = db::reconcile_received_count(pool, batch_id).await? else {
        return Err(anyhow!("batch {} not found", batch_id));
    };
    if db::fetch_batch_status(pool, batch_id).await? != Some(BatchStatus::AudioRequested) {
        return Ok(false);
    }
    let counts = db::count_units(pool, batch_id).await?;
    let needed = received.max(counts.persisted);
    if needed == 0 || counts.with_artifact < needed {
        debug!(with_artifact = counts.with_artifact, needed, "audio still outstanding");
        return Ok(false);
    }
    let won = tracker::transition(
        pool,
        batch_id,
        &[BatchStatus::AudioRequested],
        BatchStatus::AudioComplete,
        Payload {
            audio_url,
            failure_reason: None,
        },
    )
    .await?;
    Ok(won.is_some())
}
