//! Timeout and recovery sweep.
//!
//! A periodic, idempotent reconciliation pass that runs independently of
//! webhook traffic. Each batch is handled in isolation: a failure is logged
//! and counted, and the pass moves on to the next batch.
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use tracing::{error, info, instrument};

use crate::db::{self, Pool};
use crate::dispatcher::Dispatcher;
use crate::evaluator::{self, Evaluation};
use crate::model::BatchStatus;
use crate::tracker::{self, Payload};

pub const TIMEOUT_FAILURE_REASON: &str = "timed out before any summary arrived";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub timed_out_failed: usize,
    pub timed_out_completed: usize,
    pub recovered: usize,
    pub partial_promoted: usize,
    pub audio_completed: usize,
    pub dispatched: usize,
    pub redispatched: usize,
    pub errors: usize,
}

impl SweepReport {
    fn absorb(&mut self, eval: &Evaluation) {
        self.dispatched += eval.dispatched;
        if eval.won(BatchStatus::AudioComplete) {
            self.audio_completed += 1;
        }
    }
}

/// Run every pass once. Never fails; errors are logged per batch and counted
/// in [`SweepReport::errors`].
#[instrument(skip_all)]
pub async fn run_sweep(pool: &Pool, dispatcher: &Dispatcher, now: DateTime<Utc>) -> SweepReport {
    let mut report = SweepReport::default();

    // First, so claims made later in this same sweep are never seen as expired.
    for_each_batch(
        &mut report,
        "expired-dispatch",
        db::list_batches_with_stale_dispatch(pool, dispatcher.lease_cutoff(now)),
        |id| async move {
            let sent = dispatcher.redispatch_stale(&id, now).await?;
            Ok(SweepOutcome::Redispatched(sent))
        },
    )
    .await;

    for_each_batch(&mut report, "timeout", db::list_timed_out_batch_ids(pool, now), |id| {
        sweep_timed_out(pool, dispatcher, id)
    })
    .await;

    for_each_batch(&mut report, "recovery", db::list_orphaned_failed_batch_ids(pool), |id| {
        recover_failed(pool, dispatcher, id)
    })
    .await;

    for_each_batch(&mut report, "partial", db::list_pending_with_receipts(pool), |id| {
        promote_partial(pool, dispatcher, id)
    })
    .await;

    for_each_batch(
        &mut report,
        "stalled-complete",
        db::list_batch_ids_with_status(pool, BatchStatus::Complete),
        |id| async move {
            let eval = evaluator::advance_completed(pool, dispatcher, &id).await?;
            Ok(SweepOutcome::Advanced(eval))
        },
    )
    .await;

    for_each_batch(
        &mut report,
        "audio-completion",
        db::list_batch_ids_with_status(pool, BatchStatus::AudioRequested),
        |id| async move {
            let done = evaluator::check_audio_completion(pool, &id, None).await?;
            Ok(if done {
                SweepOutcome::AudioCompleted
            } else {
                SweepOutcome::Untouched
            })
        },
    )
    .await;

    info!(?report, "sweep finished");
    report
}

/// What happened to one batch during a pass.
#[derive(Debug)]
enum SweepOutcome {
    Untouched,
    Failed,
    TimedOutCompleted(Evaluation),
    Recovered(Evaluation),
    Promoted(Evaluation),
    Advanced(Evaluation),
    Redispatched(usize),
    AudioCompleted,
}

async fn for_each_batch<F, Fut>(
    report: &mut SweepReport,
    pass: &'static str,
    ids: impl Future<Output = Result<Vec<String>>>,
    mut handle: F,
) where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<SweepOutcome>>,
{
    let ids = match ids.await {
        Ok(ids) => ids,
        Err(err) => {
            error!(?err, pass, "sweep query failed; skipping pass");
            report.errors += 1;
            return;
        }
    };
    for id in ids {
        match handle(id.clone()).await {
            Ok(SweepOutcome::Untouched) => {}
            Ok(SweepOutcome::Failed) => report.timed_out_failed += 1,
            Ok(SweepOutcome::TimedOutCompleted(eval)) => {
                report.timed_out_completed += 1;
                report.absorb(&eval);
            }
            Ok(SweepOutcome::Recovered(eval)) => {
                report.recovered += 1;
                report.absorb(&eval);
            }
            Ok(SweepOutcome::Promoted(eval)) => {
                if !eval.transitions.is_empty() {
                    report.partial_promoted += 1;
                }
                report.absorb(&eval);
            }
            Ok(SweepOutcome::Advanced(eval)) => report.absorb(&eval),
            Ok(SweepOutcome::Redispatched(sent)) => report.redispatched += sent,
            Ok(SweepOutcome::AudioCompleted) => report.audio_completed += 1,
            Err(err) => {
                error!(?err, pass, batch_id = %id, "batch reconciliation failed; continuing");
                report.errors += 1;
            }
        }
    }
}

/// Deadline passed while still collecting summaries: fail when nothing ever
/// arrived, otherwise treat what arrived as final.
async fn sweep_timed_out(pool: &Pool, dispatcher: &Dispatcher, batch_id: String) -> Result<SweepOutcome> {
    let batch = db::fetch_batch(pool, &batch_id)
        .await?
        .ok_or_else(|| anyhow!("batch {} vanished", batch_id))?;
    db::reconcile_received_count(pool, &batch_id).await?;
    let counts = db::count_units(pool, &batch_id).await?;
    let sources = [BatchStatus::Pending, BatchStatus::PartialComplete];

    if counts.persisted == 0 {
        let won = tracker::transition(
            pool,
            &batch_id,
            &sources,
            BatchStatus::Failed,
            Payload {
                audio_url: None,
                failure_reason: Some(TIMEOUT_FAILURE_REASON),
            },
        )
        .await?;
        if won.is_some() {
            info!(batch_id = %batch_id, expected = batch.expected_count, "batch timed out empty");
            return Ok(SweepOutcome::Failed);
        }
        return Ok(SweepOutcome::Untouched);
    }

    let won = tracker::transition(pool, &batch_id, &sources, BatchStatus::Complete, Payload::default())
        .await?;
    let Some(from) = won else {
        return Ok(SweepOutcome::Untouched);
    };
    info!(
        batch_id = %batch_id,
        %from,
        received = counts.persisted,
        expected = batch.expected_count,
        "timed-out batch completed with partial results"
    );
    let mut eval = Evaluation {
        transitions: vec![(from, BatchStatus::Complete)],
        dispatched: 0,
    };
    let next = evaluator::advance_completed(pool, dispatcher, &batch_id).await?;
    eval.transitions.extend(next.transitions);
    eval.dispatched += next.dispatched;
    Ok(SweepOutcome::TimedOutCompleted(eval))
}

/// A `failed` batch whose units showed up after the deadline.
async fn recover_failed(pool: &Pool, dispatcher: &Dispatcher, batch_id: String) -> Result<SweepOutcome> {
    db::fetch_batch(pool, &batch_id)
        .await?
        .ok_or_else(|| anyhow!("batch {} vanished", batch_id))?;
    db::reconcile_received_count(pool, &batch_id).await?;
    let counts = db::count_units(pool, &batch_id).await?;
    if counts.persisted == 0 {
        return Ok(SweepOutcome::Untouched);
    }

    if counts.all_have_artifacts() {
        let won = tracker::transition(
            pool,
            &batch_id,
            &[BatchStatus::Failed],
            BatchStatus::AudioComplete,
            Payload::default(),
        )
        .await?;
        return Ok(match won {
            Some(from) => {
                info!(batch_id = %batch_id, "failed batch recovered straight to audio_complete");
                SweepOutcome::Recovered(Evaluation {
                    transitions: vec![(from, BatchStatus::AudioComplete)],
                    dispatched: 0,
                })
            }
            None => SweepOutcome::Untouched,
        });
    }

    let won = tracker::transition(
        pool,
        &batch_id,
        &[BatchStatus::Failed],
        BatchStatus::Complete,
        Payload::default(),
    )
    .await?;
    let Some(from) = won else {
        return Ok(SweepOutcome::Untouched);
    };
    info!(batch_id = %batch_id, units = counts.persisted, "failed batch recovered");
    let mut eval = Evaluation {
        transitions: vec![(from, BatchStatus::Complete)],
        dispatched: 0,
    };
    let next = evaluator::advance_completed(pool, dispatcher, &batch_id).await?;
    eval.transitions.extend(next.transitions);
    eval.dispatched += next.dispatched;
    Ok(SweepOutcome::Recovered(eval))
}

/// Redundancy net for a lost ingress-triggered evaluation.
async fn promote_partial(pool: &Pool, dispatcher: &Dispatcher, batch_id: String) -> Result<SweepOutcome> {
    db::fetch_batch(pool, &batch_id)
        .await?
        .ok_or_else(|| anyhow!("batch {} vanished", batch_id))?;
    let eval = evaluator::evaluate(pool, dispatcher, &batch_id).await?;
    Ok(SweepOutcome::Promoted(eval))
}
