//! Summary generation cycle: opens a batch for the configured participants
//! and asks the summarizer for one summary per participant.
use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::db::Pool;
use crate::tracker::{self, BatchTicket, NewBatch};
use crate::worker::{SummaryRequest, WorkerService};

#[derive(Debug, Clone, Serialize)]
pub struct GenerationOutcome {
    pub ticket: BatchTicket,
    pub requested: usize,
    pub failed: usize,
}

#[instrument(skip_all, fields(participants = user_ids.len()))]
pub async fn run_generation_cycle(
    pool: &Pool,
    worker: &dyn WorkerService,
    user_ids: &[String],
    timeout: chrono::Duration,
    callback_url: Option<&str>,
) -> Result<GenerationOutcome> {
    let participants = tracker::normalize_participants(user_ids);
    let ticket = tracker::create_batch(
        pool,
        NewBatch {
            expected_count: participants.len() as i64,
            user_ids: participants.clone(),
        },
        timeout,
        Utc::now(),
    )
    .await?;

    let mut requested = 0;
    let mut failed = 0;
    for user_id in &participants {
        let req = SummaryRequest {
            batch_id: ticket.batch_id.clone(),
            user_id: user_id.clone(),
            callback_url: callback_url.map(str::to_string),
        };
        match worker.request_summary(&req).await {
            Ok(()) => requested += 1,
            Err(err) => {
                // The batch deadline and sweep account for summaries that never arrive.
                warn!(?err, batch_id = %ticket.batch_id, user_id = %user_id, "summary request failed");
                failed += 1;
            }
        }
    }
    info!(batch_id = %ticket.batch_id, requested, failed, "generation cycle dispatched");
    Ok(GenerationOutcome {
        ticket,
        requested,
        failed,
    })
}
