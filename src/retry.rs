//! Retry ledger consumer: re-sends audio jobs whose dispatch failed.
use crate::db::{self, Pool};
use crate::model::RetryStatus;
use crate::worker::{AudioRequest, WorkerService};
use anyhow::Result;
use chrono::Utc;
use tracing::{info, instrument, warn};

/// Process the next due ledger entry, if any. Returns whether one was handled.
#[instrument(skip_all)]
pub async fn process_next_retry(
    pool: &Pool,
    worker: &dyn WorkerService,
    callback_url: Option<&str>,
    max_backoff_secs: i64,
) -> Result<bool> {
    let now = Utc::now();
    let Some(entry) = db::next_due_retry(pool, now).await? else {
        return Ok(false);
    };

    let Some(unit) = db::fetch_unit(pool, &entry.unit_id).await? else {
        warn!(id = entry.id, unit_id = %entry.unit_id, "retry entry points at a missing unit");
        db::record_retry_failure(pool, &entry, "unit not found", max_backoff_secs, now).await?;
        return Ok(true);
    };
    if unit.artifact_generated {
        db::mark_retry_success(pool, entry.id).await?;
        info!(id = entry.id, unit_id = %unit.unit_id, "artifact arrived meanwhile; retry closed");
        return Ok(true);
    }

    let req = AudioRequest {
        batch_id: unit.batch_id.clone(),
        unit_id: unit.unit_id.clone(),
        user_id: unit.user_id.clone(),
        content: unit.content.clone(),
        callback_url: callback_url.map(str::to_string),
    };
    match worker.request_audio(&req).await {
        Ok(()) => {
            db::mark_retry_success(pool, entry.id).await?;
            info!(id = entry.id, unit_id = %unit.unit_id, attempt = entry.retry_count + 1, "retry succeeded");
        }
        Err(err) => {
            let status =
                db::record_retry_failure(pool, &entry, &err.to_string(), max_backoff_secs, now).await?;
            if status == RetryStatus::Failed {
                warn!(?err, id = entry.id, unit_id = %unit.unit_id, "retry budget exhausted; giving up on unit");
            } else {
                warn!(?err, id = entry.id, unit_id = %unit.unit_id, attempt = entry.retry_count + 1, "retry failed; backoff");
            }
        }
    }
    Ok(true)
}

/// Handle every entry that is due right now. Returns how many were handled.
pub async fn drain_due(
    pool: &Pool,
    worker: &dyn WorkerService,
    callback_url: Option<&str>,
    max_backoff_secs: i64,
) -> Result<usize> {
    let mut handled = 0;
    while process_next_retry(pool, worker, callback_url, max_backoff_secs).await? {
        handled += 1;
    }
    Ok(handled)
}
