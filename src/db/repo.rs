use super::model::{BatchSnapshot, UnitCounts};
use crate::model::{Batch, BatchStatus, RetryEntry, RetryStatus, Unit};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::Row;
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;
use tracing::instrument;
use uuid::Uuid;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database url {}", normalized))?
        .create_if_missing(true)
        // WAL plus a busy timeout lets webhook handlers and the sweep write concurrently.
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(Duration::from_secs(5));
    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") {
        return url.to_string();
    }

    // In-memory URLs like sqlite::memory: or sqlite::memory:?cache=shared
    if url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Batches
// ---------------------------------------------------------------------------

const BATCH_COLUMNS: &str = "batch_id, expected_count, received_count, status, user_ids, \
     created_at, timeout_at, partial_completed_at, completed_at, audio_requested_at, \
     audio_completed_at, audio_failed_at, failed_at, audio_url, failure_reason";

fn batch_from_row(row: &SqliteRow) -> Result<Batch> {
    let batch_id: String = row.try_get("batch_id")?;
    let status_str: String = row.try_get("status")?;
    let status = BatchStatus::parse_status(&status_str)
        .ok_or_else(|| anyhow!("batch {} has unknown status {}", batch_id, status_str))?;
    let user_ids_raw: String = row.try_get("user_ids")?;
    let user_ids: Vec<String> = serde_json::from_str(&user_ids_raw)
        .with_context(|| format!("batch {} has malformed user_ids", batch_id))?;

    Ok(Batch {
        expected_count: row.try_get("expected_count")?,
        received_count: row.try_get("received_count")?,
        status,
        user_ids,
        created_at: row.try_get("created_at")?,
        timeout_at: row.try_get("timeout_at")?,
        partial_completed_at: row.try_get("partial_completed_at")?,
        completed_at: row.try_get("completed_at")?,
        audio_requested_at: row.try_get("audio_requested_at")?,
        audio_completed_at: row.try_get("audio_completed_at")?,
        audio_failed_at: row.try_get("audio_failed_at")?,
        failed_at: row.try_get("failed_at")?,
        audio_url: row.try_get("audio_url")?,
        failure_reason: row.try_get("failure_reason")?,
        batch_id,
    })
}

#[instrument(skip_all)]
pub async fn insert_batch(pool: &Pool, batch: &Batch) -> Result<()> {
    let user_ids = serde_json::to_string(&batch.user_ids)?;
    sqlx::query(
        "INSERT INTO batches (batch_id, expected_count, received_count, status, user_ids, created_at, timeout_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&batch.batch_id)
    .bind(batch.expected_count)
    .bind(batch.received_count)
    .bind(batch.status.as_str())
    .bind(user_ids)
    .bind(batch.created_at)
    .bind(batch.timeout_at)
    .execute(pool)
    .await
    .context("failed to insert batch")?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn fetch_batch(pool: &Pool, batch_id: &str) -> Result<Option<Batch>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM batches WHERE batch_id = ?",
        BATCH_COLUMNS
    ))
    .bind(batch_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(batch_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn fetch_batch_status(pool: &Pool, batch_id: &str) -> Result<Option<BatchStatus>> {
    let status: Option<String> =
        sqlx::query_scalar("SELECT status FROM batches WHERE batch_id = ?")
            .bind(batch_id)
            .fetch_optional(pool)
            .await?;
    status
        .map(|s| {
            BatchStatus::parse_status(&s)
                .ok_or_else(|| anyhow!("batch {} has unknown status {}", batch_id, s))
        })
        .transpose()
}

pub async fn fetch_snapshot(pool: &Pool, batch_id: &str) -> Result<Option<BatchSnapshot>> {
    let Some(batch) = fetch_batch(pool, batch_id).await? else {
        return Ok(None);
    };
    let units = count_units(pool, batch_id).await?;
    Ok(Some(BatchSnapshot { batch, units }))
}

pub async fn list_recent_batches(pool: &Pool, limit: i64) -> Result<Vec<Batch>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM batches ORDER BY created_at DESC LIMIT ?",
        BATCH_COLUMNS
    ))
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.iter().map(batch_from_row).collect()
}

/// Conditionally move a batch from `from` to `to`, stamping the target
/// status' timestamp column. Returns `true` only when this call matched the
/// row in its `from` state; a concurrent winner makes it return `false`.
///
/// `audio_url` is written at most once; `failure_reason` is overwritten when given.
#[instrument(skip_all, fields(batch_id = %batch_id, from = %from, to = %to))]
pub async fn cas_status(
    pool: &Pool,
    batch_id: &str,
    from: BatchStatus,
    to: BatchStatus,
    at: DateTime<Utc>,
    audio_url: Option<&str>,
    failure_reason: Option<&str>,
) -> Result<bool> {
    let stamp = match to.timestamp_column() {
        Some(col) => format!(", {} = ?", col),
        None => String::new(),
    };
    let sql = format!(
        "UPDATE batches SET status = ?{}, audio_url = COALESCE(audio_url, ?), \
         failure_reason = COALESCE(?, failure_reason) WHERE batch_id = ? AND status = ?",
        stamp
    );
    let mut query = sqlx::query(&sql).bind(to.as_str());
    if to.timestamp_column().is_some() {
        query = query.bind(at);
    }
    let res = query
        .bind(audio_url)
        .bind(failure_reason)
        .bind(batch_id)
        .bind(from.as_str())
        .execute(pool)
        .await
        .context("failed to update batch status")?;
    Ok(res.rows_affected() == 1)
}

/// Raise the cached counter to the true number of persisted units.
/// Returns the reconciled value, or `None` when the batch does not exist.
#[instrument(skip_all)]
pub async fn reconcile_received_count(pool: &Pool, batch_id: &str) -> Result<Option<i64>> {
    let count: Option<i64> = sqlx::query_scalar(
        "UPDATE batches SET received_count = MAX(received_count, \
             (SELECT COUNT(*) FROM units WHERE units.batch_id = batches.batch_id)) \
         WHERE batch_id = ? RETURNING received_count",
    )
    .bind(batch_id)
    .fetch_optional(pool)
    .await
    .context("failed to reconcile received count")?;
    Ok(count)
}

#[instrument(skip_all)]
pub async fn list_timed_out_batch_ids(pool: &Pool, now: DateTime<Utc>) -> Result<Vec<String>> {
    let ids = sqlx::query_scalar(
        "SELECT batch_id FROM batches WHERE status IN (?, ?) \
         AND julianday(timeout_at) <= julianday(?) ORDER BY timeout_at ASC",
    )
    .bind(BatchStatus::Pending.as_str())
    .bind(BatchStatus::PartialComplete.as_str())
    .bind(now)
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

#[instrument(skip_all)]
pub async fn list_batch_ids_with_status(pool: &Pool, status: BatchStatus) -> Result<Vec<String>> {
    let ids = sqlx::query_scalar(
        "SELECT batch_id FROM batches WHERE status = ? ORDER BY created_at ASC",
    )
    .bind(status.as_str())
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

/// `failed` batches that now have persisted units (late post-timeout arrivals).
#[instrument(skip_all)]
pub async fn list_orphaned_failed_batch_ids(pool: &Pool) -> Result<Vec<String>> {
    let ids = sqlx::query_scalar(
        "SELECT b.batch_id FROM batches b WHERE b.status = ? \
         AND EXISTS (SELECT 1 FROM units u WHERE u.batch_id = b.batch_id) \
         ORDER BY b.created_at ASC",
    )
    .bind(BatchStatus::Failed.as_str())
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

#[instrument(skip_all)]
pub async fn list_pending_with_receipts(pool: &Pool) -> Result<Vec<String>> {
    let ids = sqlx::query_scalar(
        "SELECT batch_id FROM batches WHERE status = ? AND received_count > 0 \
         ORDER BY created_at ASC",
    )
    .bind(BatchStatus::Pending.as_str())
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

// ---------------------------------------------------------------------------
// Units
// ---------------------------------------------------------------------------

const UNIT_COLUMNS: &str =
    "unit_id, batch_id, user_id, content, artifact_generated, artifact_url, dispatched_at, created_at";

fn unit_from_row(row: &SqliteRow) -> Result<Unit> {
    Ok(Unit {
        unit_id: row.try_get("unit_id")?,
        batch_id: row.try_get("batch_id")?,
        user_id: row.try_get("user_id")?,
        content: row.try_get("content")?,
        artifact_generated: row.try_get("artifact_generated")?,
        artifact_url: row.try_get("artifact_url")?,
        dispatched_at: row.try_get("dispatched_at")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Persist a first-stage result. A repeat for the same `(batch_id, user_id)`
/// refreshes the content and leaves `received_count` alone.
///
/// Returns the unit id and whether a new unit was created.
#[instrument(skip_all)]
pub async fn upsert_unit(
    pool: &Pool,
    batch_id: &str,
    user_id: &str,
    content: &str,
    now: DateTime<Utc>,
) -> Result<(String, bool)> {
    let mut tx = pool.begin().await?;
    let fresh_id = Uuid::new_v4().to_string();
    let inserted: Option<String> = sqlx::query_scalar(
        "INSERT INTO units (unit_id, batch_id, user_id, content, artifact_generated, created_at, updated_at) \
         VALUES (?, ?, ?, ?, 0, ?, ?) ON CONFLICT (batch_id, user_id) DO NOTHING RETURNING unit_id",
    )
    .bind(&fresh_id)
    .bind(batch_id)
    .bind(user_id)
    .bind(content)
    .bind(now)
    .bind(now)
    .fetch_optional(&mut *tx)
    .await?;

    let result = match inserted {
        Some(unit_id) => {
            sqlx::query("UPDATE batches SET received_count = received_count + 1 WHERE batch_id = ?")
                .bind(batch_id)
                .execute(&mut *tx)
                .await?;
            (unit_id, true)
        }
        None => {
            let unit_id: String = sqlx::query_scalar(
                "UPDATE units SET content = ?, updated_at = ? WHERE batch_id = ? AND user_id = ? RETURNING unit_id",
            )
            .bind(content)
            .bind(now)
            .bind(batch_id)
            .bind(user_id)
            .fetch_one(&mut *tx)
            .await?;
            (unit_id, false)
        }
    };
    tx.commit().await?;
    Ok(result)
}

#[instrument(skip_all)]
pub async fn fetch_unit(pool: &Pool, unit_id: &str) -> Result<Option<Unit>> {
    let row = sqlx::query(&format!("SELECT {} FROM units WHERE unit_id = ?", UNIT_COLUMNS))
        .bind(unit_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(unit_from_row).transpose()
}

pub async fn list_units(pool: &Pool, batch_id: &str) -> Result<Vec<Unit>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM units WHERE batch_id = ? ORDER BY created_at ASC, unit_id ASC",
        UNIT_COLUMNS
    ))
    .bind(batch_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(unit_from_row).collect()
}

#[instrument(skip_all)]
pub async fn count_units(pool: &Pool, batch_id: &str) -> Result<UnitCounts> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS persisted, COALESCE(SUM(artifact_generated), 0) AS with_artifact \
         FROM units WHERE batch_id = ?",
    )
    .bind(batch_id)
    .fetch_one(pool)
    .await?;
    Ok(UnitCounts {
        persisted: row.try_get("persisted")?,
        with_artifact: row.try_get("with_artifact")?,
    })
}

/// Units that still lack an artifact and were never handed to the dispatch queue.
pub async fn list_dispatch_candidates(pool: &Pool, batch_id: &str) -> Result<Vec<Unit>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM units WHERE batch_id = ? AND artifact_generated = 0 \
         AND dispatched_at IS NULL ORDER BY created_at ASC, unit_id ASC",
        UNIT_COLUMNS
    ))
    .bind(batch_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(unit_from_row).collect()
}

/// Claim one unit for dispatch. Only the first caller for a unit gets `true`.
#[instrument(skip_all)]
pub async fn claim_unit_for_dispatch(pool: &Pool, unit_id: &str, at: DateTime<Utc>) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE units SET dispatched_at = ?, updated_at = ? \
         WHERE unit_id = ? AND dispatched_at IS NULL AND artifact_generated = 0",
    )
    .bind(at)
    .bind(at)
    .bind(unit_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Batches in a dispatching state holding units whose claim is older than
/// `cutoff` with no artifact and no live retry entry.
#[instrument(skip_all)]
pub async fn list_batches_with_stale_dispatch(
    pool: &Pool,
    cutoff: DateTime<Utc>,
) -> Result<Vec<String>> {
    let ids = sqlx::query_scalar(
        "SELECT DISTINCT b.batch_id FROM batches b JOIN units u ON u.batch_id = b.batch_id \
         WHERE b.status IN (?, ?, ?) AND u.artifact_generated = 0 AND u.dispatched_at IS NOT NULL \
         AND julianday(u.dispatched_at) <= julianday(?) \
         AND NOT EXISTS (SELECT 1 FROM retry_ledger r WHERE r.unit_id = u.unit_id AND r.status != ?) \
         ORDER BY b.batch_id ASC",
    )
    .bind(BatchStatus::PartialComplete.as_str())
    .bind(BatchStatus::Complete.as_str())
    .bind(BatchStatus::AudioRequested.as_str())
    .bind(cutoff)
    .bind(RetryStatus::Success.as_str())
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

/// Units of one batch whose dispatch claim expired at `cutoff`. Units owned by
/// a pending, retrying or exhausted ledger entry are left to the ledger.
pub async fn list_stale_dispatched_units(
    pool: &Pool,
    batch_id: &str,
    cutoff: DateTime<Utc>,
) -> Result<Vec<Unit>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM units u WHERE u.batch_id = ? AND u.artifact_generated = 0 \
         AND u.dispatched_at IS NOT NULL AND julianday(u.dispatched_at) <= julianday(?) \
         AND NOT EXISTS (SELECT 1 FROM retry_ledger r WHERE r.unit_id = u.unit_id AND r.status != ?) \
         ORDER BY u.created_at ASC, u.unit_id ASC",
        UNIT_COLUMNS
    ))
    .bind(batch_id)
    .bind(cutoff)
    .bind(RetryStatus::Success.as_str())
    .fetch_all(pool)
    .await?;
    rows.iter().map(unit_from_row).collect()
}

/// Renew an expired claim. Only one caller wins per expiry.
#[instrument(skip_all)]
pub async fn reclaim_stale_unit(
    pool: &Pool,
    unit_id: &str,
    cutoff: DateTime<Utc>,
    at: DateTime<Utc>,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE units SET dispatched_at = ?, updated_at = ? \
         WHERE unit_id = ? AND artifact_generated = 0 AND dispatched_at IS NOT NULL \
         AND julianday(dispatched_at) <= julianday(?)",
    )
    .bind(at)
    .bind(at)
    .bind(unit_id)
    .bind(cutoff)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Flag a unit's artifact as ready. Returns `false` if it was already flagged.
#[instrument(skip_all)]
pub async fn mark_artifact_ready(
    pool: &Pool,
    unit_id: &str,
    artifact_url: &str,
    at: DateTime<Utc>,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE units SET artifact_generated = 1, artifact_url = ?, updated_at = ? \
         WHERE unit_id = ? AND artifact_generated = 0",
    )
    .bind(artifact_url)
    .bind(at)
    .bind(unit_id)
    .execute(pool)
    .await
    .context("failed to flag unit artifact")?;
    Ok(res.rows_affected() == 1)
}

// ---------------------------------------------------------------------------
// Retry ledger
// ---------------------------------------------------------------------------

fn retry_from_row(row: &SqliteRow) -> Result<RetryEntry> {
    let status_str: String = row.try_get("status")?;
    let status = RetryStatus::parse_status(&status_str)
        .ok_or_else(|| anyhow!("retry entry has unknown status {}", status_str))?;
    Ok(RetryEntry {
        id: row.try_get("id")?,
        batch_id: row.try_get("batch_id")?,
        unit_id: row.try_get("unit_id")?,
        retry_count: row.try_get("retry_count")?,
        max_retries: row.try_get("max_retries")?,
        status,
        last_error: row.try_get("last_error")?,
        next_retry_at: row.try_get("next_retry_at")?,
    })
}

/// Open a ledger entry for a unit whose dispatch failed. A unit keeps a single
/// entry; a second failure report while one exists is ignored.
#[instrument(skip_all)]
pub async fn open_retry_entry(
    pool: &Pool,
    batch_id: &str,
    unit_id: &str,
    max_retries: i32,
    last_error: &str,
    next_retry_at: DateTime<Utc>,
) -> Result<bool> {
    let now = Utc::now();
    let res = sqlx::query(
        "INSERT INTO retry_ledger (batch_id, unit_id, retry_count, max_retries, status, last_error, next_retry_at, created_at, updated_at) \
         VALUES (?, ?, 0, ?, ?, ?, ?, ?, ?) ON CONFLICT (unit_id) DO NOTHING",
    )
    .bind(batch_id)
    .bind(unit_id)
    .bind(max_retries)
    .bind(RetryStatus::Pending.as_str())
    .bind(last_error)
    .bind(next_retry_at)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn next_due_retry(pool: &Pool, now: DateTime<Utc>) -> Result<Option<RetryEntry>> {
    let row = sqlx::query(
        "SELECT id, batch_id, unit_id, retry_count, max_retries, status, last_error, next_retry_at \
         FROM retry_ledger WHERE status IN (?, ?) AND julianday(next_retry_at) <= julianday(?) \
         ORDER BY julianday(next_retry_at) ASC LIMIT 1",
    )
    .bind(RetryStatus::Pending.as_str())
    .bind(RetryStatus::Retrying.as_str())
    .bind(now)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(retry_from_row).transpose()
}

pub async fn fetch_retry_for_unit(pool: &Pool, unit_id: &str) -> Result<Option<RetryEntry>> {
    let row = sqlx::query(
        "SELECT id, batch_id, unit_id, retry_count, max_retries, status, last_error, next_retry_at \
         FROM retry_ledger WHERE unit_id = ?",
    )
    .bind(unit_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(retry_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn mark_retry_success(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("UPDATE retry_ledger SET status = ?, updated_at = ? WHERE id = ?")
        .bind(RetryStatus::Success.as_str())
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Record a failed retry attempt. Exponential backoff: 5s * 2^attempt, capped
/// at `max_cap_secs` (no cap when <= 0). Reaching `max_retries` is terminal.
#[instrument(skip_all)]
pub async fn record_retry_failure(
    pool: &Pool,
    entry: &RetryEntry,
    error: &str,
    max_cap_secs: i64,
    now: DateTime<Utc>,
) -> Result<RetryStatus> {
    let attempt = entry.retry_count + 1;
    let status = if attempt >= entry.max_retries {
        RetryStatus::Failed
    } else {
        RetryStatus::Retrying
    };
    let secs = backoff_secs(attempt, max_cap_secs);
    sqlx::query(
        "UPDATE retry_ledger SET retry_count = ?, status = ?, last_error = ?, next_retry_at = ?, updated_at = ? \
         WHERE id = ?",
    )
    .bind(attempt)
    .bind(status.as_str())
    .bind(error)
    .bind(now + chrono::Duration::seconds(secs))
    .bind(now)
    .bind(entry.id)
    .execute(pool)
    .await?;
    Ok(status)
}

pub fn backoff_secs(attempt: i32, max_cap_secs: i64) -> i64 {
    let secs = 5_i64 * (1_i64 << attempt.clamp(0, 10));
    if max_cap_secs <= 0 {
        secs
    } else {
        secs.min(max_cap_secs)
    }
}

#[instrument(skip_all)]
pub async fn count_open_retries(pool: &Pool) -> Result<i64> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM retry_ledger WHERE status IN (?, ?)")
            .bind(RetryStatus::Pending.as_str())
            .bind(RetryStatus::Retrying.as_str())
            .fetch_one(pool)
            .await?;
    Ok(count)
}
