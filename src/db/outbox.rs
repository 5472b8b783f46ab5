//! Durable event queue co-located with the activity store.
//!
//! Entries are claimed with a time-bounded lease instead of a lock: a
//! single conditional UPDATE makes a batch invisible to other claimants
//! until `lease_expires_at` passes. A claimant that dies simply lets its
//! lease lapse and the entries become claimable again, so delivery is
//! at-least-once across crashes and restarts.
use super::Pool;
use crate::error::{Error, Result};
use crate::model::{Activity, OutboxEntry, OutboxStatus};
use rand::Rng;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};
use tracing::{instrument, warn};

/// Column list for `outbox` queries.
const OUTBOX_COLUMNS: &str = "\
    id, activity_id, payload, status, attempt_count, created_at, \
    next_attempt_at, lease_expires_at, last_attempt_at, last_error, delivered_at";

/// Retry schedule for failed deliveries.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay_secs: u32,
    pub max_delay_secs: u32,
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Exponential backoff with jitter: base * 2^attempt, capped, then
    /// the upper half is randomized so concurrent retries spread out.
    pub fn delay_secs(&self, attempt: i32) -> i64 {
        let exp = attempt.clamp(0, 10) as u32;
        let raw = (self.base_delay_secs.max(1) as i64) << exp;
        let capped = raw.min(self.max_delay_secs.max(1) as i64);
        let half = capped / 2;
        half + rand::thread_rng().gen_range(0..=capped - half)
    }
}

/// Insert the event snapshot for a freshly created activity inside the
/// caller's transaction. Only `store::create_activity` calls this; the
/// UNIQUE index on `activity_id` keeps it one entry per activity.
pub(crate) async fn enqueue_tx(
    tx: &mut Transaction<'_, Sqlite>,
    activity: &Activity,
) -> Result<i64> {
    let payload = serde_json::to_string(activity)?;
    let rec = sqlx::query(
        "INSERT INTO outbox (activity_id, payload, status, attempt_count, created_at, next_attempt_at) \
         VALUES (?, ?, ?, 0, ?, ?) RETURNING id",
    )
    .bind(&activity.id)
    .bind(&payload)
    .bind(OutboxStatus::Pending.as_str())
    .bind(activity.created_at)
    .bind(activity.created_at)
    .fetch_one(&mut **tx)
    .await?;
    Ok(rec.get("id"))
}

/// Atomically lease up to `max_n` due entries, oldest first. Claimed
/// entries stay invisible to other claimants until the lease expires.
#[instrument(skip_all)]
pub async fn claim_batch(pool: &Pool, max_n: u32, lease_secs: u32) -> Result<Vec<OutboxEntry>> {
    let query = format!(
        "UPDATE outbox SET lease_expires_at = datetime('now', ? || ' seconds') \
         WHERE id IN ( \
             SELECT id FROM outbox \
             WHERE status = 'PENDING' \
               AND (lease_expires_at IS NULL OR datetime(lease_expires_at) <= CURRENT_TIMESTAMP) \
               AND datetime(next_attempt_at) <= CURRENT_TIMESTAMP \
             ORDER BY datetime(created_at) ASC, id ASC \
             LIMIT ? \
         ) \
         RETURNING {OUTBOX_COLUMNS}"
    );
    let rows = sqlx::query(&query)
        .bind(i64::from(lease_secs))
        .bind(i64::from(max_n))
        .fetch_all(pool)
        .await?;
    rows.iter().map(entry_from_row).collect()
}

/// Settle an entry after broker acknowledgment. Idempotent: repeating the
/// call changes nothing, and the first `delivered_at` wins.
#[instrument(skip_all)]
pub async fn mark_delivered(pool: &Pool, entry_id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE outbox SET status = 'DELIVERED', \
         delivered_at = COALESCE(delivered_at, CURRENT_TIMESTAMP), \
         lease_expires_at = NULL, last_error = NULL \
         WHERE id = ?",
    )
    .bind(entry_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Record a failed delivery attempt: bump the attempt count, release the
/// lease and reschedule with backoff, or park the entry as FAILED once
/// the attempt budget is spent. Returns the resulting status, or None if
/// the entry was not PENDING (already settled elsewhere).
#[instrument(skip_all)]
pub async fn mark_failed(
    pool: &Pool,
    entry_id: i64,
    attempt: i32,
    reason: &str,
    policy: &RetryPolicy,
) -> Result<Option<OutboxStatus>> {
    let attempts = attempt + 1;
    if attempts >= policy.max_attempts as i32 {
        let res = sqlx::query(
            "UPDATE outbox SET status = 'FAILED', attempt_count = ?, \
             last_attempt_at = CURRENT_TIMESTAMP, last_error = ?, lease_expires_at = NULL \
             WHERE id = ? AND status = 'PENDING'",
        )
        .bind(attempts)
        .bind(reason)
        .bind(entry_id)
        .execute(pool)
        .await?;
        if res.rows_affected() == 0 {
            return Ok(None);
        }
        warn!(entry_id, attempts, reason, "outbox entry dead-lettered");
        Ok(Some(OutboxStatus::Failed))
    } else {
        let secs = policy.delay_secs(attempt);
        let res = sqlx::query(
            "UPDATE outbox SET attempt_count = ?, last_attempt_at = CURRENT_TIMESTAMP, \
             last_error = ?, lease_expires_at = NULL, \
             next_attempt_at = datetime('now', ? || ' seconds') \
             WHERE id = ? AND status = 'PENDING'",
        )
        .bind(attempts)
        .bind(reason)
        .bind(secs)
        .bind(entry_id)
        .execute(pool)
        .await?;
        if res.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(OutboxStatus::Pending))
    }
}

/// Put a dead letter back in line with a fresh attempt budget.
#[instrument(skip_all)]
pub async fn requeue_failed(pool: &Pool, entry_id: i64) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE outbox SET status = 'PENDING', attempt_count = 0, \
         next_attempt_at = CURRENT_TIMESTAMP, lease_expires_at = NULL, last_error = NULL \
         WHERE id = ? AND status = 'FAILED'",
    )
    .bind(entry_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

/// Dead letters awaiting operator attention, oldest first.
pub async fn list_failed(pool: &Pool, limit: u32) -> Result<Vec<OutboxEntry>> {
    let query = format!(
        "SELECT {OUTBOX_COLUMNS} FROM outbox WHERE status = 'FAILED' \
         ORDER BY datetime(created_at) ASC, id ASC LIMIT ?"
    );
    let rows = sqlx::query(&query)
        .bind(i64::from(limit))
        .fetch_all(pool)
        .await?;
    rows.iter().map(entry_from_row).collect()
}

pub async fn count_pending(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox WHERE status = 'PENDING'")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

pub async fn count_by_status(pool: &Pool) -> Result<Vec<(OutboxStatus, i64)>> {
    let rows =
        sqlx::query("SELECT status, COUNT(*) AS n FROM outbox GROUP BY status ORDER BY status")
            .fetch_all(pool)
            .await?;
    let mut counts = Vec::with_capacity(rows.len());
    for row in &rows {
        let tag: String = row.get("status");
        if let Some(status) = OutboxStatus::parse_status(&tag) {
            counts.push((status, row.get::<i64, _>("n")));
        }
    }
    Ok(counts)
}

pub async fn outbox_entry_count_for(pool: &Pool, activity_id: &str) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox WHERE activity_id = ?")
        .bind(activity_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Drop delivered entries older than the retention window. Returns the
/// number of rows removed.
#[instrument(skip_all)]
pub async fn purge_delivered(pool: &Pool, older_than_secs: i64) -> Result<u64> {
    let res = sqlx::query(
        "DELETE FROM outbox WHERE status = 'DELIVERED' \
         AND datetime(delivered_at) <= datetime('now', '-' || ? || ' seconds')",
    )
    .bind(older_than_secs)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

fn entry_from_row(row: &SqliteRow) -> Result<OutboxEntry> {
    let status_tag: String = row.get("status");
    let status = OutboxStatus::parse_status(&status_tag).ok_or_else(|| {
        Error::Storage(sqlx::Error::ColumnDecode {
            index: "status".into(),
            source: format!("unknown outbox status {status_tag}").into(),
        })
    })?;
    Ok(OutboxEntry {
        id: row.get("id"),
        activity_id: row.get("activity_id"),
        payload: row.get("payload"),
        status,
        attempt_count: row.get("attempt_count"),
        created_at: row.get("created_at"),
        next_attempt_at: row.get("next_attempt_at"),
        lease_expires_at: row.get("lease_expires_at"),
        last_attempt_at: row.get("last_attempt_at"),
        last_error: row.get("last_error"),
        delivered_at: row.get("delivered_at"),
    })
}
