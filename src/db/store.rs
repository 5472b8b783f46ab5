//! Activity record storage.
use super::{outbox, Pool};
use crate::error::{Error, Result};
use crate::model::{Activity, ActivityType, NewActivity};
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::instrument;
use uuid::Uuid;

/// Column list for `activities` queries.
const ACTIVITY_COLUMNS: &str = "\
    id, user_id, activity_type, duration_seconds, calories_burned, \
    start_time, additional_metrics, created_at, updated_at";

/// Insert a new activity together with its outbox entry in one
/// transaction. Either both rows exist after this returns Ok, or neither.
#[instrument(skip_all, fields(user_id = %new.user_id))]
pub async fn create_activity(pool: &Pool, new: &NewActivity) -> Result<Activity> {
    validate_new_activity(new)?;

    let now = Utc::now();
    let activity = Activity {
        id: Uuid::new_v4().to_string(),
        user_id: new.user_id.clone(),
        activity_type: new.activity_type.clone(),
        duration_seconds: new.duration_seconds,
        calories_burned: new.calories_burned,
        start_time: new.start_time,
        additional_metrics: new.additional_metrics.clone(),
        created_at: now,
        updated_at: now,
    };
    let metrics = serde_json::to_string(&activity.additional_metrics)?;

    let mut tx = pool.begin().await?;
    sqlx::query(
        "INSERT INTO activities (id, user_id, activity_type, duration_seconds, calories_burned, \
         start_time, additional_metrics, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&activity.id)
    .bind(&activity.user_id)
    .bind(activity.activity_type.as_str())
    .bind(activity.duration_seconds)
    .bind(activity.calories_burned)
    .bind(activity.start_time)
    .bind(&metrics)
    .bind(activity.created_at)
    .bind(activity.updated_at)
    .execute(&mut *tx)
    .await?;

    let entry_id = outbox::enqueue_tx(&mut tx, &activity).await?;
    tx.commit().await?;

    tracing::debug!(activity_id = %activity.id, entry_id, "activity stored");
    Ok(activity)
}

/// Request-shape checks shared with the gateway. These reject before any
/// side effect, regardless of what the user validator would say.
pub(crate) fn validate_new_activity(new: &NewActivity) -> Result<()> {
    if new.user_id.trim().is_empty() {
        return Err(Error::Validation("user_id must be non-empty".to_string()));
    }
    if new.duration_seconds <= 0 {
        return Err(Error::Validation(
            "duration_seconds must be > 0".to_string(),
        ));
    }
    if new.calories_burned < 0 {
        return Err(Error::Validation(
            "calories_burned must be >= 0".to_string(),
        ));
    }
    Ok(())
}

pub async fn get_activity(pool: &Pool, id: &str) -> Result<Activity> {
    let query = format!("SELECT {ACTIVITY_COLUMNS} FROM activities WHERE id = ?");
    let row = sqlx::query(&query).bind(id).fetch_optional(pool).await?;
    let Some(row) = row else {
        return Err(Error::NotFound(id.to_string()));
    };
    activity_from_row(&row)
}

/// Newest first; an unknown user yields an empty list, not an error.
pub async fn list_activities_by_user(pool: &Pool, user_id: &str) -> Result<Vec<Activity>> {
    let query = format!(
        "SELECT {ACTIVITY_COLUMNS} FROM activities WHERE user_id = ? \
         ORDER BY datetime(start_time) DESC, id ASC"
    );
    let rows = sqlx::query(&query).bind(user_id).fetch_all(pool).await?;
    rows.iter().map(activity_from_row).collect()
}

fn activity_from_row(row: &SqliteRow) -> Result<Activity> {
    let type_tag: String = row.get("activity_type");
    let metrics_raw: String = row.get("additional_metrics");
    Ok(Activity {
        id: row.get("id"),
        user_id: row.get("user_id"),
        activity_type: ActivityType::parse_tag(&type_tag),
        duration_seconds: row.get("duration_seconds"),
        calories_burned: row.get("calories_burned"),
        start_time: row.get("start_time"),
        additional_metrics: serde_json::from_str(&metrics_raw)?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
