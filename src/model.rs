use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Activity category tag. Stored and published as an uppercase string;
/// unknown tags survive round-trips via `Other`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivityType {
    Run,
    Walk,
    Cycle,
    Swim,
    Other(String),
}

impl ActivityType {
    pub fn as_str(&self) -> &str {
        match self {
            ActivityType::Run => "RUN",
            ActivityType::Walk => "WALK",
            ActivityType::Cycle => "CYCLE",
            ActivityType::Swim => "SWIM",
            ActivityType::Other(s) => s.as_str(),
        }
    }

    pub fn parse_tag(s: &str) -> ActivityType {
        match s {
            "RUN" => ActivityType::Run,
            "WALK" => ActivityType::Walk,
            "CYCLE" => ActivityType::Cycle,
            "SWIM" => ActivityType::Swim,
            other => ActivityType::Other(other.to_string()),
        }
    }
}

impl Serialize for ActivityType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ActivityType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(ActivityType::parse_tag(&s))
    }
}

/// Delivery state of an outbox entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OutboxStatus {
    Pending,
    Delivered,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Delivered => "DELIVERED",
            OutboxStatus::Failed => "FAILED",
        }
    }

    pub fn parse_status(s: &str) -> Option<OutboxStatus> {
        match s {
            "PENDING" => Some(OutboxStatus::Pending),
            "DELIVERED" => Some(OutboxStatus::Delivered),
            "FAILED" => Some(OutboxStatus::Failed),
            _ => None,
        }
    }
}

/// A persisted activity record. Owned by the store once created; only
/// `updated_at` may change afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Activity {
    pub id: String,
    pub user_id: String,
    pub activity_type: ActivityType,
    pub duration_seconds: i64,
    pub calories_burned: i64,
    pub start_time: DateTime<Utc>,
    pub additional_metrics: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Caller-supplied fields for a new activity; ids and timestamps are
/// assigned on creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewActivity {
    pub user_id: String,
    pub activity_type: ActivityType,
    pub duration_seconds: i64,
    #[serde(default)]
    pub calories_burned: i64,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub additional_metrics: Map<String, Value>,
}

/// One queued "activity created" event. `id` is monotonic and doubles as
/// the broker message id for consumer-side deduplication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: i64,
    pub activity_id: String,
    pub payload: String,
    pub status: OutboxStatus,
    pub attempt_count: i32,
    pub created_at: DateTime<Utc>,
    pub next_attempt_at: DateTime<Utc>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub delivered_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activity_type_tags_round_trip() {
        for (ty, tag) in [
            (ActivityType::Run, "RUN"),
            (ActivityType::Walk, "WALK"),
            (ActivityType::Cycle, "CYCLE"),
            (ActivityType::Swim, "SWIM"),
        ] {
            assert_eq!(ty.as_str(), tag);
            assert_eq!(ActivityType::parse_tag(tag), ty);
        }
    }

    #[test]
    fn unknown_activity_type_is_preserved() {
        let ty = ActivityType::parse_tag("ROWING");
        assert_eq!(ty, ActivityType::Other("ROWING".to_string()));
        assert_eq!(ty.as_str(), "ROWING");
    }

    #[test]
    fn activity_type_serde_uses_tag_strings() {
        let json = serde_json::to_string(&ActivityType::Run).unwrap();
        assert_eq!(json, "\"RUN\"");
        let back: ActivityType = serde_json::from_str("\"SWIM\"").unwrap();
        assert_eq!(back, ActivityType::Swim);
    }
}
