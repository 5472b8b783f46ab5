use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::Map;
use sqlx::SqlitePool;
use tokio::sync::{watch, Mutex};

use activity_relay::broker::{Broker, BrokerError};
use activity_relay::db::outbox::{self, RetryPolicy};
use activity_relay::db::{store, Pool};
use activity_relay::error::Error;
use activity_relay::model::{ActivityType, NewActivity};
use activity_relay::publisher::{Publisher, PublisherConfig};

#[derive(Debug, Clone)]
struct PublishedMessage {
    exchange: String,
    routing_key: String,
    message_id: i64,
    payload: String,
}

/// Scripted broker that records every publish. Responses pop in order;
/// once the script runs out every publish succeeds.
struct ScriptedBroker {
    responses: Arc<Mutex<VecDeque<Result<(), BrokerError>>>>,
    published: Arc<Mutex<Vec<PublishedMessage>>>,
}

impl ScriptedBroker {
    fn always_ok() -> Self {
        Self::with_responses(Vec::new())
    }

    fn with_responses(responses: Vec<Result<(), BrokerError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into_iter().collect())),
            published: Arc::new(Mutex::new(Vec::new())),
        }
    }

    async fn published_messages(&self) -> Vec<PublishedMessage> {
        self.published.lock().await.clone()
    }
}

#[async_trait]
impl Broker for ScriptedBroker {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message_id: i64,
        payload: &str,
    ) -> Result<(), BrokerError> {
        self.published.lock().await.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            message_id,
            payload: payload.to_string(),
        });
        self.responses.lock().await.pop_front().unwrap_or(Ok(()))
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

async fn setup_pool() -> Pool {
    let pool = SqlitePool::connect("sqlite::memory:")
        .await
        .expect("connect to in-memory sqlite");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("run migrations");
    pool
}

/// Long backoff so a freshly failed entry is never due again within the
/// same test unless it is backdated explicitly.
fn publisher_config(max_attempts: u32) -> PublisherConfig {
    PublisherConfig {
        exchange: "fitness.exchange".to_string(),
        routing_key: "activity.tracking".to_string(),
        batch_size: 16,
        max_in_flight: 4,
        poll_interval: Duration::from_millis(10),
        lease_secs: 30,
        retry: RetryPolicy {
            base_delay_secs: 60,
            max_delay_secs: 3600,
            max_attempts,
        },
    }
}

async fn seed_activity(pool: &Pool, user_id: &str) -> (String, i64) {
    let new = NewActivity {
        user_id: user_id.to_string(),
        activity_type: ActivityType::Run,
        duration_seconds: 1800,
        calories_burned: 350,
        start_time: Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap(),
        additional_metrics: Map::new(),
    };
    let activity = store::create_activity(pool, &new)
        .await
        .expect("create activity");
    let entry_id: i64 = sqlx::query_scalar("SELECT id FROM outbox WHERE activity_id = ?")
        .bind(&activity.id)
        .fetch_one(pool)
        .await
        .expect("outbox entry id");
    (activity.id, entry_id)
}

async fn make_due(pool: &Pool) {
    sqlx::query("UPDATE outbox SET next_attempt_at = datetime('now', '-1 seconds')")
        .execute(pool)
        .await
        .expect("backdate outbox");
}

#[tokio::test]
async fn due_entry_is_published_and_marked_delivered() {
    let pool = setup_pool().await;
    let (activity_id, entry_id) = seed_activity(&pool, "u1").await;
    let broker = Arc::new(ScriptedBroker::always_ok());
    let publisher = Publisher::new(pool.clone(), broker.clone(), publisher_config(3));

    let stats = publisher.drain_once().await.expect("drain");
    assert_eq!(stats.claimed, 1);
    assert_eq!(stats.delivered, 1);
    assert_eq!(stats.dead_lettered, 0);
    assert!(!stats.connection_lost);

    let published = broker.published_messages().await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].exchange, "fitness.exchange");
    assert_eq!(published[0].routing_key, "activity.tracking");
    assert_eq!(published[0].message_id, entry_id);
    let event: serde_json::Value =
        serde_json::from_str(&published[0].payload).expect("payload is JSON");
    assert_eq!(event["id"], activity_id.as_str());
    assert_eq!(event["user_id"], "u1");

    let (status, attempts, delivered_at): (String, i32, Option<String>) =
        sqlx::query_as("SELECT status, attempt_count, delivered_at FROM outbox WHERE id = ?")
            .bind(entry_id)
            .fetch_one(&pool)
            .await
            .expect("outbox row");
    assert_eq!(status, "DELIVERED");
    assert_eq!(attempts, 0);
    assert!(delivered_at.is_some());

    // Nothing left to claim.
    let stats = publisher.drain_once().await.expect("second drain");
    assert_eq!(stats.claimed, 0);
}

#[tokio::test]
async fn rejected_publish_is_retried_then_delivered() {
    let pool = setup_pool().await;
    let (_, entry_id) = seed_activity(&pool, "u1").await;
    let broker = Arc::new(ScriptedBroker::with_responses(vec![Err(
        BrokerError::Rejected("message was not routed".to_string()),
    )]));
    let publisher = Publisher::new(pool.clone(), broker.clone(), publisher_config(3));

    let stats = publisher.drain_once().await.expect("first drain");
    assert_eq!(stats.claimed, 1);
    assert_eq!(stats.delivered, 0);
    assert_eq!(stats.dead_lettered, 0);
    assert!(!stats.connection_lost);

    let (status, attempts, last_error): (String, i32, Option<String>) =
        sqlx::query_as("SELECT status, attempt_count, last_error FROM outbox WHERE id = ?")
            .bind(entry_id)
            .fetch_one(&pool)
            .await
            .expect("outbox row");
    assert_eq!(status, "PENDING");
    assert_eq!(attempts, 1);
    assert!(last_error.is_some());

    // Backed off into the future, not claimable yet.
    let stats = publisher.drain_once().await.expect("drain during backoff");
    assert_eq!(stats.claimed, 0);

    make_due(&pool).await;
    let stats = publisher.drain_once().await.expect("retry drain");
    assert_eq!(stats.delivered, 1);

    let (status, attempts): (String, i32) =
        sqlx::query_as("SELECT status, attempt_count FROM outbox WHERE id = ?")
            .bind(entry_id)
            .fetch_one(&pool)
            .await
            .expect("outbox row");
    assert_eq!(status, "DELIVERED");
    assert_eq!(attempts, 1);

    // Same message id on every attempt, so consumers can deduplicate.
    let published = broker.published_messages().await;
    assert_eq!(published.len(), 2);
    assert_eq!(published[0].message_id, published[1].message_id);
}

#[tokio::test]
async fn exhausted_entry_is_dead_lettered_and_can_be_requeued() {
    let pool = setup_pool().await;
    let (_, entry_id) = seed_activity(&pool, "u1").await;
    let broker = Arc::new(ScriptedBroker::with_responses(vec![
        Err(BrokerError::Rejected("message was not routed".to_string())),
        Err(BrokerError::Rejected("message was not routed".to_string())),
    ]));
    let publisher = Publisher::new(pool.clone(), broker, publisher_config(2));

    let stats = publisher.drain_once().await.expect("first drain");
    assert_eq!(stats.dead_lettered, 0);
    make_due(&pool).await;
    let stats = publisher.drain_once().await.expect("second drain");
    assert_eq!(stats.dead_lettered, 1);

    let failed = outbox::list_failed(&pool, 10).await.expect("list failed");
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, entry_id);
    assert_eq!(failed[0].attempt_count, 2);

    // Dead letters are not claimable, even when due.
    make_due(&pool).await;
    let stats = publisher.drain_once().await.expect("drain with dead letter");
    assert_eq!(stats.claimed, 0);

    // Manual requeue restores the attempt budget and the entry delivers.
    assert!(outbox::requeue_failed(&pool, entry_id).await.expect("requeue"));
    let stats = publisher.drain_once().await.expect("drain after requeue");
    assert_eq!(stats.delivered, 1);

    let (status, attempts): (String, i32) =
        sqlx::query_as("SELECT status, attempt_count FROM outbox WHERE id = ?")
            .bind(entry_id)
            .fetch_one(&pool)
            .await
            .expect("outbox row");
    assert_eq!(status, "DELIVERED");
    assert_eq!(attempts, 0);
}

#[tokio::test]
async fn broker_outage_is_flagged_and_entry_rescheduled() {
    let pool = setup_pool().await;
    let (_, entry_id) = seed_activity(&pool, "u1").await;
    let broker = Arc::new(ScriptedBroker::with_responses(vec![Err(
        BrokerError::Unavailable("connection refused".to_string()),
    )]));
    let publisher = Publisher::new(pool.clone(), broker, publisher_config(3));

    let stats = publisher.drain_once().await.expect("drain");
    assert_eq!(stats.claimed, 1);
    assert_eq!(stats.delivered, 0);
    assert!(stats.connection_lost);

    let (status, attempts): (String, i32) =
        sqlx::query_as("SELECT status, attempt_count FROM outbox WHERE id = ?")
            .bind(entry_id)
            .fetch_one(&pool)
            .await
            .expect("outbox row");
    assert_eq!(status, "PENDING");
    assert_eq!(attempts, 1);
}

#[tokio::test]
async fn publisher_resumes_after_broker_outage() {
    let pool = setup_pool().await;
    let (_, entry_id) = seed_activity(&pool, "u1").await;
    let broker = Arc::new(ScriptedBroker::with_responses(vec![Err(
        BrokerError::Unavailable("connection refused".to_string()),
    )]));
    let publisher = Publisher::new(pool.clone(), broker, publisher_config(3));

    let (tx, rx) = watch::channel(false);
    let worker = tokio::spawn(async move { publisher.run(rx).await });

    // The first attempt hits the outage; once the broker answers pings
    // again the loop resumes claiming and the backdated entry delivers.
    let mut delivered = false;
    for _ in 0..40 {
        make_due(&pool).await;
        let status: String = sqlx::query_scalar("SELECT status FROM outbox WHERE id = ?")
            .bind(entry_id)
            .fetch_one(&pool)
            .await
            .expect("outbox row");
        if status == "DELIVERED" {
            delivered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(delivered, "entry was not redelivered after the outage");

    let _ = tx.send(true);
    tokio::time::timeout(Duration::from_secs(2), worker)
        .await
        .expect("publisher stopped after shutdown")
        .expect("publisher task joined");
}

#[tokio::test]
async fn drain_until_empty_reports_all_deliveries() {
    let pool = setup_pool().await;
    for user in ["u1", "u2", "u3"] {
        seed_activity(&pool, user).await;
    }
    let broker = Arc::new(ScriptedBroker::always_ok());
    let publisher = Publisher::new(pool.clone(), broker, publisher_config(3));

    let report = publisher.drain_until_empty(false).await.expect("drain");
    assert_eq!(report.delivered, 3);
    assert_eq!(report.dead_lettered, 0);

    let remaining = outbox::count_pending(&pool).await.expect("count pending");
    assert_eq!(remaining, 0);
}

#[tokio::test]
async fn drain_until_empty_stops_on_dead_letter() {
    let pool = setup_pool().await;
    let (_, entry_id) = seed_activity(&pool, "u1").await;
    let broker = Arc::new(ScriptedBroker::with_responses(vec![Err(
        BrokerError::Rejected("message was not routed".to_string()),
    )]));
    let publisher = Publisher::new(pool.clone(), broker, publisher_config(1));

    let err = publisher.drain_until_empty(false).await.unwrap_err();
    match err {
        Error::DeadLetter {
            entry_id: id,
            attempts,
        } => {
            assert_eq!(id, entry_id);
            assert_eq!(attempts, 1);
        }
        other => panic!("expected DeadLetter, got {other:?}"),
    }
}

#[tokio::test]
async fn drain_until_empty_can_skip_dead_letters() {
    let pool = setup_pool().await;
    seed_activity(&pool, "u1").await;
    seed_activity(&pool, "u2").await;
    let broker = Arc::new(ScriptedBroker::with_responses(vec![Err(
        BrokerError::Rejected("message was not routed".to_string()),
    )]));
    let publisher = Publisher::new(pool.clone(), broker, publisher_config(1));

    let report = publisher.drain_until_empty(true).await.expect("drain");
    assert_eq!(report.delivered, 1);
    assert_eq!(report.dead_lettered, 1);
}

#[tokio::test]
async fn drain_until_empty_aborts_on_broker_outage() {
    let pool = setup_pool().await;
    seed_activity(&pool, "u1").await;
    let broker = Arc::new(ScriptedBroker::with_responses(vec![Err(
        BrokerError::Unavailable("connection refused".to_string()),
    )]));
    let publisher = Publisher::new(pool.clone(), broker, publisher_config(3));

    let err = publisher.drain_until_empty(false).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Delivery(BrokerError::Unavailable(_))
    ));
}

#[tokio::test]
async fn run_stops_on_shutdown_signal() {
    let pool = setup_pool().await;
    let broker = Arc::new(ScriptedBroker::always_ok());
    let publisher = Publisher::new(pool, broker, publisher_config(3));

    let (tx, rx) = watch::channel(false);
    let worker = tokio::spawn(async move { publisher.run(rx).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    tx.send(true).expect("publisher still listening");

    tokio::time::timeout(Duration::from_secs(2), worker)
        .await
        .expect("publisher stopped after shutdown")
        .expect("publisher task joined");
}
