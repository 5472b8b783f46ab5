//! Background publisher: drains the outbox and forwards events to the
//! broker. Failed deliveries are rescheduled by the outbox with backoff;
//! a transport-level outage suspends claiming until the broker answers
//! pings again. The loop never crashes the process over a bad delivery.
use futures::{stream, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::broker::{Broker, BrokerError};
use crate::config;
use crate::db::outbox::{self, RetryPolicy};
use crate::db::Pool;
use crate::error::{Error, Result};
use crate::model::OutboxStatus;

/// Upper bound for the reconnect probe interval during an outage.
const RECONNECT_BACKOFF_CAP: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub exchange: String,
    pub routing_key: String,
    pub batch_size: u32,
    pub max_in_flight: usize,
    pub poll_interval: Duration,
    pub lease_secs: u32,
    pub retry: RetryPolicy,
}

impl PublisherConfig {
    pub fn from_config(cfg: &config::Config) -> Self {
        Self {
            exchange: cfg.broker.exchange.clone(),
            routing_key: cfg.broker.routing_key.clone(),
            batch_size: cfg.publisher.batch_size,
            max_in_flight: cfg.publisher.max_in_flight as usize,
            poll_interval: Duration::from_millis(cfg.publisher.poll_interval_ms),
            lease_secs: cfg.publisher.lease_seconds,
            retry: RetryPolicy {
                base_delay_secs: cfg.publisher.base_backoff_seconds,
                max_delay_secs: cfg.publisher.max_backoff_seconds,
                max_attempts: cfg.publisher.max_attempts,
            },
        }
    }
}

/// Outcome of one claim-and-dispatch round.
#[derive(Debug, Default, Clone, Copy)]
pub struct BatchStats {
    pub claimed: usize,
    pub delivered: u64,
    pub dead_lettered: u64,
    pub connection_lost: bool,
}

/// Totals for a full drain (operational CLI).
#[derive(Debug, Default, Clone, Copy)]
pub struct DrainReport {
    pub delivered: u64,
    pub dead_lettered: u64,
}

pub struct Publisher {
    pool: Pool,
    broker: Arc<dyn Broker>,
    cfg: PublisherConfig,
}

impl Publisher {
    pub fn new(pool: Pool, broker: Arc<dyn Broker>, cfg: PublisherConfig) -> Self {
        Self { pool, broker, cfg }
    }

    /// Claim one batch and dispatch it, at most `max_in_flight` entries
    /// concurrently. Settlement failures are logged, not propagated; the
    /// lease guarantees a stuck entry resurfaces later.
    #[instrument(skip_all)]
    pub async fn drain_once(&self) -> Result<BatchStats> {
        let batch =
            outbox::claim_batch(&self.pool, self.cfg.batch_size, self.cfg.lease_secs).await?;
        let claimed = batch.len();
        if claimed == 0 {
            return Ok(BatchStats::default());
        }

        let delivered = AtomicU64::new(0);
        let dead_lettered = AtomicU64::new(0);
        let connection_lost = AtomicBool::new(false);

        stream::iter(batch)
            .for_each_concurrent(self.cfg.max_in_flight, |entry| {
                let delivered = &delivered;
                let dead_lettered = &dead_lettered;
                let connection_lost = &connection_lost;
                async move {
                    let res = self
                        .broker
                        .publish(
                            &self.cfg.exchange,
                            &self.cfg.routing_key,
                            entry.id,
                            &entry.payload,
                        )
                        .await;
                    match res {
                        Ok(()) => match outbox::mark_delivered(&self.pool, entry.id).await {
                            Ok(()) => {
                                delivered.fetch_add(1, Ordering::Relaxed);
                                info!(
                                    entry_id = entry.id,
                                    activity_id = %entry.activity_id,
                                    "event delivered"
                                );
                            }
                            Err(err) => {
                                error!(?err, entry_id = entry.id, "failed to settle delivery");
                            }
                        },
                        Err(err) => {
                            if err.is_connection_loss() {
                                connection_lost.store(true, Ordering::Relaxed);
                            }
                            warn!(
                                entry_id = entry.id,
                                attempt = entry.attempt_count,
                                "delivery failed: {err}"
                            );
                            let settled = outbox::mark_failed(
                                &self.pool,
                                entry.id,
                                entry.attempt_count,
                                &err.to_string(),
                                &self.cfg.retry,
                            )
                            .await;
                            match settled {
                                Ok(Some(OutboxStatus::Failed)) => {
                                    dead_lettered.fetch_add(1, Ordering::Relaxed);
                                }
                                Ok(_) => {}
                                Err(err) => {
                                    error!(?err, entry_id = entry.id, "failed to record failure");
                                }
                            }
                        }
                    }
                }
            })
            .await;

        Ok(BatchStats {
            claimed,
            delivered: delivered.into_inner(),
            dead_lettered: dead_lettered.into_inner(),
            connection_lost: connection_lost.into_inner(),
        })
    }

    /// Long-running loop. Stops when `shutdown` flips; the batch in
    /// flight finishes first, and anything still leased simply expires
    /// and is picked up by the next instance.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("outbox publisher started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.drain_once().await {
                Ok(stats) => {
                    if stats.connection_lost {
                        if !self.wait_for_broker(&mut shutdown).await {
                            break;
                        }
                    } else if stats.claimed == 0 {
                        if !self.pause(&mut shutdown, self.cfg.poll_interval).await {
                            break;
                        }
                    }
                }
                Err(err) => {
                    error!(?err, "publisher loop error");
                    if !self.pause(&mut shutdown, Duration::from_secs(1)).await {
                        break;
                    }
                }
            }
        }
        info!("outbox publisher stopped");
    }

    /// Drive the loop until nothing is pending. Entries backed off into
    /// the near future are waited out; a broker outage aborts instead of
    /// spinning forever.
    pub async fn drain_until_empty(&self, skip_failed: bool) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        loop {
            let stats = self.drain_once().await?;
            report.delivered += stats.delivered;
            report.dead_lettered += stats.dead_lettered;

            if stats.connection_lost {
                return Err(Error::Delivery(BrokerError::Unavailable(
                    "broker unreachable while draining".to_string(),
                )));
            }
            if stats.dead_lettered > 0 && !skip_failed {
                let dead = outbox::list_failed(&self.pool, 1).await?;
                if let Some(entry) = dead.first() {
                    return Err(Error::DeadLetter {
                        entry_id: entry.id,
                        attempts: entry.attempt_count,
                    });
                }
            }
            if stats.claimed == 0 {
                if outbox::count_pending(&self.pool).await? == 0 {
                    return Ok(report);
                }
                // Remaining entries are leased or scheduled for later.
                tokio::time::sleep(self.cfg.poll_interval).await;
            }
        }
    }

    /// Probe the broker with growing pauses until it answers or shutdown
    /// is signalled. Returns false on shutdown.
    async fn wait_for_broker(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        warn!("broker unreachable, suspending deliveries");
        let mut pause = self.cfg.poll_interval.max(Duration::from_secs(1));
        loop {
            if !self.pause(shutdown, pause).await {
                return false;
            }
            match self.broker.ping().await {
                Ok(()) => {
                    info!("broker reachable again, resuming deliveries");
                    return true;
                }
                Err(err) => {
                    warn!("broker still unreachable: {err}");
                    pause = (pause * 2).min(RECONNECT_BACKOFF_CAP);
                }
            }
        }
    }

    /// Returns false when shutdown was signalled during the pause.
    async fn pause(&self, shutdown: &mut watch::Receiver<bool>, length: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(length) => true,
            _ = shutdown.changed() => false,
        }
    }
}
