use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use activity_relay::broker::HttpBroker;
use activity_relay::config;
use activity_relay::db;
use activity_relay::db::outbox;
use activity_relay::publisher::{Publisher, PublisherConfig};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Publish all due outbox entries to the broker and exit when the queue is empty"
)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Exit successfully even if entries were dead-lettered during the drain
    #[arg(long)]
    skip_failed: bool,

    /// List dead-lettered entries and exit without draining
    #[arg(long)]
    list_failed: bool,

    /// Requeue the given dead-lettered entry ids before draining (repeatable)
    #[arg(long, value_name = "ENTRY_ID")]
    requeue_failed: Vec<i64>,

    /// After draining, delete delivered entries older than this many seconds
    #[arg(long, value_name = "SECONDS")]
    purge_delivered: Option<i64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/activity.db", cfg.app.data_dir));

    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    if args.list_failed {
        let entries = outbox::list_failed(&pool, 100).await?;
        if entries.is_empty() {
            info!("no dead-lettered entries");
        }
        for entry in entries {
            info!(
                entry_id = entry.id,
                activity_id = %entry.activity_id,
                attempts = entry.attempt_count,
                last_error = entry.last_error.as_deref().unwrap_or("unknown"),
                "dead-lettered entry"
            );
        }
        return Ok(());
    }

    for entry_id in args.requeue_failed.iter().copied() {
        if outbox::requeue_failed(&pool, entry_id).await? {
            info!(entry_id, "requeued dead-lettered entry");
        } else {
            warn!(entry_id, "entry is not dead-lettered, skipping");
        }
    }

    for (status, count) in outbox::count_by_status(&pool).await? {
        info!(status = status.as_str(), count, "outbox state");
    }

    let broker = Arc::new(HttpBroker::from_config(&cfg.broker)?);
    let publisher = Publisher::new(pool.clone(), broker, PublisherConfig::from_config(&cfg));

    let report = match publisher.drain_until_empty(args.skip_failed).await {
        Ok(report) => report,
        Err(err) => {
            for entry in outbox::list_failed(&pool, 20).await? {
                error!(
                    entry_id = entry.id,
                    activity_id = %entry.activity_id,
                    attempts = entry.attempt_count,
                    "entry exhausted its attempt budget"
                );
            }
            return Err(err.into());
        }
    };

    info!(
        delivered = report.delivered,
        dead_lettered = report.dead_lettered,
        "outbox drained"
    );

    if report.dead_lettered > 0 {
        for entry in outbox::list_failed(&pool, 20).await? {
            warn!(
                entry_id = entry.id,
                activity_id = %entry.activity_id,
                attempts = entry.attempt_count,
                "dead-lettered entry needs manual requeue"
            );
        }
    }

    if let Some(older_than) = args.purge_delivered {
        let purged = outbox::purge_delivered(&pool, older_than).await?;
        info!(purged, "purged delivered entries");
    }

    Ok(())
}
