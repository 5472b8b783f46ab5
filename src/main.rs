use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use activity_relay::broker::HttpBroker;
use activity_relay::config;
use activity_relay::db;
use activity_relay::publisher::{Publisher, PublisherConfig};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
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

    let broker = Arc::new(HttpBroker::from_config(&cfg.broker)?);
    if let Err(err) = broker.ping().await {
        warn!(error = %err, "broker unreachable at startup, publisher will wait for it");
    }

    let publisher = Publisher::new(pool, broker, PublisherConfig::from_config(&cfg));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = tokio::spawn(async move { publisher.run(shutdown_rx).await });

    info!("activity relay started");
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested, stopping publisher");

    let _ = shutdown_tx.send(true);
    worker.await?;
    info!("publisher stopped");

    Ok(())
}
