use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use strategy_dispatch::config::Config;
use strategy_dispatch::database::setup_database;
use strategy_dispatch::store::PgTaskLog;
use strategy_dispatch::strategy::{PaperConnector, PaperStrategyFactory};
use strategy_dispatch::worker_runtime::WorkerRuntime;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt::init();
  let config = Config::from_env()?;
  let worker_id = config.worker.worker_id.context("WORKER_ID must be set")?;
  let started_at = Utc::now();
  let db_pool = setup_database(&config.database_url).await?;

  let runtime = WorkerRuntime::new(
    worker_id,
    config.worker,
    started_at,
    Arc::new(PgTaskLog::new(db_pool)),
    Arc::new(PaperStrategyFactory),
    Arc::new(PaperConnector::new()),
  );

  runtime
    .run(async {
      if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
      }
      info!("Shutdown requested");
    })
    .await;
  Ok(())
}
