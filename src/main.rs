use std::sync::Arc;

use anyhow::Result;
use strategy_dispatch::config::Config;
use strategy_dispatch::database::setup_database;
use strategy_dispatch::reconciler::Reconciler;
use strategy_dispatch::store::{PgControlStore, PgTaskLog};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt::init();
  let config = Config::from_env()?;
  let db_pool = setup_database(&config.database_url).await?;

  let mut reconciler = Reconciler::new(
    config.scheduler,
    Arc::new(PgControlStore::new(db_pool.clone())),
    Arc::new(PgTaskLog::new(db_pool)),
  )
  .await?;
  reconciler.recover().await?;

  reconciler
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
