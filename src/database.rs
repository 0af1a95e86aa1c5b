use sqlx::migrate::Migrator;
use sqlx::{Pool, Postgres};
use tokio_retry::Retry;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::info;

use crate::store::StoreError;

static MIGRATOR: Migrator = sqlx::migrate!();

static MAX_RETRIES: usize = 5;
static DELAY: u64 = 100;

/// Connects to Postgres, retrying with exponential backoff, and applies pending migrations.
pub async fn setup_database(database_url: &str) -> Result<Pool<Postgres>, StoreError> {
  let pool = Retry::spawn(ExponentialBackoff::from_millis(DELAY).take(MAX_RETRIES), || {
    Pool::<Postgres>::connect(database_url)
  })
  .await?;
  info!("Database connection established");

  MIGRATOR.run(&pool).await?;
  info!("Database migrations complete");
  Ok(pool)
}
