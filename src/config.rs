use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::models::WorkerId;

#[derive(Debug, Clone)]
pub struct Config {
  pub database_url: String,
  pub scheduler: SchedulerConfig,
  pub worker: WorkerConfig,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
  pub worker_count: u32,
  pub worker_capacity: usize,
  /// Slots held back on every worker; a worker is eligible while its reported load plus this stays below capacity.
  /// Defaults to 0, not one full start batch; within a batch the slot's own capacity check bounds admission.
  pub reserve_margin: usize,
  /// Must exceed the worker heartbeat interval plus one poll, or healthy workers drop out between beats.
  pub heartbeat_freshness: Duration,
  pub cycle_delay: Duration,
  /// Pending starts planned longer ago than this are ignored.
  pub start_lookback: Duration,
  pub min_task_id: i64,
  pub recovery_lookback: Duration,
}

impl Default for SchedulerConfig {
  fn default() -> Self {
    Self {
      worker_count: 10,
      worker_capacity: 10,
      reserve_margin: 0,
      heartbeat_freshness: Duration::from_secs(45),
      cycle_delay: Duration::from_secs(5),
      start_lookback: Duration::from_secs(3600),
      min_task_id: 0,
      recovery_lookback: Duration::from_secs(3600),
    }
  }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
  pub worker_id: Option<WorkerId>,
  pub poll_interval: Duration,
  pub heartbeat_interval: Duration,
  pub snapshot_max_age: Duration,
}

impl Default for WorkerConfig {
  fn default() -> Self {
    Self {
      worker_id: None,
      poll_interval: Duration::from_millis(1000),
      heartbeat_interval: Duration::from_secs(30),
      snapshot_max_age: Duration::from_secs(86400),
    }
  }
}

impl Config {
  pub fn from_env() -> Result<Self> {
    let scheduler = SchedulerConfig::default();
    let worker = WorkerConfig::default();
    Ok(Self {
      database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
      scheduler: SchedulerConfig {
        worker_count: var_or("WORKER_COUNT", scheduler.worker_count)?,
        worker_capacity: var_or("WORKER_CAPACITY", scheduler.worker_capacity)?,
        reserve_margin: var_or("RESERVE_MARGIN", scheduler.reserve_margin)?,
        heartbeat_freshness: secs_or("HEARTBEAT_FRESHNESS_SECS", scheduler.heartbeat_freshness)?,
        cycle_delay: secs_or("CYCLE_DELAY_SECS", scheduler.cycle_delay)?,
        start_lookback: secs_or("START_LOOKBACK_SECS", scheduler.start_lookback)?,
        min_task_id: var_or("MIN_TASK_ID", scheduler.min_task_id)?,
        recovery_lookback: secs_or("RECOVERY_LOOKBACK_SECS", scheduler.recovery_lookback)?,
      },
      worker: WorkerConfig {
        worker_id: var("WORKER_ID")?,
        poll_interval: var::<u32>("POLL_INTERVAL_MILLIS")?
          .map_or(worker.poll_interval, |millis| Duration::from_millis(millis.into())),
        heartbeat_interval: secs_or("HEARTBEAT_INTERVAL_SECS", worker.heartbeat_interval)?,
        snapshot_max_age: secs_or("SNAPSHOT_MAX_AGE_SECS", worker.snapshot_max_age)?,
      },
    })
  }
}

/// Converts a configured interval for arithmetic on timestamps.
pub fn span(duration: Duration) -> chrono::Duration {
  chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero())
}

fn var<T>(name: &str) -> Result<Option<T>>
where
  T: FromStr,
  T::Err: std::error::Error + Send + Sync + 'static,
{
  match env::var(name) {
    Ok(raw) => raw.trim().parse().map(Some).with_context(|| format!("{name}={raw:?} is not valid")),
    Err(_) => Ok(None),
  }
}

fn var_or<T>(name: &str, default: T) -> Result<T>
where
  T: FromStr,
  T::Err: std::error::Error + Send + Sync + 'static,
{
  Ok(var(name)?.unwrap_or(default))
}

fn secs_or(name: &str, default: Duration) -> Result<Duration> {
  Ok(var::<u32>(name)?.map_or(default, |secs| Duration::from_secs(secs.into())))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn span_converts_configured_intervals() {
    assert_eq!(span(Duration::from_secs(30)), chrono::Duration::seconds(30));
    assert_eq!(span(SchedulerConfig::default().start_lookback), chrono::Duration::hours(1));
  }

  #[test]
  fn default_freshness_outlasts_a_heartbeat_gap() {
    let scheduler = SchedulerConfig::default();
    let worker = WorkerConfig::default();
    assert!(scheduler.heartbeat_freshness > worker.heartbeat_interval + worker.poll_interval);
  }

  #[test]
  fn unset_variables_fall_back() {
    assert_eq!(var_or("DISPATCH_TEST_UNSET_VARIABLE", 7u32).unwrap(), 7);
    assert_eq!(
      secs_or("DISPATCH_TEST_UNSET_SECS", Duration::from_secs(5)).unwrap(),
      Duration::from_secs(5)
    );
  }
}
