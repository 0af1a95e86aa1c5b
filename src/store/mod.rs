//! Interfaces to the two shared resources: the control store (desired state,
//! accounts, operator requests) and the durable log (envelopes, heartbeats,
//! pause snapshots). Both have a Postgres backend and an in-memory backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::envelope::{EnvelopeCursor, LoggedEnvelope, TaskEnvelope};
use crate::models::{
  ConfigEdit, ControlRequest, Credentials, DesiredState, ExchangeProfile, Heartbeat, StrategyKind, TaskRecord,
};

pub mod memory;
pub mod postgres;

pub use memory::{MemoryControlStore, MemoryTaskLog};
pub use postgres::{PgControlStore, PgTaskLog};

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),

  #[error("migration error: {0}")]
  Migrate(#[from] sqlx::migrate::MigrateError),

  #[error("unrecognised {field} value {value} in row {row}")]
  Corrupt { field: &'static str, value: String, row: String },
}

#[async_trait]
pub trait ControlStore: Send + Sync {
  async fn exchanges(&self) -> Result<Vec<ExchangeProfile>, StoreError>;

  async fn strategy_kinds(&self) -> Result<Vec<StrategyKind>, StoreError>;

  /// Tasks in `state` with an id above `min_task_id`; when `planned_since` is
  /// set, only those planned between then and now.
  async fn tasks_in_state(
    &self,
    state: DesiredState,
    planned_since: Option<DateTime<Utc>>,
    min_task_id: i64,
  ) -> Result<Vec<TaskRecord>, StoreError>;

  async fn task(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError>;

  async fn desired_state(&self, task_id: &str) -> Result<Option<DesiredState>, StoreError>;

  async fn set_desired_state(&self, task_id: &str, state: DesiredState) -> Result<(), StoreError>;

  async fn credentials(&self, account_id: i64) -> Result<Option<Credentials>, StoreError>;

  async fn pending_controls(&self) -> Result<Vec<ControlRequest>, StoreError>;

  async fn acknowledge_control(&self, control_id: i64) -> Result<(), StoreError>;

  async fn pending_config_edits(&self) -> Result<Vec<ConfigEdit>, StoreError>;

  async fn mark_config_applied(&self, task_id: &str) -> Result<(), StoreError>;
}

#[async_trait]
pub trait TaskLog: Send + Sync {
  /// Appends an envelope and returns its sequence number in the log.
  async fn append(&self, envelope: &TaskEnvelope) -> Result<i64, StoreError>;

  /// Envelopes for the cursor's worker written after `cursor.since` with a
  /// sequence above `cursor.after_seq`, in write order.
  async fn read_envelopes(&self, cursor: &EnvelopeCursor) -> Result<Vec<LoggedEnvelope>, StoreError>;

  async fn write_heartbeat(&self, heartbeat: &Heartbeat) -> Result<(), StoreError>;

  async fn heartbeats_since(&self, since: DateTime<Utc>) -> Result<Vec<Heartbeat>, StoreError>;

  async fn save_snapshot(&self, task_id: &str, payload: &str, taken_at: DateTime<Utc>) -> Result<(), StoreError>;

  /// Most recent snapshot payload for `task_id` taken after `since`.
  async fn latest_snapshot(&self, task_id: &str, since: DateTime<Utc>) -> Result<Option<String>, StoreError>;
}
