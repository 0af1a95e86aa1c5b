use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{ControlStore, StoreError, TaskLog};
use crate::envelope::{EnvelopeCursor, LoggedEnvelope, TaskEnvelope};
use crate::models::{
  ConfigEdit, ControlRequest, Credentials, DesiredState, ExchangeProfile, Heartbeat, StrategyKind, TaskRecord,
};

#[derive(Debug, Clone)]
struct TaskRow {
  record: TaskRecord,
  config_applied: bool,
}

#[derive(Debug, Clone)]
struct ControlRow {
  request: ControlRequest,
  acknowledged: bool,
}

#[derive(Debug, Default)]
struct ControlTables {
  exchanges: Vec<ExchangeProfile>,
  strategy_kinds: Vec<StrategyKind>,
  accounts: BTreeMap<i64, Credentials>,
  tasks: BTreeMap<String, TaskRow>,
  controls: BTreeMap<i64, ControlRow>,
}

fn numeric_id(task_id: &str) -> i64 {
  task_id.parse().unwrap_or(i64::MIN)
}

/// Control store held in process memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryControlStore {
  tables: Arc<Mutex<ControlTables>>,
}

impl MemoryControlStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub async fn insert_exchange(&self, exchange: ExchangeProfile) {
    self.tables.lock().await.exchanges.push(exchange);
  }

  pub async fn insert_strategy_kind(&self, kind: StrategyKind) {
    self.tables.lock().await.strategy_kinds.push(kind);
  }

  pub async fn insert_account(&self, account_id: i64, credentials: Credentials) {
    self.tables.lock().await.accounts.insert(account_id, credentials);
  }

  pub async fn insert_task(&self, record: TaskRecord) {
    let row = TaskRow { record, config_applied: true };
    self.tables.lock().await.tasks.insert(row.record.task_id.clone(), row);
  }

  /// Replaces a task's stored configuration and flags it as not yet applied.
  pub async fn edit_config(&self, task_id: &str, raw_config: &str) {
    if let Some(row) = self.tables.lock().await.tasks.get_mut(task_id) {
      row.record.raw_config = raw_config.to_string();
      row.config_applied = false;
    }
  }

  pub async fn push_control(&self, request: ControlRequest) {
    let row = ControlRow { request, acknowledged: false };
    self.tables.lock().await.controls.insert(row.request.id, row);
  }

  pub async fn is_acknowledged(&self, control_id: i64) -> bool {
    self.tables.lock().await.controls.get(&control_id).is_some_and(|row| row.acknowledged)
  }

  pub async fn is_config_applied(&self, task_id: &str) -> bool {
    self.tables.lock().await.tasks.get(task_id).is_some_and(|row| row.config_applied)
  }
}

#[async_trait]
impl ControlStore for MemoryControlStore {
  async fn exchanges(&self) -> Result<Vec<ExchangeProfile>, StoreError> {
    Ok(self.tables.lock().await.exchanges.clone())
  }

  async fn strategy_kinds(&self) -> Result<Vec<StrategyKind>, StoreError> {
    Ok(self.tables.lock().await.strategy_kinds.clone())
  }

  async fn tasks_in_state(
    &self,
    state: DesiredState,
    planned_since: Option<DateTime<Utc>>,
    min_task_id: i64,
  ) -> Result<Vec<TaskRecord>, StoreError> {
    let now = Utc::now();
    let tables = self.tables.lock().await;
    let mut records: Vec<TaskRecord> = tables
      .tasks
      .values()
      .map(|row| &row.record)
      .filter(|record| record.state == state && numeric_id(&record.task_id) > min_task_id)
      .filter(|record| planned_since.is_none_or(|since| record.planned_at >= since && record.planned_at <= now))
      .cloned()
      .collect();
    records.sort_by_key(|record| numeric_id(&record.task_id));
    Ok(records)
  }

  async fn task(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError> {
    Ok(self.tables.lock().await.tasks.get(task_id).map(|row| row.record.clone()))
  }

  async fn desired_state(&self, task_id: &str) -> Result<Option<DesiredState>, StoreError> {
    Ok(self.tables.lock().await.tasks.get(task_id).map(|row| row.record.state))
  }

  async fn set_desired_state(&self, task_id: &str, state: DesiredState) -> Result<(), StoreError> {
    if let Some(row) = self.tables.lock().await.tasks.get_mut(task_id) {
      row.record.state = state;
    }
    Ok(())
  }

  async fn credentials(&self, account_id: i64) -> Result<Option<Credentials>, StoreError> {
    Ok(self.tables.lock().await.accounts.get(&account_id).cloned())
  }

  async fn pending_controls(&self) -> Result<Vec<ControlRequest>, StoreError> {
    let tables = self.tables.lock().await;
    Ok(tables.controls.values().filter(|row| !row.acknowledged).map(|row| row.request.clone()).collect())
  }

  async fn acknowledge_control(&self, control_id: i64) -> Result<(), StoreError> {
    if let Some(row) = self.tables.lock().await.controls.get_mut(&control_id) {
      row.acknowledged = true;
    }
    Ok(())
  }

  async fn pending_config_edits(&self) -> Result<Vec<ConfigEdit>, StoreError> {
    let tables = self.tables.lock().await;
    Ok(
      tables
        .tasks
        .values()
        .filter(|row| !row.config_applied)
        .map(|row| ConfigEdit {
          task_id: row.record.task_id.clone(),
          raw_config: row.record.raw_config.clone(),
          strategy_kind_id: row.record.strategy_kind_id,
        })
        .collect(),
    )
  }

  async fn mark_config_applied(&self, task_id: &str) -> Result<(), StoreError> {
    if let Some(row) = self.tables.lock().await.tasks.get_mut(task_id) {
      row.config_applied = true;
    }
    Ok(())
  }
}

#[derive(Debug, Default)]
struct LogTables {
  envelopes: Vec<LoggedEnvelope>,
  heartbeats: Vec<Heartbeat>,
  snapshots: Vec<(String, String, DateTime<Utc>)>,
}

/// Durable log held in process memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryTaskLog {
  tables: Arc<Mutex<LogTables>>,
  unavailable: Arc<AtomicBool>,
}

impl MemoryTaskLog {
  pub fn new() -> Self {
    Self::default()
  }

  /// While set, every write fails as if the database connection were lost.
  pub fn set_unavailable(&self, unavailable: bool) {
    self.unavailable.store(unavailable, Ordering::SeqCst);
  }

  pub async fn envelopes(&self) -> Vec<TaskEnvelope> {
    self.tables.lock().await.envelopes.iter().map(|logged| logged.envelope.clone()).collect()
  }

  fn check_available(&self) -> Result<(), StoreError> {
    if self.unavailable.load(Ordering::SeqCst) {
      Err(StoreError::Database(sqlx::Error::PoolClosed))
    } else {
      Ok(())
    }
  }
}

#[async_trait]
impl TaskLog for MemoryTaskLog {
  async fn append(&self, envelope: &TaskEnvelope) -> Result<i64, StoreError> {
    self.check_available()?;
    let mut tables = self.tables.lock().await;
    let seq = tables.envelopes.len() as i64 + 1;
    tables.envelopes.push(LoggedEnvelope { seq, envelope: envelope.clone() });
    Ok(seq)
  }

  async fn read_envelopes(&self, cursor: &EnvelopeCursor) -> Result<Vec<LoggedEnvelope>, StoreError> {
    let tables = self.tables.lock().await;
    Ok(
      tables
        .envelopes
        .iter()
        .filter(|logged| {
          logged.envelope.worker_id == cursor.worker_id
            && logged.envelope.timestamp > cursor.since
            && logged.seq > cursor.after_seq
        })
        .cloned()
        .collect(),
    )
  }

  async fn write_heartbeat(&self, heartbeat: &Heartbeat) -> Result<(), StoreError> {
    self.check_available()?;
    self.tables.lock().await.heartbeats.push(heartbeat.clone());
    Ok(())
  }

  async fn heartbeats_since(&self, since: DateTime<Utc>) -> Result<Vec<Heartbeat>, StoreError> {
    let tables = self.tables.lock().await;
    Ok(tables.heartbeats.iter().filter(|heartbeat| heartbeat.timestamp >= since).cloned().collect())
  }

  async fn save_snapshot(&self, task_id: &str, payload: &str, taken_at: DateTime<Utc>) -> Result<(), StoreError> {
    self.check_available()?;
    self.tables.lock().await.snapshots.push((task_id.to_string(), payload.to_string(), taken_at));
    Ok(())
  }

  async fn latest_snapshot(&self, task_id: &str, since: DateTime<Utc>) -> Result<Option<String>, StoreError> {
    let tables = self.tables.lock().await;
    Ok(
      tables
        .snapshots
        .iter()
        .filter(|(id, _, taken_at)| id == task_id && *taken_at > since)
        .max_by_key(|(_, _, taken_at)| *taken_at)
        .map(|(_, payload, _)| payload.clone()),
    )
  }
}
