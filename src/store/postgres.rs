use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use tracing::warn;

use super::{ControlStore, StoreError, TaskLog};
use crate::envelope::{EnvelopeCursor, LoggedEnvelope, TaskEnvelope};
use crate::models::{
  AdminOperation, ConfigEdit, ConfigMap, ControlRequest, Credentials, DesiredState, ExchangeProfile, Heartbeat,
  StrategyKind, TaskRecord,
};

const TASK_COLUMNS: &str =
  "id::text AS task_id, symbol, strategy_config, exchange_id, strategy_kind_id, account_id, status, planned_at";

#[derive(FromRow)]
struct TaskRow {
  task_id: String,
  symbol: String,
  strategy_config: String,
  exchange_id: i64,
  strategy_kind_id: i64,
  account_id: i64,
  status: i16,
  planned_at: DateTime<Utc>,
}

impl TryFrom<TaskRow> for TaskRecord {
  type Error = StoreError;

  fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
    let state = desired_state(row.status, &row.task_id)?;
    Ok(TaskRecord {
      task_id: row.task_id,
      symbol: row.symbol,
      raw_config: row.strategy_config,
      exchange_id: row.exchange_id,
      strategy_kind_id: row.strategy_kind_id,
      account_id: row.account_id,
      state,
      planned_at: row.planned_at,
    })
  }
}

#[derive(FromRow)]
struct ExchangeRow {
  id: i64,
  name: String,
  key_field: String,
  secret_field: String,
  connection_params: serde_json::Value,
}

#[derive(FromRow)]
struct ControlRow {
  id: i64,
  task_id: String,
  operation: i16,
  liquidate_percent: Option<f64>,
}

#[derive(FromRow)]
struct EnvelopeRow {
  id: i64,
  worker_id: i32,
  task_id: String,
  operation: i16,
  payload: String,
  created_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct HeartbeatRow {
  worker_id: i32,
  task_ids: Vec<String>,
  created_at: DateTime<Utc>,
}

fn desired_state(code: i16, task_id: &str) -> Result<DesiredState, StoreError> {
  DesiredState::from_code(code).ok_or_else(|| StoreError::Corrupt {
    field: "status",
    value: code.to_string(),
    row: task_id.to_string(),
  })
}

fn config_map(value: serde_json::Value) -> ConfigMap {
  match value {
    serde_json::Value::Object(map) => map.into_iter().collect(),
    _ => ConfigMap::new(),
  }
}

#[derive(Debug, Clone)]
pub struct PgControlStore {
  pool: PgPool,
}

impl PgControlStore {
  pub fn new(pool: PgPool) -> Self {
    Self { pool }
  }
}

#[async_trait]
impl ControlStore for PgControlStore {
  async fn exchanges(&self) -> Result<Vec<ExchangeProfile>, StoreError> {
    let rows = sqlx::query_as::<_, ExchangeRow>(
      "SELECT id, name, key_field, secret_field, connection_params FROM exchanges ORDER BY id",
    )
    .fetch_all(&self.pool)
    .await?;
    Ok(
      rows
        .into_iter()
        .map(|row| ExchangeProfile {
          id: row.id,
          name: row.name,
          key_field: row.key_field,
          secret_field: row.secret_field,
          params: config_map(row.connection_params),
        })
        .collect(),
    )
  }

  async fn strategy_kinds(&self) -> Result<Vec<StrategyKind>, StoreError> {
    let rows: Vec<(i64, String, String)> =
      sqlx::query_as("SELECT id, name, class_name FROM strategy_kinds ORDER BY id").fetch_all(&self.pool).await?;
    Ok(rows.into_iter().map(|(id, name, class_name)| StrategyKind { id, name, class_name }).collect())
  }

  async fn tasks_in_state(
    &self,
    state: DesiredState,
    planned_since: Option<DateTime<Utc>>,
    min_task_id: i64,
  ) -> Result<Vec<TaskRecord>, StoreError> {
    let sql = format!(
      "SELECT {TASK_COLUMNS} FROM strategy_tasks \
       WHERE status = $1 AND id > $2 AND ($3::timestamptz IS NULL OR planned_at BETWEEN $3 AND NOW()) \
       ORDER BY id"
    );
    let rows = sqlx::query_as::<_, TaskRow>(&sql)
      .bind(state.code())
      .bind(min_task_id)
      .bind(planned_since)
      .fetch_all(&self.pool)
      .await?;
    rows.into_iter().map(TaskRecord::try_from).collect()
  }

  async fn task(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM strategy_tasks WHERE id::text = $1");
    let row = sqlx::query_as::<_, TaskRow>(&sql).bind(task_id).fetch_optional(&self.pool).await?;
    row.map(TaskRecord::try_from).transpose()
  }

  async fn desired_state(&self, task_id: &str) -> Result<Option<DesiredState>, StoreError> {
    let status: Option<i16> = sqlx::query_scalar("SELECT status FROM strategy_tasks WHERE id::text = $1")
      .bind(task_id)
      .fetch_optional(&self.pool)
      .await?;
    status.map(|code| desired_state(code, task_id)).transpose()
  }

  async fn set_desired_state(&self, task_id: &str, state: DesiredState) -> Result<(), StoreError> {
    sqlx::query("UPDATE strategy_tasks SET status = $1, updated_at = NOW() WHERE id::text = $2")
      .bind(state.code())
      .bind(task_id)
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  async fn credentials(&self, account_id: i64) -> Result<Option<Credentials>, StoreError> {
    let row: Option<(String, String)> = sqlx::query_as("SELECT api_key, api_secret FROM accounts WHERE id = $1")
      .bind(account_id)
      .fetch_optional(&self.pool)
      .await?;
    Ok(row.map(|(api_key, api_secret)| Credentials { api_key, api_secret }))
  }

  async fn pending_controls(&self) -> Result<Vec<ControlRequest>, StoreError> {
    let rows = sqlx::query_as::<_, ControlRow>(
      "SELECT id, task_id::text AS task_id, operation, liquidate_percent \
       FROM task_controls WHERE NOT acknowledged ORDER BY id",
    )
    .fetch_all(&self.pool)
    .await?;
    let mut requests = Vec::with_capacity(rows.len());
    for row in rows {
      match AdminOperation::from_code(row.operation) {
        Some(operation) => requests.push(ControlRequest {
          id: row.id,
          task_id: row.task_id,
          operation,
          percent: row.liquidate_percent,
        }),
        None => warn!(control_id = row.id, operation = row.operation, "Ignoring control with unknown operation"),
      }
    }
    Ok(requests)
  }

  async fn acknowledge_control(&self, control_id: i64) -> Result<(), StoreError> {
    sqlx::query("UPDATE task_controls SET acknowledged = TRUE, acknowledged_at = NOW() WHERE id = $1")
      .bind(control_id)
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  async fn pending_config_edits(&self) -> Result<Vec<ConfigEdit>, StoreError> {
    let rows: Vec<(String, String, i64)> = sqlx::query_as(
      "SELECT id::text, strategy_config, strategy_kind_id FROM strategy_tasks WHERE NOT config_applied ORDER BY id",
    )
    .fetch_all(&self.pool)
    .await?;
    Ok(
      rows
        .into_iter()
        .map(|(task_id, raw_config, strategy_kind_id)| ConfigEdit { task_id, raw_config, strategy_kind_id })
        .collect(),
    )
  }

  async fn mark_config_applied(&self, task_id: &str) -> Result<(), StoreError> {
    sqlx::query("UPDATE strategy_tasks SET config_applied = TRUE, updated_at = NOW() WHERE id::text = $1")
      .bind(task_id)
      .execute(&self.pool)
      .await?;
    Ok(())
  }
}

#[derive(Debug, Clone)]
pub struct PgTaskLog {
  pool: PgPool,
}

impl PgTaskLog {
  pub fn new(pool: PgPool) -> Self {
    Self { pool }
  }
}

#[async_trait]
impl TaskLog for PgTaskLog {
  async fn append(&self, envelope: &TaskEnvelope) -> Result<i64, StoreError> {
    let seq: i64 = sqlx::query_scalar(
      "INSERT INTO task_envelopes (worker_id, task_id, operation, payload, created_at) \
       VALUES ($1, $2, $3, $4, $5) RETURNING id",
    )
    .bind(envelope.worker_id)
    .bind(&envelope.task_id)
    .bind(envelope.operation_code)
    .bind(&envelope.payload)
    .bind(envelope.timestamp)
    .fetch_one(&self.pool)
    .await?;
    Ok(seq)
  }

  async fn read_envelopes(&self, cursor: &EnvelopeCursor) -> Result<Vec<LoggedEnvelope>, StoreError> {
    let rows = sqlx::query_as::<_, EnvelopeRow>(
      "SELECT id, worker_id, task_id, operation, payload, created_at FROM task_envelopes \
       WHERE worker_id = $1 AND created_at > $2 AND id > $3 ORDER BY id",
    )
    .bind(cursor.worker_id)
    .bind(cursor.since)
    .bind(cursor.after_seq)
    .fetch_all(&self.pool)
    .await?;
    Ok(
      rows
        .into_iter()
        .map(|row| LoggedEnvelope {
          seq: row.id,
          envelope: TaskEnvelope {
            worker_id: row.worker_id,
            task_id: row.task_id,
            operation_code: row.operation,
            payload: row.payload,
            timestamp: row.created_at,
          },
        })
        .collect(),
    )
  }

  async fn write_heartbeat(&self, heartbeat: &Heartbeat) -> Result<(), StoreError> {
    sqlx::query("INSERT INTO heartbeats (worker_id, task_ids, created_at) VALUES ($1, $2, $3)")
      .bind(heartbeat.worker_id)
      .bind(&heartbeat.task_ids)
      .bind(heartbeat.timestamp)
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  async fn heartbeats_since(&self, since: DateTime<Utc>) -> Result<Vec<Heartbeat>, StoreError> {
    let rows = sqlx::query_as::<_, HeartbeatRow>(
      "SELECT DISTINCT ON (worker_id) worker_id, task_ids, created_at FROM heartbeats \
       WHERE created_at >= $1 ORDER BY worker_id, created_at DESC",
    )
    .bind(since)
    .fetch_all(&self.pool)
    .await?;
    Ok(
      rows
        .into_iter()
        .map(|row| Heartbeat { worker_id: row.worker_id, timestamp: row.created_at, task_ids: row.task_ids })
        .collect(),
    )
  }

  async fn save_snapshot(&self, task_id: &str, payload: &str, taken_at: DateTime<Utc>) -> Result<(), StoreError> {
    sqlx::query("INSERT INTO strategy_snapshots (task_id, payload, created_at) VALUES ($1, $2, $3)")
      .bind(task_id)
      .bind(payload)
      .bind(taken_at)
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  async fn latest_snapshot(&self, task_id: &str, since: DateTime<Utc>) -> Result<Option<String>, StoreError> {
    let payload: Option<String> = sqlx::query_scalar(
      "SELECT payload FROM strategy_snapshots WHERE task_id = $1 AND created_at > $2 \
       ORDER BY created_at DESC LIMIT 1",
    )
    .bind(task_id)
    .bind(since)
    .fetch_optional(&self.pool)
    .await?;
    Ok(payload)
  }
}
