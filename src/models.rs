use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Worker process number, `1..=worker_count`.
pub type WorkerId = i32;

/// Opaque key-value mapping. Keys are kept sorted so serialization is canonical.
pub type ConfigMap = BTreeMap<String, serde_json::Value>;

/// Serialized strategy-instance state captured at pause.
pub type Snapshot = serde_json::Value;

/// Lifecycle state a task is asked to be in, as stored in the control store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DesiredState {
  PendingStart,
  Running,
  PendingStop,
  Stopped,
  PendingPause,
  Paused,
  PendingResume,
}

impl DesiredState {
  pub fn code(self) -> i16 {
    match self {
      DesiredState::PendingStop => -1,
      DesiredState::Stopped => 0,
      DesiredState::PendingStart => 1,
      DesiredState::Running => 2,
      DesiredState::PendingPause => 3,
      DesiredState::Paused => 4,
      DesiredState::PendingResume => 5,
    }
  }

  pub fn from_code(code: i16) -> Option<Self> {
    match code {
      -1 => Some(DesiredState::PendingStop),
      0 => Some(DesiredState::Stopped),
      1 => Some(DesiredState::PendingStart),
      2 => Some(DesiredState::Running),
      3 => Some(DesiredState::PendingPause),
      4 => Some(DesiredState::Paused),
      5 => Some(DesiredState::PendingResume),
      _ => None,
    }
  }
}

/// Operation carried by a TaskEnvelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationCode {
  Start,
  Stop,
  UpdateConfig,
  CancelOrders,
  Liquidate,
  Restart,
  Pause,
  Resume,
}

impl OperationCode {
  pub fn code(self) -> i16 {
    match self {
      OperationCode::Start => 1,
      OperationCode::Stop => 2,
      OperationCode::UpdateConfig => 3,
      OperationCode::CancelOrders => 4,
      OperationCode::Liquidate => 5,
      OperationCode::Restart => 6,
      OperationCode::Pause => 7,
      OperationCode::Resume => 8,
    }
  }

  pub fn from_code(code: i16) -> Option<Self> {
    match code {
      1 => Some(OperationCode::Start),
      2 => Some(OperationCode::Stop),
      3 => Some(OperationCode::UpdateConfig),
      4 => Some(OperationCode::CancelOrders),
      5 => Some(OperationCode::Liquidate),
      6 => Some(OperationCode::Restart),
      7 => Some(OperationCode::Pause),
      8 => Some(OperationCode::Resume),
      _ => None,
    }
  }
}

impl fmt::Display for OperationCode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      OperationCode::Start => "start",
      OperationCode::Stop => "stop",
      OperationCode::UpdateConfig => "update_config",
      OperationCode::CancelOrders => "cancel_orders",
      OperationCode::Liquidate => "liquidate",
      OperationCode::Restart => "restart",
      OperationCode::Pause => "pause",
      OperationCode::Resume => "resume",
    };
    f.write_str(name)
  }
}

/// One strategy bound to a symbol, an exchange account and a strategy kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
  pub task_id: String,
  pub symbol: String,
  pub exchange: String,
  pub account_ref: String,
  pub strategy_kind: String,
  pub strategy_config: ConfigMap,
  /// Gateway connection parameters, credentials included.
  pub connection: ConfigMap,
  pub desired_state: DesiredState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
  pub worker_id: WorkerId,
  pub timestamp: DateTime<Utc>,
  pub task_ids: Vec<String>,
}

/// A task row as the control store holds it, before catalog resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
  pub task_id: String,
  pub symbol: String,
  pub raw_config: String,
  pub exchange_id: i64,
  pub strategy_kind_id: i64,
  pub account_id: i64,
  pub state: DesiredState,
  pub planned_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
  pub api_key: String,
  pub api_secret: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeProfile {
  pub id: i64,
  pub name: String,
  /// Connection parameter name the api key is passed under.
  pub key_field: String,
  pub secret_field: String,
  pub params: ConfigMap,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyKind {
  pub id: i64,
  pub name: String,
  pub class_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminOperation {
  CancelAll,
  Liquidate,
  Restart,
}

impl AdminOperation {
  pub fn from_code(code: i16) -> Option<Self> {
    match code {
      1 => Some(AdminOperation::CancelAll),
      2 => Some(AdminOperation::Liquidate),
      3 => Some(AdminOperation::Restart),
      _ => None,
    }
  }

  pub fn code(self) -> i16 {
    match self {
      AdminOperation::CancelAll => 1,
      AdminOperation::Liquidate => 2,
      AdminOperation::Restart => 3,
    }
  }
}

/// Unacknowledged operator request against a running task.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlRequest {
  pub id: i64,
  pub task_id: String,
  pub operation: AdminOperation,
  /// Liquidation size in percent of the position.
  pub percent: Option<f64>,
}

impl ControlRequest {
  /// Fraction of the position to liquidate; the whole position when unset.
  pub fn liquidation_rate(&self) -> f64 {
    match self.percent {
      Some(percent) if percent > 0.0 => percent / 100.0,
      _ => 1.0,
    }
  }
}

/// A task whose stored configuration has been edited and not yet pushed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigEdit {
  pub task_id: String,
  pub raw_config: String,
  pub strategy_kind_id: i64,
}
