use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::codec::{self, CodecError};
use crate::models::{ConfigMap, OperationCode, Task, WorkerId};

/// A lifecycle or trading instruction for one task, tagged by operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
  Start(Task),
  Stop { task_id: String },
  UpdateConfig { task_id: String, config: ConfigMap },
  CancelOrders { task_id: String },
  Liquidate { task_id: String, rate: f64 },
  Restart { task_id: String },
  Pause { task_id: String },
  Resume(Task),
}

#[derive(Serialize, Deserialize)]
struct TaskRef {
  task_id: String,
}

#[derive(Serialize, Deserialize)]
struct ConfigPatch {
  task_id: String,
  config: ConfigMap,
}

#[derive(Serialize, Deserialize)]
struct LiquidationOrder {
  task_id: String,
  rate: f64,
}

impl Instruction {
  pub fn operation(&self) -> OperationCode {
    match self {
      Instruction::Start(_) => OperationCode::Start,
      Instruction::Stop { .. } => OperationCode::Stop,
      Instruction::UpdateConfig { .. } => OperationCode::UpdateConfig,
      Instruction::CancelOrders { .. } => OperationCode::CancelOrders,
      Instruction::Liquidate { .. } => OperationCode::Liquidate,
      Instruction::Restart { .. } => OperationCode::Restart,
      Instruction::Pause { .. } => OperationCode::Pause,
      Instruction::Resume(_) => OperationCode::Resume,
    }
  }

  pub fn task_id(&self) -> &str {
    match self {
      Instruction::Start(task) | Instruction::Resume(task) => &task.task_id,
      Instruction::Stop { task_id }
      | Instruction::UpdateConfig { task_id, .. }
      | Instruction::CancelOrders { task_id }
      | Instruction::Liquidate { task_id, .. }
      | Instruction::Restart { task_id }
      | Instruction::Pause { task_id } => task_id,
    }
  }

  fn encode_payload(&self) -> Result<String, CodecError> {
    match self {
      Instruction::Start(task) | Instruction::Resume(task) => codec::encode(task),
      Instruction::UpdateConfig { task_id, config } => codec::encode(&ConfigPatch {
        task_id: task_id.clone(),
        config: config.clone(),
      }),
      Instruction::Liquidate { task_id, rate } => codec::encode(&LiquidationOrder {
        task_id: task_id.clone(),
        rate: *rate,
      }),
      Instruction::Stop { task_id }
      | Instruction::CancelOrders { task_id }
      | Instruction::Restart { task_id }
      | Instruction::Pause { task_id } => codec::encode(&TaskRef { task_id: task_id.clone() }),
    }
  }

  /// Rebuilds an instruction from its stored operation code and payload text.
  pub fn decode(operation_code: i16, payload: &str) -> Result<Self, CodecError> {
    let operation = OperationCode::from_code(operation_code)
      .ok_or(CodecError::UnknownOperation(operation_code))?;
    let instruction = match operation {
      OperationCode::Start => Instruction::Start(codec::decode(payload)?),
      OperationCode::Resume => Instruction::Resume(codec::decode(payload)?),
      OperationCode::UpdateConfig => {
        let patch: ConfigPatch = codec::decode(payload)?;
        Instruction::UpdateConfig { task_id: patch.task_id, config: patch.config }
      }
      OperationCode::Liquidate => {
        let order: LiquidationOrder = codec::decode(payload)?;
        Instruction::Liquidate { task_id: order.task_id, rate: order.rate }
      }
      OperationCode::Stop => Instruction::Stop { task_id: codec::decode::<TaskRef>(payload)?.task_id },
      OperationCode::CancelOrders => {
        Instruction::CancelOrders { task_id: codec::decode::<TaskRef>(payload)?.task_id }
      }
      OperationCode::Restart => Instruction::Restart { task_id: codec::decode::<TaskRef>(payload)?.task_id },
      OperationCode::Pause => Instruction::Pause { task_id: codec::decode::<TaskRef>(payload)?.task_id },
    };
    Ok(instruction)
  }
}

/// Durable instruction addressed to exactly one worker.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskEnvelope {
  pub worker_id: WorkerId,
  pub task_id: String,
  pub operation_code: i16,
  pub payload: String,
  pub timestamp: DateTime<Utc>,
}

impl TaskEnvelope {
  pub fn seal(worker_id: WorkerId, instruction: &Instruction, timestamp: DateTime<Utc>) -> Result<Self, CodecError> {
    Ok(Self {
      worker_id,
      task_id: instruction.task_id().to_string(),
      operation_code: instruction.operation().code(),
      payload: instruction.encode_payload()?,
      timestamp,
    })
  }

  pub fn open(&self) -> Result<Instruction, CodecError> {
    Instruction::decode(self.operation_code, &self.payload)
  }
}

/// An envelope as read back from the log, with its position in the worker's stream.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedEnvelope {
  pub seq: i64,
  pub envelope: TaskEnvelope,
}

/// Read position in one worker's envelope stream.
///
/// Only envelopes written after `since` are visible; `after_seq` advances as
/// envelopes are consumed so each is handed out once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeCursor {
  pub worker_id: WorkerId,
  pub since: DateTime<Utc>,
  pub after_seq: i64,
}

impl EnvelopeCursor {
  pub fn new(worker_id: WorkerId, since: DateTime<Utc>) -> Self {
    Self { worker_id, since, after_seq: 0 }
  }

  pub fn advance(&mut self, seq: i64) {
    if seq > self.after_seq {
      self.after_seq = seq;
    }
  }
}
