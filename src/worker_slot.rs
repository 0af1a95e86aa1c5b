//! Scheduler-side model of one worker process.
//!
//! A slot tracks which tasks the scheduler has handed to its worker. Every
//! operation either mutates the registry and returns the instruction to send,
//! or returns a [`Rejection`]. Rejections are ordinary outcomes (the worker is
//! full, or does not hold the task) and carry no side effects.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::envelope::Instruction;
use crate::models::{ConfigMap, Task, WorkerId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
  #[error("worker {worker_id} is at capacity ({capacity})")]
  CapacityFull { worker_id: WorkerId, capacity: usize },

  #[error("worker {worker_id} does not hold task {task_id}")]
  UnknownTask { worker_id: WorkerId, task_id: String },

  #[error("no slot for worker {0}")]
  UnknownWorker(WorkerId),
}

/// Instruction produced by a slot operation, plus what the registry held
/// before, so the mutation can be undone if the instruction never reaches the log.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotAction {
  pub instruction: Instruction,
  prior: Option<Task>,
}

impl SlotAction {
  fn new(instruction: Instruction, prior: Option<Task>) -> Self {
    Self { instruction, prior }
  }
}

#[derive(Debug, Clone)]
pub struct WorkerSlot {
  worker_id: WorkerId,
  capacity: usize,
  assigned: BTreeMap<String, Task>,
}

impl WorkerSlot {
  pub fn new(worker_id: WorkerId, capacity: usize) -> Self {
    Self { worker_id, capacity, assigned: BTreeMap::new() }
  }

  pub fn worker_id(&self) -> WorkerId {
    self.worker_id
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  pub fn load(&self) -> usize {
    self.assigned.len()
  }

  pub fn holds(&self, task_id: &str) -> bool {
    self.assigned.contains_key(task_id)
  }

  pub fn task(&self, task_id: &str) -> Option<&Task> {
    self.assigned.get(task_id)
  }

  pub fn task_ids(&self) -> impl Iterator<Item = &str> {
    self.assigned.keys().map(String::as_str)
  }

  pub fn start(&mut self, task: Task) -> Result<SlotAction, Rejection> {
    let prior = self.admit(&task)?;
    Ok(SlotAction::new(Instruction::Start(task), prior))
  }

  pub fn resume(&mut self, task: Task) -> Result<SlotAction, Rejection> {
    let prior = self.admit(&task)?;
    Ok(SlotAction::new(Instruction::Resume(task), prior))
  }

  pub fn stop(&mut self, task_id: &str) -> Result<SlotAction, Rejection> {
    let removed = self.assigned.remove(task_id).ok_or_else(|| self.unknown(task_id))?;
    Ok(SlotAction::new(Instruction::Stop { task_id: task_id.to_string() }, Some(removed)))
  }

  /// Merges `config` into the stored task's configuration; the instruction carries only the edit.
  pub fn update_config(&mut self, task_id: &str, config: ConfigMap) -> Result<SlotAction, Rejection> {
    let unknown = self.unknown(task_id);
    let task = self.assigned.get_mut(task_id).ok_or(unknown)?;
    let prior = task.clone();
    task.strategy_config.extend(config.clone());
    Ok(SlotAction::new(
      Instruction::UpdateConfig { task_id: task_id.to_string(), config },
      Some(prior),
    ))
  }

  pub fn cancel_orders(&mut self, task_id: &str) -> Result<SlotAction, Rejection> {
    self.require(task_id)?;
    Ok(SlotAction::new(Instruction::CancelOrders { task_id: task_id.to_string() }, None))
  }

  pub fn liquidate(&mut self, task_id: &str, rate: f64) -> Result<SlotAction, Rejection> {
    self.require(task_id)?;
    Ok(SlotAction::new(Instruction::Liquidate { task_id: task_id.to_string(), rate }, None))
  }

  pub fn restart(&mut self, task_id: &str) -> Result<SlotAction, Rejection> {
    self.require(task_id)?;
    Ok(SlotAction::new(Instruction::Restart { task_id: task_id.to_string() }, None))
  }

  /// Pausing frees the slot immediately.
  pub fn pause(&mut self, task_id: &str) -> Result<SlotAction, Rejection> {
    let removed = self.assigned.remove(task_id).ok_or_else(|| self.unknown(task_id))?;
    Ok(SlotAction::new(Instruction::Pause { task_id: task_id.to_string() }, Some(removed)))
  }

  /// Records a task the worker already runs without producing an instruction.
  pub fn adopt(&mut self, task: Task) -> Result<(), Rejection> {
    self.admit(&task).map(|_| ())
  }

  /// Undoes the registry change made by `action`.
  pub fn revert(&mut self, action: &SlotAction) {
    let task_id = action.instruction.task_id();
    match (&action.instruction, &action.prior) {
      (Instruction::Start(_) | Instruction::Resume(_), None) => {
        self.assigned.remove(task_id);
      }
      (_, Some(prior)) => {
        self.assigned.insert(task_id.to_string(), prior.clone());
      }
      (_, None) => {}
    }
  }

  /// A full slot rejects every start, a re-sent task included. Below capacity a
  /// re-sent task replaces the held copy without taking a second place.
  fn admit(&mut self, task: &Task) -> Result<Option<Task>, Rejection> {
    if self.assigned.len() >= self.capacity {
      return Err(Rejection::CapacityFull { worker_id: self.worker_id, capacity: self.capacity });
    }
    Ok(self.assigned.insert(task.task_id.clone(), task.clone()))
  }

  fn require(&self, task_id: &str) -> Result<(), Rejection> {
    if self.assigned.contains_key(task_id) {
      Ok(())
    } else {
      Err(self.unknown(task_id))
    }
  }

  fn unknown(&self, task_id: &str) -> Rejection {
    Rejection::UnknownTask { worker_id: self.worker_id, task_id: task_id.to_string() }
  }
}
