//! Chooses which worker receives which instruction.
//!
//! New and resuming tasks go to the lowest-numbered live worker with room;
//! every other operation goes to whichever slot holds the task, live or not,
//! because the envelope waits in the log until that worker reads again.
//! The Dispatcher performs no I/O: callers persist and log the returned
//! [`Dispatch`] and call [`Dispatcher::rollback`] if persisting fails.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::codec::CodecError;
use crate::envelope::{Instruction, TaskEnvelope};
use crate::liveness::LivenessView;
use crate::models::{ConfigMap, Task, WorkerId};
use crate::worker_slot::{Rejection, SlotAction, WorkerSlot};

/// An accepted slot operation, ready to be sealed into a TaskEnvelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
  pub worker_id: WorkerId,
  pub action: SlotAction,
}

impl Dispatch {
  pub fn instruction(&self) -> &Instruction {
    &self.action.instruction
  }

  pub fn seal(&self, timestamp: DateTime<Utc>) -> Result<TaskEnvelope, CodecError> {
    TaskEnvelope::seal(self.worker_id, &self.action.instruction, timestamp)
  }
}

/// Operations routed to the slot that already holds a task.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
  Stop,
  UpdateConfig(ConfigMap),
  CancelOrders,
  Liquidate { rate: f64 },
  Restart,
  Pause,
}

pub struct Dispatcher {
  slots: BTreeMap<WorkerId, WorkerSlot>,
  reserve_margin: usize,
}

impl Dispatcher {
  pub fn new(worker_count: u32, capacity: usize, reserve_margin: usize) -> Self {
    let slots = (1..=worker_count as WorkerId)
      .map(|worker_id| (worker_id, WorkerSlot::new(worker_id, capacity)))
      .collect();
    Self { slots, reserve_margin }
  }

  pub fn slots(&self) -> impl Iterator<Item = &WorkerSlot> {
    self.slots.values()
  }

  pub fn holder(&self, task_id: &str) -> Option<WorkerId> {
    self.slots.values().find(|slot| slot.holds(task_id)).map(WorkerSlot::worker_id)
  }

  pub fn assign_start(&mut self, task: Task, liveness: &LivenessView) -> Option<Dispatch> {
    self.assign(task, liveness, WorkerSlot::start)
  }

  pub fn assign_resume(&mut self, task: Task, liveness: &LivenessView) -> Option<Dispatch> {
    self.assign(task, liveness, WorkerSlot::resume)
  }

  pub fn route_existing(&mut self, task_id: &str, route: Route) -> Option<Dispatch> {
    let worker_id = self.holder(task_id)?;
    let slot = self.slots.get_mut(&worker_id)?;
    let result = match route {
      Route::Stop => slot.stop(task_id),
      Route::UpdateConfig(config) => slot.update_config(task_id, config),
      Route::CancelOrders => slot.cancel_orders(task_id),
      Route::Liquidate { rate } => slot.liquidate(task_id, rate),
      Route::Restart => slot.restart(task_id),
      Route::Pause => slot.pause(task_id),
    };
    accepted(worker_id, result)
  }

  /// Records a task a worker reported running, without dispatching anything.
  pub fn adopt(&mut self, worker_id: WorkerId, task: Task) -> Result<(), Rejection> {
    if let Some(holder) = self.holder(&task.task_id) {
      if holder != worker_id {
        debug!(task_id = %task.task_id, holder, worker_id, "task already held by another worker");
      }
      return Ok(());
    }
    match self.slots.get_mut(&worker_id) {
      Some(slot) => slot.adopt(task),
      None => Err(Rejection::UnknownWorker(worker_id)),
    }
  }

  pub fn rollback(&mut self, dispatch: &Dispatch) {
    if let Some(slot) = self.slots.get_mut(&dispatch.worker_id) {
      slot.revert(&dispatch.action);
    }
  }

  fn assign(
    &mut self,
    task: Task,
    liveness: &LivenessView,
    admit: fn(&mut WorkerSlot, Task) -> Result<SlotAction, Rejection>,
  ) -> Option<Dispatch> {
    // A task never lives in two slots: a re-sent task goes back to its holder.
    if let Some(worker_id) = self.holder(&task.task_id) {
      let slot = self.slots.get_mut(&worker_id)?;
      return accepted(worker_id, admit(slot, task));
    }

    let reserve_margin = self.reserve_margin;
    for slot in self.slots.values_mut() {
      let worker_id = slot.worker_id();
      let Some(reported) = liveness.load(worker_id) else {
        continue;
      };
      if reported + reserve_margin >= slot.capacity() {
        continue;
      }
      match admit(slot, task.clone()) {
        Ok(action) => return Some(Dispatch { worker_id, action }),
        Err(rejection) => debug!(task_id = %task.task_id, %rejection, "slot declined task"),
      }
    }
    None
  }
}

fn accepted(worker_id: WorkerId, result: Result<SlotAction, Rejection>) -> Option<Dispatch> {
  match result {
    Ok(action) => Some(Dispatch { worker_id, action }),
    Err(rejection) => {
      debug!(%rejection, "slot declined operation");
      None
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::models::{DesiredState, Heartbeat, OperationCode};
  use chrono::Duration;
  use proptest::prelude::*;

  fn task(id: &str) -> Task {
    Task {
      task_id: id.into(),
      symbol: "BTCUSDT".into(),
      exchange: "binance".into(),
      account_ref: "1".into(),
      strategy_kind: "GridStrategy".into(),
      strategy_config: ConfigMap::new(),
      connection: ConfigMap::new(),
      desired_state: DesiredState::PendingStart,
    }
  }

  fn live(workers: &[(WorkerId, i64, usize)]) -> LivenessView {
    let now = Utc::now();
    let beats = workers
      .iter()
      .map(|&(worker_id, age, load)| Heartbeat {
        worker_id,
        timestamp: now - Duration::seconds(age),
        task_ids: (0..load).map(|n| format!("other-{worker_id}-{n}")).collect(),
      })
      .collect();
    LivenessView::from_heartbeats(beats, now, Duration::seconds(30))
  }

  #[test]
  fn lowest_live_worker_wins() {
    let mut dispatcher = Dispatcher::new(3, 2, 0);
    let view = live(&[(1, 1, 0), (2, 1, 0), (3, 1, 0)]);
    let first = dispatcher.assign_start(task("a"), &view).unwrap();
    let second = dispatcher.assign_start(task("b"), &view).unwrap();
    assert_eq!((first.worker_id, second.worker_id), (1, 1));
    assert_eq!(first.instruction().operation(), OperationCode::Start);
  }

  #[test]
  fn fills_workers_in_order_then_gives_up() {
    let mut dispatcher = Dispatcher::new(2, 1, 0);
    let view = live(&[(1, 1, 0), (2, 1, 0)]);
    assert_eq!(dispatcher.assign_start(task("t1"), &view).map(|d| d.worker_id), Some(1));
    assert_eq!(dispatcher.assign_start(task("t2"), &view).map(|d| d.worker_id), Some(2));
    assert!(dispatcher.assign_start(task("t3"), &view).is_none());
  }

  #[test]
  fn skips_stale_and_silent_workers() {
    let mut dispatcher = Dispatcher::new(3, 5, 0);
    let view = live(&[(1, 31, 0), (3, 2, 0)]);
    let dispatch = dispatcher.assign_resume(task("a"), &view).unwrap();
    assert_eq!(dispatch.worker_id, 3);
    assert_eq!(dispatch.instruction().operation(), OperationCode::Resume);
  }

  #[test]
  fn reported_load_and_reserve_margin_limit_eligibility() {
    let mut dispatcher = Dispatcher::new(2, 4, 1);
    // Worker 1 reports 3 of 4 in use; with one slot held in reserve it is full.
    let view = live(&[(1, 1, 3), (2, 1, 2)]);
    assert_eq!(dispatcher.assign_start(task("a"), &view).map(|d| d.worker_id), Some(2));
  }

  #[test]
  fn existing_tasks_are_routed_even_to_stale_workers() {
    let mut dispatcher = Dispatcher::new(2, 2, 0);
    let view = live(&[(1, 1, 0)]);
    dispatcher.assign_start(task("a"), &view).unwrap();

    let stop = dispatcher.route_existing("a", Route::Stop).unwrap();
    assert_eq!(stop.worker_id, 1);
    assert_eq!(dispatcher.holder("a"), None);
    assert!(dispatcher.route_existing("a", Route::Stop).is_none());
  }

  #[test]
  fn rollback_undoes_an_unpersisted_dispatch() {
    let mut dispatcher = Dispatcher::new(1, 1, 0);
    let view = live(&[(1, 1, 0)]);
    let dispatch = dispatcher.assign_start(task("a"), &view).unwrap();
    dispatcher.rollback(&dispatch);
    assert_eq!(dispatcher.holder("a"), None);
  }

  #[test]
  fn re_sent_task_stays_with_its_holder() {
    let mut dispatcher = Dispatcher::new(2, 2, 0);
    dispatcher.assign_start(task("a"), &live(&[(1, 1, 0), (2, 1, 0)])).unwrap();
    let again = dispatcher.assign_start(task("a"), &live(&[(2, 1, 0)])).unwrap();
    assert_eq!(again.worker_id, 1);
    assert_eq!(dispatcher.slots().map(WorkerSlot::load).sum::<usize>(), 1);
  }

  #[test]
  fn adopt_respects_existing_holder() {
    let mut dispatcher = Dispatcher::new(2, 2, 0);
    dispatcher.adopt(2, task("a")).unwrap();
    dispatcher.adopt(1, task("a")).unwrap();
    assert_eq!(dispatcher.holder("a"), Some(2));
  }

  #[derive(Debug, Clone)]
  enum Op {
    Start(u8),
    Resume(u8),
    Stop(u8),
    Pause(u8),
  }

  fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
      (0u8..8).prop_map(Op::Start),
      (0u8..8).prop_map(Op::Resume),
      (0u8..8).prop_map(Op::Stop),
      (0u8..8).prop_map(Op::Pause),
    ]
  }

  proptest! {
    #[test]
    fn single_assignment_and_capacity_hold(ops in prop::collection::vec(op(), 0..64)) {
      let mut dispatcher = Dispatcher::new(3, 2, 0);
      let view = live(&[(1, 1, 0), (2, 1, 0), (3, 1, 0)]);
      for op in ops {
        match op {
          Op::Start(n) => { dispatcher.assign_start(task(&n.to_string()), &view); }
          Op::Resume(n) => { dispatcher.assign_resume(task(&n.to_string()), &view); }
          Op::Stop(n) => { dispatcher.route_existing(&n.to_string(), Route::Stop); }
          Op::Pause(n) => { dispatcher.route_existing(&n.to_string(), Route::Pause); }
        }
        for n in 0u8..8 {
          let id = n.to_string();
          let holders = dispatcher.slots().filter(|slot| slot.holds(&id)).count();
          prop_assert!(holders <= 1);
        }
        for slot in dispatcher.slots() {
          prop_assert!(slot.load() <= slot.capacity());
        }
      }
    }
  }
}
