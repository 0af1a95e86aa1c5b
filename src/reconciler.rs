//! The scheduler's reconciliation loop.
//!
//! Each cycle compares the desired state in the control store against the
//! Dispatcher's view and emits envelopes to close the gap, in five phases:
//! pending starts, pending resumes, pending stops and pauses, operator
//! controls, and configuration edits. A phase that fails aborts the rest of
//! the cycle; the next cycle picks up whatever is still pending.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{error, info, warn};

use crate::catalog::Catalog;
use crate::config::{SchedulerConfig, span};
use crate::dispatcher::{Dispatch, Dispatcher, Route};
use crate::liveness::LivenessView;
use crate::models::{AdminOperation, DesiredState, Task, TaskRecord};
use crate::store::{ControlStore, StoreError, TaskLog};

pub struct Reconciler {
  config: SchedulerConfig,
  store: Arc<dyn ControlStore>,
  log: Arc<dyn TaskLog>,
  catalog: Catalog,
  dispatcher: Dispatcher,
  active: BTreeSet<String>,
}

impl Reconciler {
  pub async fn new(
    config: SchedulerConfig,
    store: Arc<dyn ControlStore>,
    log: Arc<dyn TaskLog>,
  ) -> Result<Self, StoreError> {
    let catalog = Catalog::load(store.as_ref()).await?;
    let dispatcher = Dispatcher::new(config.worker_count, config.worker_capacity, config.reserve_margin);
    Ok(Self { config, store, log, catalog, dispatcher, active: BTreeSet::new() })
  }

  pub fn dispatcher(&self) -> &Dispatcher {
    &self.dispatcher
  }

  pub fn is_active(&self, task_id: &str) -> bool {
    self.active.contains(task_id)
  }

  /// Rebuilds slot contents from recent heartbeats after a scheduler restart.
  pub async fn recover(&mut self) -> Result<usize, StoreError> {
    let now = Utc::now();
    let lookback = span(self.config.recovery_lookback);
    let view = LivenessView::from_heartbeats(self.log.heartbeats_since(now - lookback).await?, now, lookback);

    let mut adopted = 0;
    for worker_id in 1..=self.config.worker_count as i32 {
      let Some(heartbeat) = view.latest(worker_id).cloned() else {
        continue;
      };
      for task_id in heartbeat.task_ids {
        let Some(record) = self.store.task(&task_id).await? else {
          warn!(worker_id, %task_id, "Reported task missing from control store");
          continue;
        };
        if matches!(record.state, DesiredState::Stopped | DesiredState::Paused) {
          continue;
        }
        let Some(task) = self.resolve(&record).await? else {
          continue;
        };
        match self.dispatcher.adopt(worker_id, task) {
          Ok(()) => {
            self.active.insert(task_id);
            adopted += 1;
          }
          Err(rejection) => warn!(worker_id, %task_id, %rejection, "Could not adopt reported task"),
        }
      }
    }
    info!(adopted, "Recovered task placement from heartbeats");
    Ok(adopted)
  }

  pub async fn run<F>(mut self, shutdown: F)
  where
    F: Future<Output = ()>,
  {
    info!(workers = self.config.worker_count, capacity = self.config.worker_capacity, "Scheduler started");
    tokio::pin!(shutdown);
    loop {
      if let Err(e) = self.run_cycle().await {
        error!(error = ?e, "Reconciliation cycle failed");
      }
      tokio::select! {
        _ = tokio::time::sleep(self.config.cycle_delay) => {}
        _ = &mut shutdown => break,
      }
    }
    info!("Scheduler stopped");
  }

  pub async fn run_cycle(&mut self) -> Result<()> {
    self.start_phase().await.context("start phase")?;
    self.resume_phase().await.context("resume phase")?;
    self.stop_phase().await.context("stop phase")?;
    self.control_phase().await.context("control phase")?;
    self.config_phase().await.context("config phase")?;
    Ok(())
  }

  pub async fn start_phase(&mut self) -> Result<()> {
    let planned_since = Utc::now() - span(self.config.start_lookback);
    let records = self
      .store
      .tasks_in_state(DesiredState::PendingStart, Some(planned_since), self.config.min_task_id)
      .await?;
    self.admit(records, Dispatcher::assign_start).await
  }

  pub async fn resume_phase(&mut self) -> Result<()> {
    let records = self.store.tasks_in_state(DesiredState::PendingResume, None, self.config.min_task_id).await?;
    self.admit(records, Dispatcher::assign_resume).await
  }

  /// Routes pending stops and pauses for active tasks to their holders.
  pub async fn stop_phase(&mut self) -> Result<()> {
    for task_id in self.active.clone() {
      let Some(state) = self.store.desired_state(&task_id).await? else {
        warn!(%task_id, "Active task missing from control store");
        continue;
      };
      let (route, settled) = match state {
        DesiredState::PendingStop => (Route::Stop, DesiredState::Stopped),
        DesiredState::PendingPause => (Route::Pause, DesiredState::Paused),
        _ => continue,
      };
      match self.dispatcher.route_existing(&task_id, route) {
        Some(dispatch) => self.commit(&dispatch).await?,
        None => warn!(%task_id, ?settled, "No worker holds task; settling without an envelope"),
      }
      self.store.set_desired_state(&task_id, settled).await?;
      self.active.remove(&task_id);
    }
    Ok(())
  }

  /// Every pending control is acknowledged once seen, delivered or not.
  pub async fn control_phase(&mut self) -> Result<()> {
    for request in self.store.pending_controls().await? {
      if !self.active.contains(&request.task_id) {
        continue;
      }
      let route = match request.operation {
        AdminOperation::CancelAll => Route::CancelOrders,
        AdminOperation::Liquidate => Route::Liquidate { rate: request.liquidation_rate() },
        AdminOperation::Restart => Route::Restart,
      };
      self.deliver(&request.task_id, route).await;
      self.store.acknowledge_control(request.id).await?;
    }
    Ok(())
  }

  pub async fn config_phase(&mut self) -> Result<()> {
    for edit in self.store.pending_config_edits().await? {
      if !self.active.contains(&edit.task_id) {
        continue;
      }
      match self.catalog.config_for(&edit.raw_config, edit.strategy_kind_id) {
        Ok(config) => self.deliver(&edit.task_id, Route::UpdateConfig(config)).await,
        Err(e) => error!(task_id = %edit.task_id, error = %e, "Discarding unreadable configuration edit"),
      }
      self.store.mark_config_applied(&edit.task_id).await?;
    }
    Ok(())
  }

  async fn admit(
    &mut self,
    records: Vec<TaskRecord>,
    assign: fn(&mut Dispatcher, Task, &LivenessView) -> Option<Dispatch>,
  ) -> Result<()> {
    if records.is_empty() {
      return Ok(());
    }
    let liveness = self.liveness().await?;
    for record in records {
      // Already dispatched in an earlier cycle whose state write failed.
      if let Some(worker_id) = self.dispatcher.holder(&record.task_id) {
        info!(task_id = %record.task_id, worker_id, "Task already placed; marking running");
        self.mark_running(&record.task_id).await?;
        continue;
      }
      let Some(task) = self.resolve(&record).await? else {
        continue;
      };
      let Some(dispatch) = assign(&mut self.dispatcher, task, &liveness) else {
        info!(task_id = %record.task_id, state = ?record.state, "No eligible worker; task stays pending");
        continue;
      };
      self.commit(&dispatch).await?;
      self.mark_running(&record.task_id).await?;
    }
    Ok(())
  }

  async fn mark_running(&mut self, task_id: &str) -> Result<(), StoreError> {
    self.store.set_desired_state(task_id, DesiredState::Running).await?;
    self.active.insert(task_id.to_string());
    Ok(())
  }

  async fn liveness(&self) -> Result<LivenessView, StoreError> {
    let now = Utc::now();
    let freshness = span(self.config.heartbeat_freshness);
    Ok(LivenessView::from_heartbeats(self.log.heartbeats_since(now - freshness).await?, now, freshness))
  }

  /// Builds the full task for a control-store row; rows that cannot be built are skipped.
  async fn resolve(&self, record: &TaskRecord) -> Result<Option<Task>, StoreError> {
    let Some(credentials) = self.store.credentials(record.account_id).await? else {
      warn!(task_id = %record.task_id, account_id = record.account_id, "No credentials for account");
      return Ok(None);
    };
    match self.catalog.build_task(record, &credentials) {
      Ok(task) => Ok(Some(task)),
      Err(e) => {
        warn!(task_id = %record.task_id, error = %e, "Cannot build task");
        Ok(None)
      }
    }
  }

  /// Routes an at-most-once request; failures are logged, not retried.
  async fn deliver(&mut self, task_id: &str, route: Route) {
    match self.dispatcher.route_existing(task_id, route) {
      Some(dispatch) => {
        if let Err(e) = self.commit(&dispatch).await {
          error!(task_id, error = ?e, "Dropping request after failed dispatch");
        }
      }
      None => warn!(task_id, "No worker holds task; dropping request"),
    }
  }

  /// Seals and appends the envelope; the slot change is undone if the append fails.
  async fn commit(&mut self, dispatch: &Dispatch) -> Result<()> {
    let instruction = dispatch.instruction();
    let appended = match dispatch.seal(Utc::now()) {
      Ok(envelope) => self.log.append(&envelope).await.map_err(anyhow::Error::from),
      Err(e) => Err(e.into()),
    };
    match appended {
      Ok(seq) => {
        info!(
          worker_id = dispatch.worker_id,
          task_id = instruction.task_id(),
          operation = %instruction.operation(),
          seq,
          "Dispatched"
        );
        Ok(())
      }
      Err(e) => {
        self.dispatcher.rollback(dispatch);
        Err(e.context(format!("dispatch {} for task {}", instruction.operation(), instruction.task_id())))
      }
    }
  }
}
