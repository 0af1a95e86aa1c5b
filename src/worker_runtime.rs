//! Hosts the strategies assigned to one worker.
//!
//! Each step drains the worker's envelope stream in log order, applies every
//! instruction to the local registry, and publishes a heartbeat listing the
//! tasks actually running. A failed instruction is logged and skipped; it never
//! stops the stream.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::codec;
use crate::config::{WorkerConfig, span};
use crate::envelope::{EnvelopeCursor, Instruction};
use crate::models::{ConfigMap, Heartbeat, Snapshot, Task, WorkerId};
use crate::store::{StoreError, TaskLog};
use crate::strategy::{Gateway, GatewayConnector, Strategy, StrategyFactory, gateway_key};

struct Hosted {
  task: Task,
  strategy: Box<dyn Strategy>,
}

pub struct WorkerRuntime {
  worker_id: WorkerId,
  config: WorkerConfig,
  log: Arc<dyn TaskLog>,
  factory: Arc<dyn StrategyFactory>,
  connector: Arc<dyn GatewayConnector>,
  cursor: EnvelopeCursor,
  hosted: BTreeMap<String, Hosted>,
  gateways: HashMap<String, Arc<dyn Gateway>>,
  last_heartbeat: Option<DateTime<Utc>>,
}

impl WorkerRuntime {
  /// Envelopes written before `started_at` are never replayed.
  pub fn new(
    worker_id: WorkerId,
    config: WorkerConfig,
    started_at: DateTime<Utc>,
    log: Arc<dyn TaskLog>,
    factory: Arc<dyn StrategyFactory>,
    connector: Arc<dyn GatewayConnector>,
  ) -> Self {
    Self {
      worker_id,
      config,
      log,
      factory,
      connector,
      cursor: EnvelopeCursor::new(worker_id, started_at),
      hosted: BTreeMap::new(),
      gateways: HashMap::new(),
      last_heartbeat: None,
    }
  }

  pub fn worker_id(&self) -> WorkerId {
    self.worker_id
  }

  pub fn task_ids(&self) -> Vec<String> {
    self.hosted.keys().cloned().collect()
  }

  pub fn is_running(&self, task_id: &str) -> bool {
    self.hosted.contains_key(task_id)
  }

  pub fn task(&self, task_id: &str) -> Option<&Task> {
    self.hosted.get(task_id).map(|hosted| &hosted.task)
  }

  /// Current serialized state of a hosted strategy.
  pub fn snapshot(&self, task_id: &str) -> Option<Result<Snapshot>> {
    self.hosted.get(task_id).map(|hosted| hosted.strategy.serialize())
  }

  pub fn gateway_count(&self) -> usize {
    self.gateways.len()
  }

  pub async fn run<F>(mut self, shutdown: F)
  where
    F: Future<Output = ()>,
  {
    info!(worker_id = self.worker_id, "Worker runtime started");
    tokio::pin!(shutdown);
    loop {
      self.step(Utc::now()).await;
      tokio::select! {
        _ = tokio::time::sleep(self.config.poll_interval) => {}
        _ = &mut shutdown => break,
      }
    }
    self.shutdown().await;
  }

  /// One poll: apply everything new in the stream, then heartbeat if due.
  pub async fn step(&mut self, now: DateTime<Utc>) {
    if let Err(e) = self.drain().await {
      error!(worker_id = self.worker_id, error = %e, "Failed to read envelopes");
    }
    if self.heartbeat_due(now) {
      if let Err(e) = self.heartbeat(now).await {
        error!(worker_id = self.worker_id, error = %e, "Failed to write heartbeat");
      }
    }
  }

  /// Applies unread envelopes in log order and returns how many were consumed.
  pub async fn drain(&mut self) -> Result<usize, StoreError> {
    let envelopes = self.log.read_envelopes(&self.cursor).await?;
    let count = envelopes.len();
    for logged in envelopes {
      self.cursor.advance(logged.seq);
      let task_id = logged.envelope.task_id.clone();
      let operation = logged.envelope.operation_code;
      let outcome = match logged.envelope.open() {
        Ok(instruction) => self.apply(instruction).await,
        Err(e) => Err(anyhow!(e).context("undecodable envelope")),
      };
      if let Err(e) = outcome {
        error!(worker_id = self.worker_id, %task_id, operation, seq = logged.seq, error = ?e, "Instruction failed");
      }
    }
    Ok(count)
  }

  pub async fn heartbeat(&mut self, now: DateTime<Utc>) -> Result<(), StoreError> {
    let heartbeat = Heartbeat { worker_id: self.worker_id, timestamp: now, task_ids: self.task_ids() };
    self.log.write_heartbeat(&heartbeat).await?;
    self.last_heartbeat = Some(now);
    Ok(())
  }

  /// Stops every hosted strategy.
  pub async fn shutdown(&mut self) {
    for (task_id, mut hosted) in std::mem::take(&mut self.hosted) {
      if let Err(e) = hosted.strategy.stop().await {
        warn!(%task_id, error = ?e, "Strategy failed to stop cleanly");
      }
    }
    info!(worker_id = self.worker_id, "Worker runtime stopped");
  }

  fn heartbeat_due(&self, now: DateTime<Utc>) -> bool {
    self.last_heartbeat.is_none_or(|last| now - last >= span(self.config.heartbeat_interval))
  }

  async fn apply(&mut self, instruction: Instruction) -> Result<()> {
    let operation = instruction.operation();
    let task_id = instruction.task_id().to_string();
    match instruction {
      Instruction::Start(task) => self.start(task, None).await?,
      Instruction::Stop { task_id } => self.stop(&task_id).await?,
      Instruction::UpdateConfig { task_id, config } => self.update_config(&task_id, config).await?,
      Instruction::CancelOrders { task_id } => self.hosted_mut(&task_id)?.strategy.cancel_orders().await?,
      Instruction::Liquidate { task_id, rate } => self.hosted_mut(&task_id)?.strategy.liquidate(rate).await?,
      Instruction::Restart { task_id } => self.restart(&task_id).await?,
      Instruction::Pause { task_id } => self.pause(&task_id).await?,
      Instruction::Resume(task) => self.resume(task).await?,
    }
    info!(worker_id = self.worker_id, %task_id, %operation, "Instruction applied");
    Ok(())
  }

  async fn start(&mut self, task: Task, snapshot: Option<Snapshot>) -> Result<()> {
    if self.hosted.contains_key(&task.task_id) {
      warn!(task_id = %task.task_id, "Task already running; replacing instance");
      self.stop(&task.task_id).await?;
    }
    let gateway = self.gateway(&task).await?;
    let mut strategy = self.factory.create(&task, gateway)?;
    strategy.init().await?;
    if let Some(snapshot) = snapshot {
      strategy.restore(snapshot)?;
    }
    strategy.start().await?;
    self.hosted.insert(task.task_id.clone(), Hosted { task, strategy });
    Ok(())
  }

  async fn stop(&mut self, task_id: &str) -> Result<()> {
    let Some(mut hosted) = self.hosted.remove(task_id) else {
      warn!(task_id, "Stop for a task that is not running");
      return Ok(());
    };
    hosted.strategy.stop().await
  }

  async fn update_config(&mut self, task_id: &str, config: ConfigMap) -> Result<()> {
    let hosted = self.hosted_mut(task_id)?;
    hosted.strategy.update_config(&config).await?;
    hosted.task.strategy_config.extend(config);
    Ok(())
  }

  async fn restart(&mut self, task_id: &str) -> Result<()> {
    let task = self.hosted_mut(task_id)?.task.clone();
    self.stop(task_id).await?;
    self.start(task, None).await
  }

  /// The snapshot is persisted before the strategy stops; a failed save leaves it running.
  async fn pause(&mut self, task_id: &str) -> Result<()> {
    let Some(hosted) = self.hosted.get(task_id) else {
      warn!(task_id, "Pause for a task that is not running");
      return Ok(());
    };
    let snapshot = hosted.strategy.serialize().context("serialize strategy")?;
    let payload = codec::encode(&snapshot)?;
    self.log.save_snapshot(task_id, &payload, Utc::now()).await?;
    self.stop(task_id).await
  }

  async fn resume(&mut self, task: Task) -> Result<()> {
    let since = Utc::now() - span(self.config.snapshot_max_age);
    let payload = self
      .log
      .latest_snapshot(&task.task_id, since)
      .await?
      .ok_or_else(|| anyhow!("no snapshot for task {} within the retention window", task.task_id))?;
    let snapshot: Snapshot = codec::decode(&payload)?;
    self.start(task, Some(snapshot)).await
  }

  async fn gateway(&mut self, task: &Task) -> Result<Arc<dyn Gateway>> {
    let key = gateway_key(task);
    if let Some(gateway) = self.gateways.get(&key) {
      return Ok(gateway.clone());
    }
    let gateway = self.connector.connect(&key, &task.exchange, &task.connection).await?;
    self.gateways.insert(key, gateway.clone());
    Ok(gateway)
  }

  fn hosted_mut(&mut self, task_id: &str) -> Result<&mut Hosted> {
    self.hosted.get_mut(task_id).ok_or_else(|| anyhow!("task {task_id} is not running on this worker"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::dispatcher::Dispatch;
  use crate::envelope::TaskEnvelope;
  use crate::models::DesiredState;
  use crate::store::MemoryTaskLog;
  use crate::strategy::{PaperConnector, PaperStrategyFactory};
  use chrono::Duration;
  use serde_json::json;

  fn task(task_id: &str, account_ref: &str) -> Task {
    Task {
      task_id: task_id.into(),
      symbol: "ETHUSDT".into(),
      exchange: "binance".into(),
      account_ref: account_ref.into(),
      strategy_kind: "PaperStrategy".into(),
      strategy_config: ConfigMap::from([("grid_step".into(), json!("1"))]),
      connection: ConfigMap::new(),
      desired_state: DesiredState::PendingStart,
    }
  }

  struct Harness {
    log: MemoryTaskLog,
    connector: Arc<PaperConnector>,
    runtime: WorkerRuntime,
  }

  fn harness() -> Harness {
    let log = MemoryTaskLog::new();
    let connector = Arc::new(PaperConnector::new());
    let runtime = WorkerRuntime::new(
      1,
      WorkerConfig::default(),
      Utc::now() - Duration::seconds(5),
      Arc::new(log.clone()),
      Arc::new(PaperStrategyFactory),
      connector.clone(),
    );
    Harness { log, connector, runtime }
  }

  async fn send(log: &MemoryTaskLog, worker_id: WorkerId, instruction: Instruction) {
    let envelope = TaskEnvelope::seal(worker_id, &instruction, Utc::now()).unwrap();
    log.append(&envelope).await.unwrap();
  }

  #[tokio::test]
  async fn applies_own_envelopes_in_order() {
    let mut h = harness();
    send(&h.log, 1, Instruction::Start(task("1", "7"))).await;
    send(&h.log, 2, Instruction::Start(task("2", "7"))).await;
    send(&h.log, 1, Instruction::Start(task("3", "7"))).await;
    send(&h.log, 1, Instruction::Stop { task_id: "1".into() }).await;

    assert_eq!(h.runtime.drain().await.unwrap(), 3);
    assert_eq!(h.runtime.task_ids(), vec!["3".to_string()]);
    assert_eq!(h.runtime.drain().await.unwrap(), 0);
  }

  #[tokio::test]
  async fn ignores_envelopes_written_before_start() {
    let log = MemoryTaskLog::new();
    let stale = TaskEnvelope::seal(1, &Instruction::Start(task("1", "7")), Utc::now() - Duration::minutes(10)).unwrap();
    log.append(&stale).await.unwrap();
    let mut runtime = WorkerRuntime::new(
      1,
      WorkerConfig::default(),
      Utc::now() - Duration::minutes(1),
      Arc::new(log.clone()),
      Arc::new(PaperStrategyFactory),
      Arc::new(PaperConnector::new()),
    );
    assert_eq!(runtime.drain().await.unwrap(), 0);
    assert!(!runtime.is_running("1"));
  }

  #[tokio::test]
  async fn shares_gateways_per_exchange_account() {
    let mut h = harness();
    send(&h.log, 1, Instruction::Start(task("1", "7"))).await;
    send(&h.log, 1, Instruction::Start(task("2", "7"))).await;
    send(&h.log, 1, Instruction::Start(task("3", "8"))).await;
    h.runtime.drain().await.unwrap();
    assert_eq!(h.runtime.gateway_count(), 2);
    assert_eq!(h.connector.connections(), 2);
  }

  #[tokio::test]
  async fn failed_instruction_does_not_block_the_stream() {
    let mut h = harness();
    send(&h.log, 1, Instruction::CancelOrders { task_id: "9".into() }).await;
    h.log
      .append(&TaskEnvelope {
        worker_id: 1,
        task_id: "10".into(),
        operation_code: 42,
        payload: "garbage".into(),
        timestamp: Utc::now(),
      })
      .await
      .unwrap();
    send(&h.log, 1, Instruction::Start(task("1", "7"))).await;
    assert_eq!(h.runtime.drain().await.unwrap(), 3);
    assert!(h.runtime.is_running("1"));
  }

  #[tokio::test]
  async fn merges_config_edits() {
    let mut h = harness();
    send(&h.log, 1, Instruction::Start(task("1", "7"))).await;
    send(
      &h.log,
      1,
      Instruction::UpdateConfig { task_id: "1".into(), config: ConfigMap::from([("grid_size".into(), json!(4))]) },
    )
    .await;
    h.runtime.drain().await.unwrap();
    let config = &h.runtime.task("1").unwrap().strategy_config;
    assert_eq!(config.get("grid_step"), Some(&json!("1")));
    assert_eq!(config.get("grid_size"), Some(&json!(4)));
  }

  #[tokio::test]
  async fn pause_saves_a_snapshot_that_resume_restores() {
    let mut h = harness();
    send(&h.log, 1, Instruction::Start(task("1", "7"))).await;
    send(&h.log, 1, Instruction::Pause { task_id: "1".into() }).await;
    h.runtime.drain().await.unwrap();
    assert!(!h.runtime.is_running("1"));
    assert!(h.log.latest_snapshot("1", Utc::now() - Duration::minutes(1)).await.unwrap().is_some());

    send(&h.log, 1, Instruction::Resume(task("1", "7"))).await;
    h.runtime.drain().await.unwrap();
    assert!(h.runtime.is_running("1"));
    assert_eq!(h.runtime.snapshot("1").unwrap().unwrap(), json!({"position": 0.0, "open_orders": []}));
  }

  #[tokio::test]
  async fn pause_keeps_running_when_snapshot_cannot_be_saved() {
    let mut h = harness();
    send(&h.log, 1, Instruction::Start(task("2", "7"))).await;
    send(&h.log, 1, Instruction::Pause { task_id: "2".into() }).await;
    h.log.set_unavailable(true);
    h.runtime.drain().await.unwrap();
    assert!(h.runtime.is_running("2"));
  }

  #[tokio::test]
  async fn resume_without_snapshot_leaves_task_absent() {
    let mut h = harness();
    send(&h.log, 1, Instruction::Resume(task("5", "7"))).await;
    h.runtime.drain().await.unwrap();
    assert!(!h.runtime.is_running("5"));
  }

  #[tokio::test]
  async fn restart_keeps_the_task_and_resets_the_instance() {
    let mut h = harness();
    send(&h.log, 1, Instruction::Start(task("1", "7"))).await;
    send(&h.log, 1, Instruction::Restart { task_id: "1".into() }).await;
    h.runtime.drain().await.unwrap();
    assert!(h.runtime.is_running("1"));
    assert_eq!(h.connector.connections(), 1);
  }

  #[tokio::test]
  async fn first_heartbeat_is_immediate_then_periodic() {
    let mut h = harness();
    let now = Utc::now();
    send(&h.log, 1, Instruction::Start(task("1", "7"))).await;
    h.runtime.step(now).await;
    h.runtime.step(now + Duration::seconds(10)).await;
    h.runtime.step(now + Duration::seconds(30)).await;

    let beats = h.log.heartbeats_since(now - Duration::seconds(1)).await.unwrap();
    assert_eq!(beats.len(), 2);
    assert_eq!(beats[0].task_ids, vec!["1".to_string()]);
  }

  #[tokio::test]
  async fn dispatch_sealed_by_scheduler_is_readable() {
    let mut h = harness();
    let dispatch = Dispatch {
      worker_id: 1,
      action: crate::worker_slot::WorkerSlot::new(1, 2).start(task("4", "7")).unwrap(),
    };
    h.log.append(&dispatch.seal(Utc::now()).unwrap()).await.unwrap();
    h.runtime.drain().await.unwrap();
    assert!(h.runtime.is_running("4"));
  }
}
