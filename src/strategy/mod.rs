//! Contracts between the worker runtime and the units it hosts.
//!
//! A strategy is opaque to the runtime beyond its lifecycle: it is created for
//! one task, initialised, started, and later stopped. While running it accepts
//! configuration edits and trading commands, and it can be serialized at pause
//! and restored at resume. Exchange connectivity is reached through a
//! [`Gateway`] shared by every task on the same exchange account.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{ConfigMap, Snapshot, Task};

pub mod paper;

pub use paper::{PaperConnector, PaperStrategyFactory};

#[async_trait]
pub trait Strategy: Send {
  async fn init(&mut self) -> Result<()>;

  async fn start(&mut self) -> Result<()>;

  async fn stop(&mut self) -> Result<()>;

  /// Merges `config` into the running configuration.
  async fn update_config(&mut self, config: &ConfigMap) -> Result<()>;

  async fn cancel_orders(&mut self) -> Result<()>;

  /// Closes `rate` (0..=1) of the current position.
  async fn liquidate(&mut self, rate: f64) -> Result<()>;

  fn serialize(&self) -> Result<Snapshot>;

  fn restore(&mut self, snapshot: Snapshot) -> Result<()>;
}

/// A live connection to one exchange account.
pub trait Gateway: Send + Sync {
  fn key(&self) -> &str;
}

#[async_trait]
pub trait GatewayConnector: Send + Sync {
  async fn connect(&self, key: &str, exchange: &str, connection: &ConfigMap) -> Result<Arc<dyn Gateway>>;
}

pub trait StrategyFactory: Send + Sync {
  fn create(&self, task: &Task, gateway: Arc<dyn Gateway>) -> Result<Box<dyn Strategy>>;
}

/// Tasks on the same exchange account share one gateway.
pub fn gateway_key(task: &Task) -> String {
  format!("{}:{}", task.exchange, task.account_ref)
}
