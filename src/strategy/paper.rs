//! In-process strategy and gateway that never reach an exchange.
//!
//! The paper strategy keeps a position and a book of open orders in memory and
//! honours the full lifecycle contract, so a worker can run end to end before
//! live strategies are linked in. When configured with `entry_volume` (and
//! optionally `entry_price`) it opens that position on its first start and
//! rests an exit order for it.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{Gateway, GatewayConnector, Strategy, StrategyFactory};
use crate::models::{ConfigMap, Snapshot, Task};

#[derive(Debug)]
pub struct PaperGateway {
  key: String,
}

impl Gateway for PaperGateway {
  fn key(&self) -> &str {
    &self.key
  }
}

#[derive(Debug, Default)]
pub struct PaperConnector {
  connections: AtomicUsize,
}

impl PaperConnector {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn connections(&self) -> usize {
    self.connections.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl GatewayConnector for PaperConnector {
  async fn connect(&self, key: &str, exchange: &str, _connection: &ConfigMap) -> Result<Arc<dyn Gateway>> {
    self.connections.fetch_add(1, Ordering::SeqCst);
    info!(gateway = key, exchange, "Paper gateway connected");
    Ok(Arc::new(PaperGateway { key: key.to_string() }))
  }
}

#[derive(Debug, Clone, Default)]
pub struct PaperStrategyFactory;

impl StrategyFactory for PaperStrategyFactory {
  fn create(&self, task: &Task, gateway: Arc<dyn Gateway>) -> Result<Box<dyn Strategy>> {
    Ok(Box::new(PaperStrategy::new(task, gateway)))
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperOrder {
  pub price: f64,
  pub volume: f64,
}

/// State carried across a pause.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaperBook {
  pub position: f64,
  pub open_orders: Vec<PaperOrder>,
}

pub struct PaperStrategy {
  task_id: String,
  symbol: String,
  config: ConfigMap,
  gateway: Arc<dyn Gateway>,
  book: PaperBook,
  initialized: bool,
  trading: bool,
}

impl PaperStrategy {
  pub fn new(task: &Task, gateway: Arc<dyn Gateway>) -> Self {
    Self {
      task_id: task.task_id.clone(),
      symbol: task.symbol.clone(),
      config: task.strategy_config.clone(),
      gateway,
      book: PaperBook::default(),
      initialized: false,
      trading: false,
    }
  }

  pub fn book(&self) -> &PaperBook {
    &self.book
  }

  pub fn is_trading(&self) -> bool {
    self.trading
  }

  /// Opens the configured entry once; a restored or already-open book is left alone.
  fn enter(&mut self) {
    if self.book.position != 0.0 || !self.book.open_orders.is_empty() {
      return;
    }
    let Some(volume) = self.number("entry_volume").filter(|volume| *volume > 0.0) else {
      return;
    };
    let price = self.number("entry_price").unwrap_or(0.0);
    self.book.position = volume;
    self.book.open_orders.push(PaperOrder { price, volume });
    info!(task_id = %self.task_id, volume, price, "Paper entry filled");
  }

  fn number(&self, key: &str) -> Option<f64> {
    match self.config.get(key)? {
      serde_json::Value::String(raw) => raw.parse().ok(),
      value => value.as_f64(),
    }
  }
}

#[async_trait]
impl Strategy for PaperStrategy {
  async fn init(&mut self) -> Result<()> {
    self.initialized = true;
    info!(task_id = %self.task_id, symbol = %self.symbol, gateway = self.gateway.key(), "Paper strategy initialised");
    Ok(())
  }

  async fn start(&mut self) -> Result<()> {
    if !self.initialized {
      bail!("strategy {} started before init", self.task_id);
    }
    self.enter();
    self.trading = true;
    Ok(())
  }

  async fn stop(&mut self) -> Result<()> {
    self.trading = false;
    Ok(())
  }

  async fn update_config(&mut self, config: &ConfigMap) -> Result<()> {
    self.config.extend(config.clone());
    Ok(())
  }

  async fn cancel_orders(&mut self) -> Result<()> {
    let cancelled = self.book.open_orders.len();
    self.book.open_orders.clear();
    info!(task_id = %self.task_id, cancelled, "Paper orders cancelled");
    Ok(())
  }

  async fn liquidate(&mut self, rate: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&rate) {
      bail!("liquidation rate {rate} outside 0..=1");
    }
    let closed = self.book.position * rate;
    self.book.position -= closed;
    info!(task_id = %self.task_id, closed, remaining = self.book.position, "Paper position liquidated");
    Ok(())
  }

  fn serialize(&self) -> Result<Snapshot> {
    Ok(serde_json::to_value(&self.book)?)
  }

  fn restore(&mut self, snapshot: Snapshot) -> Result<()> {
    self.book = serde_json::from_value(snapshot)?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::codec;
  use crate::models::DesiredState;
  use proptest::prelude::{any, prop_assert_eq, proptest};
  use proptest::strategy::Strategy as _;
  use serde_json::json;

  fn task() -> Task {
    Task {
      task_id: "11".into(),
      symbol: "BTCUSDT".into(),
      exchange: "binance".into(),
      account_ref: "1".into(),
      strategy_kind: "PaperStrategy".into(),
      strategy_config: ConfigMap::from([("grid_step".into(), json!("2"))]),
      connection: ConfigMap::new(),
      desired_state: DesiredState::PendingStart,
    }
  }

  async fn strategy() -> PaperStrategy {
    let gateway = PaperConnector::new().connect("binance:1", "binance", &ConfigMap::new()).await.unwrap();
    PaperStrategy::new(&task(), gateway)
  }

  #[tokio::test]
  async fn must_init_before_start() {
    let mut strategy = strategy().await;
    assert!(strategy.start().await.is_err());
    strategy.init().await.unwrap();
    strategy.start().await.unwrap();
    assert!(strategy.is_trading());
    strategy.stop().await.unwrap();
    assert!(!strategy.is_trading());
  }

  #[tokio::test]
  async fn restore_then_trade_on_the_restored_book() {
    let mut strategy = strategy().await;
    strategy
      .restore(json!({"position": 2.0, "open_orders": [{"price": 100.0, "volume": 1.0}]}))
      .unwrap();
    strategy.liquidate(0.5).await.unwrap();
    assert_eq!(strategy.book().position, 1.0);
    strategy.cancel_orders().await.unwrap();
    assert!(strategy.book().open_orders.is_empty());
    assert_eq!(strategy.serialize().unwrap(), json!({"position": 1.0, "open_orders": []}));
  }

  #[tokio::test]
  async fn enters_once_from_configuration() {
    let mut strategy = strategy().await;
    strategy
      .update_config(&ConfigMap::from([("entry_volume".into(), json!("2")), ("entry_price".into(), json!(100.0))]))
      .await
      .unwrap();
    strategy.init().await.unwrap();
    strategy.start().await.unwrap();
    assert_eq!(strategy.book().position, 2.0);
    assert_eq!(strategy.book().open_orders, vec![PaperOrder { price: 100.0, volume: 2.0 }]);

    strategy.stop().await.unwrap();
    strategy.start().await.unwrap();
    assert_eq!(strategy.book().position, 2.0);
    assert_eq!(strategy.book().open_orders.len(), 1);
  }

  #[tokio::test]
  async fn rejects_out_of_range_liquidation() {
    let mut strategy = strategy().await;
    assert!(strategy.liquidate(1.5).await.is_err());
  }

  #[tokio::test]
  async fn snapshot_keeps_exact_position_across_pause() {
    let mut paused = strategy().await;
    let mut resumed = strategy().await;
    paused.restore(json!({"position": 989.8597941207809, "open_orders": []})).unwrap();
    let payload = codec::encode(&paused.serialize().unwrap()).unwrap();

    resumed.restore(codec::decode(&payload).unwrap()).unwrap();
    assert_eq!(resumed.book().position, 989.8597941207809);
  }

  proptest! {
    #[test]
    fn book_round_trips_through_the_codec(
      position in any::<f64>().prop_filter("finite", |v| v.is_finite()),
      price in any::<f64>().prop_filter("finite", |v| v.is_finite()),
    ) {
      let book = PaperBook { position, open_orders: vec![PaperOrder { price, volume: position }] };
      let restored: PaperBook = codec::decode(&codec::encode(&book).unwrap()).unwrap();
      prop_assert_eq!(restored, book);
    }
  }
}
