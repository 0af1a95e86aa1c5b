//! Static reference data loaded once at scheduler start, and the rules for
//! turning a control-store task row into a complete [`Task`].

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;
use tracing::info;

use crate::models::{ConfigMap, Credentials, ExchangeProfile, StrategyKind, Task, TaskRecord};
use crate::store::{ControlStore, StoreError};

static SYMBOL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._\-/]+$").expect("valid symbol pattern"));

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
  #[error("unknown exchange {0}")]
  UnknownExchange(i64),

  #[error("unknown strategy kind {0}")]
  UnknownStrategyKind(i64),

  #[error("invalid symbol {0:?}")]
  InvalidSymbol(String),

  #[error("strategy configuration is not a JSON object: {0}")]
  InvalidConfig(String),
}

#[derive(Debug, Clone, Default)]
pub struct Catalog {
  exchanges: BTreeMap<i64, ExchangeProfile>,
  strategy_kinds: BTreeMap<i64, StrategyKind>,
}

impl Catalog {
  pub fn new(exchanges: Vec<ExchangeProfile>, strategy_kinds: Vec<StrategyKind>) -> Self {
    Self {
      exchanges: exchanges.into_iter().map(|exchange| (exchange.id, exchange)).collect(),
      strategy_kinds: strategy_kinds.into_iter().map(|kind| (kind.id, kind)).collect(),
    }
  }

  pub async fn load(store: &dyn ControlStore) -> Result<Self, StoreError> {
    let catalog = Self::new(store.exchanges().await?, store.strategy_kinds().await?);
    info!(
      exchanges = catalog.exchanges.len(),
      strategy_kinds = catalog.strategy_kinds.len(),
      "Catalog loaded"
    );
    Ok(catalog)
  }

  pub fn build_task(&self, record: &TaskRecord, credentials: &Credentials) -> Result<Task, CatalogError> {
    if !SYMBOL.is_match(&record.symbol) {
      return Err(CatalogError::InvalidSymbol(record.symbol.clone()));
    }
    let exchange = self
      .exchanges
      .get(&record.exchange_id)
      .ok_or(CatalogError::UnknownExchange(record.exchange_id))?;
    let kind = self
      .strategy_kinds
      .get(&record.strategy_kind_id)
      .ok_or(CatalogError::UnknownStrategyKind(record.strategy_kind_id))?;

    Ok(Task {
      task_id: record.task_id.clone(),
      symbol: record.symbol.clone(),
      exchange: exchange.name.to_lowercase(),
      account_ref: record.account_id.to_string(),
      strategy_kind: kind.class_name.clone(),
      strategy_config: strategy_config(&record.raw_config, kind)?,
      connection: connection_params(exchange, credentials),
      desired_state: record.state,
    })
  }

  /// Parses an edited configuration for a task of the given strategy kind.
  pub fn config_for(&self, raw_config: &str, strategy_kind_id: i64) -> Result<ConfigMap, CatalogError> {
    let kind = self
      .strategy_kinds
      .get(&strategy_kind_id)
      .ok_or(CatalogError::UnknownStrategyKind(strategy_kind_id))?;
    strategy_config(raw_config, kind)
  }
}

/// Credentials go under the exchange's own parameter names, followed by its fixed parameters.
fn connection_params(exchange: &ExchangeProfile, credentials: &Credentials) -> ConfigMap {
  let mut params = exchange.params.clone();
  params.insert(exchange.key_field.clone(), credentials.api_key.clone().into());
  params.insert(exchange.secret_field.clone(), credentials.api_secret.clone().into());
  params
}

/// Stored configurations are JSON objects; older rows use single quotes.
fn strategy_config(raw: &str, kind: &StrategyKind) -> Result<ConfigMap, CatalogError> {
  let parsed = serde_json::from_str::<serde_json::Value>(raw)
    .or_else(|_| serde_json::from_str::<serde_json::Value>(&raw.replace('\'', "\"")))
    .map_err(|e| CatalogError::InvalidConfig(e.to_string()))?;
  let serde_json::Value::Object(map) = parsed else {
    return Err(CatalogError::InvalidConfig(format!("expected an object, got {parsed}")));
  };
  let mut config: ConfigMap = map.into_iter().collect();
  config.insert("class_name".into(), kind.class_name.clone().into());
  Ok(config)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::models::DesiredState;
  use chrono::Utc;
  use serde_json::json;

  fn catalog() -> Catalog {
    Catalog::new(
      vec![ExchangeProfile {
        id: 1,
        name: "BINANCE".into(),
        key_field: "key".into(),
        secret_field: "secret".into(),
        params: ConfigMap::from([("session_number".into(), json!(3))]),
      }],
      vec![StrategyKind { id: 4, name: "grid".into(), class_name: "FutureGridStrategy".into() }],
    )
  }

  fn record(symbol: &str, raw_config: &str) -> TaskRecord {
    TaskRecord {
      task_id: "390".into(),
      symbol: symbol.into(),
      raw_config: raw_config.into(),
      exchange_id: 1,
      strategy_kind_id: 4,
      account_id: 12,
      state: DesiredState::PendingStart,
      planned_at: Utc::now(),
    }
  }

  fn credentials() -> Credentials {
    Credentials { api_key: "k".into(), api_secret: "s".into() }
  }

  #[test]
  fn builds_a_complete_task() {
    let task = catalog().build_task(&record("BTCUSDT", r#"{"grid_step": "5"}"#), &credentials()).unwrap();
    assert_eq!(task.task_id, "390");
    assert_eq!(task.exchange, "binance");
    assert_eq!(task.account_ref, "12");
    assert_eq!(task.strategy_kind, "FutureGridStrategy");
    assert_eq!(task.strategy_config.get("grid_step"), Some(&json!("5")));
    assert_eq!(task.strategy_config.get("class_name"), Some(&json!("FutureGridStrategy")));
    assert_eq!(task.connection.get("key"), Some(&json!("k")));
    assert_eq!(task.connection.get("secret"), Some(&json!("s")));
    assert_eq!(task.connection.get("session_number"), Some(&json!(3)));
  }

  #[test]
  fn accepts_single_quoted_configuration() {
    let task = catalog().build_task(&record("BTCUSDT", "{'grid_step': '5'}"), &credentials()).unwrap();
    assert_eq!(task.strategy_config.get("grid_step"), Some(&json!("5")));
  }

  #[test]
  fn rejects_bad_rows() {
    let catalog = catalog();
    assert_eq!(
      catalog.build_task(&record("BTC USDT;", "{}"), &credentials()).unwrap_err(),
      CatalogError::InvalidSymbol("BTC USDT;".into())
    );
    assert!(matches!(
      catalog.build_task(&record("BTCUSDT", "[1, 2]"), &credentials()),
      Err(CatalogError::InvalidConfig(_))
    ));
    let mut unknown = record("BTCUSDT", "{}");
    unknown.exchange_id = 9;
    assert_eq!(catalog.build_task(&unknown, &credentials()).unwrap_err(), CatalogError::UnknownExchange(9));
  }

  #[test]
  fn config_for_requires_known_kind() {
    let catalog = catalog();
    assert!(catalog.config_for("{}", 4).is_ok());
    assert_eq!(catalog.config_for("{}", 5).unwrap_err(), CatalogError::UnknownStrategyKind(5));
  }
}
