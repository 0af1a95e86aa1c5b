//! Envelope payload codec.
//!
//! Payloads travel as text rows in the durable log: the value is serialized to
//! JSON, zlib-compressed, then base64-encoded. Every mapping in the payload
//! types is a `BTreeMap`, so the JSON form (and therefore the encoded text) is
//! deterministic for equal values.

use std::io::{Read, Write};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
  #[error("payload is not valid base64: {0}")]
  Base64(#[from] base64::DecodeError),

  #[error("payload failed to (de)compress: {0}")]
  Compression(#[from] std::io::Error),

  #[error("payload is not a valid document: {0}")]
  Json(#[from] serde_json::Error),

  #[error("unknown operation code {0}")]
  UnknownOperation(i16),
}

pub fn encode<T: Serialize>(value: &T) -> Result<String, CodecError> {
  let json = serde_json::to_vec(value)?;
  let mut encoder = ZlibEncoder::new(Vec::with_capacity(json.len() / 2), Compression::default());
  encoder.write_all(&json)?;
  let compressed = encoder.finish()?;
  Ok(STANDARD.encode(compressed))
}

pub fn decode<T: DeserializeOwned>(text: &str) -> Result<T, CodecError> {
  let compressed = STANDARD.decode(text.trim())?;
  let mut json = Vec::new();
  ZlibDecoder::new(compressed.as_slice()).read_to_end(&mut json)?;
  Ok(serde_json::from_slice(&json)?)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::models::{ConfigMap, DesiredState, Task};
  use proptest::prelude::*;
  use serde_json::json;

  fn task(config: ConfigMap) -> Task {
    Task {
      task_id: "383".into(),
      symbol: "BTCUSDT".into(),
      exchange: "binance".into(),
      account_ref: "12".into(),
      strategy_kind: "FutureGridStrategy".into(),
      strategy_config: config,
      connection: ConfigMap::from([("key".into(), json!("k")), ("secret".into(), json!("s"))]),
      desired_state: DesiredState::PendingStart,
    }
  }

  #[test]
  fn encoding_is_deterministic() {
    let mut a = ConfigMap::new();
    a.insert("grid_step".into(), json!("5"));
    a.insert("head_fix".into(), json!("0.001"));
    let mut b = ConfigMap::new();
    b.insert("head_fix".into(), json!("0.001"));
    b.insert("grid_step".into(), json!("5"));
    assert_eq!(encode(&task(a)).unwrap(), encode(&task(b)).unwrap());
  }

  #[test]
  fn encoded_text_is_transport_safe() {
    let text = encode(&task(ConfigMap::new())).unwrap();
    assert!(text.chars().all(|c| c.is_ascii_alphanumeric() || "+/=".contains(c)));
  }

  #[test]
  fn rejects_corrupt_payloads() {
    assert!(matches!(decode::<Task>("not base64 !!"), Err(CodecError::Base64(_))));
    let not_zlib = STANDARD.encode(b"plain bytes");
    assert!(matches!(decode::<Task>(&not_zlib), Err(CodecError::Compression(_))));
    let wrong_shape = encode(&json!({"task_id": 1})).unwrap();
    assert!(matches!(decode::<Task>(&wrong_shape), Err(CodecError::Json(_))));
  }

  #[test]
  fn rejects_truncated_payloads() {
    let text = encode(&task(ConfigMap::new())).unwrap();
    let truncated = &text[..text.len() / 2];
    assert!(decode::<Task>(truncated).is_err());
  }

  fn config_value() -> impl Strategy<Value = serde_json::Value> {
    prop_oneof![
      any::<i64>().prop_map(|n| json!(n)),
      any::<f64>().prop_filter("finite", |f| f.is_finite()).prop_map(|f| json!(f)),
      "[a-zA-Z0-9 ._-]{0,16}".prop_map(|s| json!(s)),
      any::<bool>().prop_map(|b| json!(b)),
      Just(serde_json::Value::Null),
    ]
  }

  proptest! {
    #[test]
    fn task_round_trips(
      symbol in "[A-Z]{3,10}",
      config in prop::collection::btree_map("[a-z_]{1,12}", config_value(), 0..12),
    ) {
      let mut original = task(config);
      original.symbol = symbol;
      let decoded: Task = decode(&encode(&original).unwrap()).unwrap();
      prop_assert_eq!(decoded, original);
    }
  }
}
