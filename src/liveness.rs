use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};

use crate::models::{Heartbeat, WorkerId};

/// Liveness and load of every worker, taken from a single heartbeat read.
///
/// Freshness and load come from the same heartbeat, so a scheduling decision
/// never mixes a recent liveness signal with an older load figure.
#[derive(Debug, Clone, Default)]
pub struct LivenessView {
  latest: BTreeMap<WorkerId, Heartbeat>,
  fresh_after: Option<DateTime<Utc>>,
}

impl LivenessView {
  pub fn from_heartbeats(heartbeats: Vec<Heartbeat>, now: DateTime<Utc>, freshness: Duration) -> Self {
    let mut latest: BTreeMap<WorkerId, Heartbeat> = BTreeMap::new();
    for heartbeat in heartbeats {
      match latest.get(&heartbeat.worker_id) {
        Some(current) if current.timestamp >= heartbeat.timestamp => {}
        _ => {
          latest.insert(heartbeat.worker_id, heartbeat);
        }
      }
    }
    Self { latest, fresh_after: Some(now - freshness) }
  }

  pub fn is_live(&self, worker_id: WorkerId) -> bool {
    self.fresh(worker_id).is_some()
  }

  /// Number of tasks a live worker reported; `None` when the worker is stale or silent.
  pub fn load(&self, worker_id: WorkerId) -> Option<usize> {
    self.fresh(worker_id).map(|heartbeat| heartbeat.task_ids.len())
  }

  /// Most recent heartbeat regardless of freshness.
  pub fn latest(&self, worker_id: WorkerId) -> Option<&Heartbeat> {
    self.latest.get(&worker_id)
  }

  fn fresh(&self, worker_id: WorkerId) -> Option<&Heartbeat> {
    let fresh_after = self.fresh_after?;
    self.latest.get(&worker_id).filter(|heartbeat| heartbeat.timestamp >= fresh_after)
  }
}
