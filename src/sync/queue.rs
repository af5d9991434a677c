//! Write intents queued for later delivery.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Queued operations are dropped after this many failed deliveries.
pub const MAX_OPERATION_RETRIES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
  Create,
  Update,
  UpdateStatus,
  Delete,
}

impl OperationType {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Create => "create",
      Self::Update => "update",
      Self::UpdateStatus => "update_status",
      Self::Delete => "delete",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "create" => Some(Self::Create),
      "update" => Some(Self::Update),
      "update_status" => Some(Self::UpdateStatus),
      "delete" => Some(Self::Delete),
      _ => None,
    }
  }
}

impl fmt::Display for OperationType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A write the server has not acknowledged yet.
///
/// Records are keyed by `(op_type, resource_id)`: queueing the same key
/// again replaces the payload, so repeated local edits collapse into the
/// latest intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
  pub op_type: OperationType,
  pub resource_id: String,
  pub payload: serde_json::Value,
  pub timestamp: DateTime<Utc>,
  pub retry_count: u32,
  pub last_error: Option<String>,
}

impl SyncOperation {
  pub fn new(
    op_type: OperationType,
    resource_id: impl Into<String>,
    payload: serde_json::Value,
  ) -> Self {
    Self {
      op_type,
      resource_id: resource_id.into(),
      payload,
      timestamp: Utc::now(),
      retry_count: 0,
      last_error: None,
    }
  }
}

/// Outcome of replaying the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
  pub delivered: usize,
  pub dropped: usize,
  pub remaining: usize,
}
