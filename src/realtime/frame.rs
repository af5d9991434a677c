//! JSON frames exchanged over the realtime side-channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};

/// A `{type, data}` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Frame {
  /// Liveness check; `timestamp` is epoch milliseconds
  Ping { timestamp: i64 },
  Pong { timestamp: i64 },
  ConfigPush { id: String, config: Value },
  ConfigAck {
    id: String,
    ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
  },
}

/// Frame types this client understands.
const KNOWN_TYPES: [&str; 4] = ["ping", "pong", "config_push", "config_ack"];

impl Frame {
  pub fn ping() -> Self {
    Self::Ping {
      timestamp: chrono::Utc::now().timestamp_millis(),
    }
  }

  pub fn encode(&self) -> Result<String> {
    serde_json::to_string(self).map_err(|e| Error::Connection(format!("encode frame: {}", e)))
  }

  /// Decode a text frame. Frames of a type we do not know are `None`.
  pub fn decode(text: &str) -> Result<Option<Self>> {
    let raw: Value = serde_json::from_str(text)
      .map_err(|e| Error::Connection(format!("malformed frame: {}", e)))?;

    let kind = raw.get("type").and_then(Value::as_str).unwrap_or_default().to_owned();
    if !KNOWN_TYPES.contains(&kind.as_str()) {
      debug!(kind = %kind, "Ignoring unrecognized frame");
      return Ok(None);
    }

    serde_json::from_value(raw)
      .map(Some)
      .map_err(|e| Error::Connection(format!("malformed {} frame: {}", kind, e)))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_wire_shape() {
    let frame = Frame::ConfigPush {
      id: "c1".into(),
      config: json!({ "theme": "dark" }),
    };
    let wire: Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
    assert_eq!(
      wire,
      json!({ "type": "config_push", "data": { "id": "c1", "config": { "theme": "dark" } } })
    );
  }

  #[test]
  fn test_decodes_ack_without_message() {
    let frame = Frame::decode(r#"{"type":"config_ack","data":{"id":"c1","ok":true}}"#).unwrap();
    assert_eq!(
      frame,
      Some(Frame::ConfigAck {
        id: "c1".into(),
        ok: true,
        message: None
      })
    );
  }

  #[test]
  fn test_unknown_types_are_ignored() {
    assert_eq!(Frame::decode(r#"{"type":"presence","data":{}}"#).unwrap(), None);
    assert_eq!(Frame::decode(r#"{"data":{}}"#).unwrap(), None);
  }

  #[test]
  fn test_malformed_frames_are_errors() {
    assert!(Frame::decode("not json").is_err());
    assert!(Frame::decode(r#"{"type":"ping","data":{}}"#).is_err());
  }

  #[test]
  fn test_malformed_known_frame_names_its_type() {
    let err = Frame::decode(r#"{"type":"config_ack","data":{"ok":"yes"}}"#).unwrap_err();
    assert!(matches!(&err, Error::Connection(msg) if msg.starts_with("malformed config_ack frame")));
  }
}
