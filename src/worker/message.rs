use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Control messages a page can post to the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
  /// Leave `waiting` now instead of waiting for every client to close
  SkipWaiting,
}

impl ControlMessage {
  /// Interpret arbitrary message data; anything unrecognised is `None`.
  pub fn parse(data: &Value) -> Option<Self> {
    serde_json::from_value(data.clone()).ok()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_parse_skip_waiting() {
    let msg = ControlMessage::parse(&json!({ "type": "SKIP_WAITING" }));
    assert_eq!(msg, Some(ControlMessage::SkipWaiting));
  }

  #[test]
  fn test_extra_fields_are_ignored() {
    let msg = ControlMessage::parse(&json!({ "type": "SKIP_WAITING", "from": "page" }));
    assert_eq!(msg, Some(ControlMessage::SkipWaiting));
  }

  #[test]
  fn test_unknown_messages() {
    assert_eq!(ControlMessage::parse(&json!({ "type": "CLAIM" })), None);
    assert_eq!(ControlMessage::parse(&json!("SKIP_WAITING")), None);
    assert_eq!(ControlMessage::parse(&Value::Null), None);
  }

  #[test]
  fn test_serializes_as_tagged_object() {
    let value = serde_json::to_value(ControlMessage::SkipWaiting).unwrap();
    assert_eq!(value, json!({ "type": "SKIP_WAITING" }));
  }
}
