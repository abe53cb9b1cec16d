//! Wire format of the robot's push-event channel.
//!
//! The robot exposes a WebSocket endpoint at `ws://<ip>/pubsub`.  A client
//! sends one JSON control frame per subscription and then receives frames of
//! the form `{"message": <payload>, ...}` until it unsubscribes.
//!
//! | Frame | Shape |
//! |---|---|
//! | subscribe | `{"Operation":"subscribe","Type":..,"DebounceMs":..,"EventName":..,"ReturnProperty":..}` |
//! | unsubscribe | `{"Operation":"unsubscribe","EventName":..,"Message":""}` |
//! | inbound | `{"message": {...}}` |

use misty_types::MistyError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Control frame sent from the client to the robot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "Operation", rename_all = "lowercase")]
pub enum ControlMessage {
    Subscribe {
        #[serde(rename = "Type")]
        event_type: String,
        #[serde(rename = "DebounceMs")]
        debounce_ms: u64,
        #[serde(rename = "EventName")]
        event_name: String,
        /// Serialised as `null` when absent; the robot expects the key.
        #[serde(rename = "ReturnProperty")]
        return_property: Option<String>,
    },
    Unsubscribe {
        #[serde(rename = "EventName")]
        event_name: String,
        #[serde(rename = "Message", default)]
        message: String,
    },
}

impl ControlMessage {
    pub fn unsubscribe(event_name: impl Into<String>) -> Self {
        Self::Unsubscribe {
            event_name: event_name.into(),
            message: String::new(),
        }
    }

    /// Compact JSON text for a WebSocket text frame.
    pub fn to_frame(&self) -> Result<String, MistyError> {
        serde_json::to_string(self).map_err(|e| MistyError::Serialization(e.to_string()))
    }
}

/// Extract the `message` payload from an inbound text frame.
///
/// # Errors
///
/// Returns [`MistyError::MalformedFrame`] when the text is not a JSON object
/// or has no `message` key.
pub fn parse_frame(text: &str) -> Result<Value, MistyError> {
    let mut frame: Value = serde_json::from_str(text)
        .map_err(|e| MistyError::MalformedFrame(format!("invalid JSON: {e}")))?;
    frame
        .get_mut("message")
        .map(Value::take)
        .ok_or_else(|| MistyError::MalformedFrame(format!("no `message` field in {text}")))
}

/// Push-event endpoint for a robot reachable at `ip` (host or host:port).
pub fn pubsub_url(ip: &str) -> String {
    format!("ws://{ip}/pubsub")
}
