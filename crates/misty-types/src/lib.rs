use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Routing key for transport errors raised by the subscription named `local_name`.
pub fn error_event_name(local_name: &str) -> String {
    format!("error_{local_name}")
}

/// Routing key for the close notification of the subscription named `local_name`.
pub fn close_event_name(local_name: &str) -> String {
    format!("close_{local_name}")
}

/// Routing key for the open notification of the subscription named `local_name`.
pub fn open_event_name(local_name: &str) -> String {
    format!("open_{local_name}")
}

/// Unified event wrapper for the local event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Routing key, e.g. "face_rec_x1y2z3" or "close_face_rec_x1y2z3".
    pub name: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(name: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            name: name.into(),
            payload,
        }
    }

    /// A robot push message delivered under the subscription's own name.
    pub fn message(local_name: &str, message: Value) -> Self {
        Self::new(local_name, EventPayload::Message(message))
    }

    pub fn error(local_name: &str, details: impl Into<String>) -> Self {
        Self::new(error_event_name(local_name), EventPayload::Error(details.into()))
    }

    pub fn closed(local_name: &str, reason: impl Into<String>) -> Self {
        Self::new(close_event_name(local_name), EventPayload::Closed(reason.into()))
    }

    pub fn opened(local_name: &str) -> Self {
        Self::new(open_event_name(local_name), EventPayload::Opened)
    }

    /// The robot payload, if this event carries one.
    pub fn message_body(&self) -> Option<&Value> {
        match &self.payload {
            EventPayload::Message(v) => Some(v),
            _ => None,
        }
    }
}

/// Variants of data that can be routed over the local event bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventPayload {
    /// The `message` field of an inbound push frame.
    Message(Value),
    /// Transport or frame-parsing failure.
    Error(String),
    /// The push connection closed.
    Closed(String),
    /// The push connection opened and the subscribe frame was sent.
    Opened,
}

/// Outcome of one call against the robot's request/response action API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ActionResult {
    pub fn ok(result: Option<Value>) -> Self {
        Self {
            success: true,
            result,
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            message: Some(message.into()),
        }
    }

    /// Convert into a `Result`, naming `action` in the error.
    pub fn into_result(self, action: &str) -> Result<Option<Value>, MistyError> {
        if self.success {
            Ok(self.result)
        } else {
            Err(MistyError::Action {
                action: action.to_string(),
                details: self.message.unwrap_or_else(|| "no details".to_string()),
            })
        }
    }

    /// `true` when the call succeeded and the robot answered with a truthy
    /// `result` (the robot reports service state as a boolean result).
    pub fn is_truthy(&self) -> bool {
        self.success
            && match &self.result {
                Some(Value::Bool(b)) => *b,
                Some(Value::Null) | None => false,
                Some(_) => true,
            }
    }
}

/// Error type spanning the push channel, the action API and local recordings.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MistyError {
    #[error("Transport Error: {0}")]
    Transport(String),

    #[error("Malformed Frame: {0}")]
    MalformedFrame(String),

    #[error("Serialization Error: {0}")]
    Serialization(String),

    #[error("Action {action} failed: {details}")]
    Action { action: String, details: String },

    #[error("Recording Error: {0}")]
    Recording(String),
}
