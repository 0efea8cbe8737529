use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

/// Fixed topic set for one device. Relay and control are written by the
/// hub; status and telemetry are pushed by the device bridge.
#[derive(Debug, Clone)]
pub struct Topics {
    device_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicKind {
    Relay,
    Control,
    Status,
    Telemetry,
    Ping,
}

impl Topics {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// "data/<id>/swr": relay switch command.
    pub fn relay(&self) -> String {
        format!("data/{}/swr", self.device_id)
    }

    /// "irrigation/<id>/control": session announcement with duration.
    pub fn control(&self) -> String {
        format!("irrigation/{}/control", self.device_id)
    }

    /// "data/<id>/status": device-reported irrigation state.
    pub fn status(&self) -> String {
        format!("data/{}/status", self.device_id)
    }

    /// "data/<id>/logs": device telemetry.
    pub fn telemetry(&self) -> String {
        format!("data/{}/logs", self.device_id)
    }

    /// "data/<id>/ping": hub health-check heartbeat.
    pub fn ping(&self) -> String {
        format!("data/{}/ping", self.device_id)
    }

    /// Topics (re)subscribed on every successful connect.
    pub fn subscriptions(&self) -> Vec<String> {
        vec![self.status(), self.telemetry(), self.relay(), self.control()]
    }

    pub fn classify(&self, topic: &str) -> Option<TopicKind> {
        let parts: Vec<&str> = topic.split('/').collect();
        if parts.len() != 3 || parts[1] != self.device_id {
            return None;
        }
        match (parts[0], parts[2]) {
            ("data", "swr") => Some(TopicKind::Relay),
            ("irrigation", "control") => Some(TopicKind::Control),
            ("data", "status") => Some(TopicKind::Status),
            ("data", "logs") => Some(TopicKind::Telemetry),
            ("data", "ping") => Some(TopicKind::Ping),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Message types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    On,
    Off,
}

impl DeviceState {
    pub fn as_flag(self) -> u8 {
        match self {
            Self::On => 1,
            Self::Off => 0,
        }
    }
}

/// Relay switch command: `{"device":1}` / `{"device":0}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayCommand {
    pub device: u8,
}

impl RelayCommand {
    pub fn new(state: DeviceState) -> Self {
        Self {
            device: state.as_flag(),
        }
    }
}

/// Session announcement on the control topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrrigationCommand {
    pub irrigation: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub duration_minutes: Option<f64>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Device-reported state. Only `irrigating` matters to the core; `None`
/// means "no status change".
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusUpdate {
    pub irrigating: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DeviceMessage {
    Relay(RelayCommand),
    Control(IrrigationCommand),
    Status(StatusUpdate),
    Telemetry { data: Value },
    Ping,
}

/// Inbound message after the parse boundary.
#[derive(Debug, Clone, Serialize)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: String,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
    pub message: DeviceMessage,
}

// ---------------------------------------------------------------------------
// Parse boundary
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("topic '{0}' is not part of this device's topic set")]
    UnknownTopic(String),
    #[error("payload is not valid utf-8")]
    InvalidUtf8,
    #[error("payload is not valid json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("unexpected payload shape: {0}")]
    UnexpectedShape(&'static str),
}

/// Parse a raw publish into a typed message. Never panics; the caller logs
/// and drops on `Err`.
pub fn parse_inbound(
    topics: &Topics,
    topic: &str,
    payload: &[u8],
) -> Result<InboundMessage, ParseError> {
    let kind = topics
        .classify(topic)
        .ok_or_else(|| ParseError::UnknownTopic(topic.to_string()))?;
    let text = std::str::from_utf8(payload).map_err(|_| ParseError::InvalidUtf8)?;
    let value: Value = serde_json::from_str(text)?;

    let message = match kind {
        TopicKind::Relay => DeviceMessage::Relay(parse_relay(&value)?),
        TopicKind::Control => DeviceMessage::Control(serde_json::from_value(value)?),
        TopicKind::Status => DeviceMessage::Status(parse_status(&value)?),
        TopicKind::Telemetry => DeviceMessage::Telemetry { data: value },
        TopicKind::Ping => DeviceMessage::Ping,
    };

    Ok(InboundMessage {
        topic: topic.to_string(),
        payload: text.to_string(),
        received_at: OffsetDateTime::now_utc(),
        message,
    })
}

fn parse_relay(value: &Value) -> Result<RelayCommand, ParseError> {
    match value.get("device").and_then(Value::as_u64) {
        Some(d @ (0 | 1)) => Ok(RelayCommand { device: d as u8 }),
        _ => Err(ParseError::UnexpectedShape("relay command needs device: 0|1")),
    }
}

/// `irrigation: bool` wins over `device: 0|1`; anything else is ignored.
fn parse_status(value: &Value) -> Result<StatusUpdate, ParseError> {
    let obj = value
        .as_object()
        .ok_or(ParseError::UnexpectedShape("status must be a json object"))?;

    let from_irrigation = obj.get("irrigation").and_then(Value::as_bool);
    let from_device = obj.get("device").and_then(Value::as_u64).and_then(|d| match d {
        0 => Some(false),
        1 => Some(true),
        _ => None,
    });

    Ok(StatusUpdate {
        irrigating: from_irrigation.or(from_device),
    })
}

// ===========================================================================
// Tests
// ===========================================================================
