//! Topic names and payloads the bridge exchanges with the hub.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

pub(crate) struct Topics {
    pub relay: String,
    pub control: String,
    pub status: String,
    pub logs: String,
}

impl Topics {
    pub(crate) fn new(device_id: &str) -> Self {
        Self {
            relay: format!("data/{device_id}/swr"),
            control: format!("irrigation/{device_id}/control"),
            status: format!("data/{device_id}/status"),
            logs: format!("data/{device_id}/logs"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Command {
    /// Switch the relay.
    Relay(bool),
    /// Session announcement from the hub.
    Session {
        irrigation: bool,
        duration_minutes: Option<f64>,
    },
}

impl Command {
    /// True for commands that would start irrigation.
    pub(crate) fn starts_irrigation(&self) -> bool {
        matches!(
            self,
            Self::Relay(true) | Self::Session {
                irrigation: true,
                ..
            }
        )
    }

    /// A retained start is a replay of a state the hub may since have left.
    pub(crate) fn is_stale_replay(&self, retained: bool) -> bool {
        retained && self.starts_irrigation()
    }
}

#[derive(Deserialize)]
struct ControlMsg {
    irrigation: bool,
    #[serde(default)]
    duration_minutes: Option<f64>,
}

/// Retained on the status topic.
#[derive(Debug, Serialize)]
pub(crate) struct StatusMsg {
    pub irrigation: bool,
    pub device: u8,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl StatusMsg {
    pub(crate) fn new(on: bool) -> Self {
        Self {
            irrigation: on,
            device: u8::from(on),
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct TelemetryMsg {
    pub flow_lpm: f64,
    pub delivered_liters: f64,
    pub on_seconds: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

pub(crate) fn parse_command(topics: &Topics, topic: &str, payload: &[u8]) -> Result<Command> {
    if topic == topics.relay {
        parse_relay(payload).map(Command::Relay)
    } else if topic == topics.control {
        let msg: ControlMsg =
            serde_json::from_slice(payload).context("invalid control payload")?;
        Ok(Command::Session {
            irrigation: msg.irrigation,
            duration_minutes: msg.duration_minutes,
        })
    } else {
        bail!("unhandled topic '{topic}'")
    }
}

/// `{"device":1}` / `{"device":0}`; bare `ON`/`OFF`/`1`/`0` also accepted.
fn parse_relay(payload: &[u8]) -> Result<bool> {
    let text = String::from_utf8_lossy(payload);
    if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(&text) {
        return match obj.get("device").and_then(Value::as_u64) {
            Some(1) => Ok(true),
            Some(0) => Ok(false),
            _ => bail!("relay command needs device: 0|1, got {text}"),
        };
    }
    match text.trim().to_uppercase().as_str() {
        "ON" | "1" => Ok(true),
        "OFF" | "0" => Ok(false),
        s => bail!("unknown relay command '{s}'"),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
