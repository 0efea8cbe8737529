use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::{mpsc, RwLock};

use crate::connection::{ConnectionState, Diagnostics, Phase};
use crate::mqtt::{DeviceMessage, InboundMessage};
use crate::session::{SessionStatus, SessionView};
use crate::usage::IrrigationRecord;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type aliases
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;
pub type EventSender = mpsc::UnboundedSender<StateEvent>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// What observer callbacks push to the recorder task.
#[derive(Debug, Clone)]
pub enum StateEvent {
    Connection(ConnectionState),
    Message(InboundMessage),
    Session(SessionView),
    /// Latest closed session, as pushed by the usage aggregator.
    Usage(Option<IrrigationRecord>),
    Error(String),
    System(String),
}

pub struct SystemState {
    pub started_at: Instant,
    pub device: Option<DeviceReport>,
    pub last_telemetry: Option<Value>,
    pub events: VecDeque<SystemEvent>,
    brokers: Vec<String>,
    last_connection: Option<(Phase, usize)>,
    last_session: SessionStatus,
    last_record: Option<IrrigationRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceReport {
    pub irrigating: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub reported_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Connection,
    Session,
    Message,
    Usage,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

/// Values owned by the services rather than the event log.
pub struct LiveStatus {
    pub connection: Diagnostics,
    pub session: SessionView,
    pub last_record: Option<IrrigationRecord>,
    pub recent_messages: Vec<InboundMessage>,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub connection: Diagnostics,
    pub session: SessionView,
    pub device: Option<DeviceReport>,
    pub last_telemetry: Option<Value>,
    pub last_record: Option<IrrigationRecord>,
    pub recent_messages: Vec<InboundMessage>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    /// `brokers` is the endpoint table in failover order, used to name the
    /// broker in connection events.
    pub fn new(brokers: Vec<String>) -> Self {
        Self {
            started_at: Instant::now(),
            device: None,
            last_telemetry: None,
            events: VecDeque::with_capacity(MAX_EVENTS),
            brokers,
            last_connection: None,
            last_session: SessionStatus::Idle,
            last_record: None,
        }
    }

    pub fn apply(&mut self, event: StateEvent) {
        match event {
            StateEvent::Connection(st) => self.record_connection(&st),
            StateEvent::Message(msg) => self.record_message(&msg),
            StateEvent::Session(view) => self.record_session(&view),
            StateEvent::Usage(last) => self.record_usage(last),
            StateEvent::Error(detail) => self.record_error(detail),
            StateEvent::System(detail) => self.record_system(detail),
        }
    }

    fn broker_name(&self, index: usize) -> &str {
        self.brokers.get(index).map_or("?", String::as_str)
    }

    fn record_connection(&mut self, st: &ConnectionState) {
        let key = (st.phase, st.endpoint_index);
        if self.last_connection == Some(key) {
            return;
        }
        self.last_connection = Some(key);

        let broker = self.broker_name(st.endpoint_index).to_string();
        let error = st.last_error.as_deref().unwrap_or("no error reported");
        let (kind, detail) = match st.phase {
            Phase::Connecting => (EventKind::Connection, format!("connecting to {broker}")),
            Phase::Connected => (EventKind::Connection, format!("connected to {broker}")),
            Phase::Disconnected => (EventKind::Connection, format!("disconnected: {error}")),
            Phase::Failed => (
                EventKind::Error,
                format!(
                    "{broker} unreachable (attempt {}): {error}",
                    st.reconnect_attempts
                ),
            ),
        };
        self.push_event(kind, detail);
    }

    /// Record an inbound device message.
    fn record_message(&mut self, msg: &InboundMessage) {
        match &msg.message {
            DeviceMessage::Status(update) => {
                let Some(irrigating) = update.irrigating else {
                    return;
                };
                let changed = self.device.as_ref().map(|d| d.irrigating) != Some(irrigating);
                self.device = Some(DeviceReport {
                    irrigating,
                    reported_at: msg.received_at,
                });
                if changed {
                    let state_str = if irrigating { "ON" } else { "OFF" };
                    self.push_event(EventKind::Message, format!("device reports {state_str}"));
                }
            }
            DeviceMessage::Telemetry { data } => {
                self.last_telemetry = Some(data.clone());
            }
            DeviceMessage::Relay(_) | DeviceMessage::Control(_) => {
                self.push_event(
                    EventKind::Message,
                    format!("{}: {}", msg.topic, msg.payload),
                );
            }
            DeviceMessage::Ping => {}
        }
    }

    fn record_session(&mut self, view: &SessionView) {
        let previous = std::mem::replace(&mut self.last_session, view.status);
        if previous == view.status {
            return;
        }
        match (view.status, &view.session) {
            (SessionStatus::Active, Some(s)) => {
                let planned = s
                    .planned_duration_minutes
                    .map_or_else(|| "open-ended".to_string(), |d| format!("{d:.1} min"));
                self.push_event(
                    EventKind::Session,
                    format!("{} session '{}' started ({planned})", s.kind, s.source_label),
                );
            }
            (SessionStatus::Idle, _) if previous == SessionStatus::Stopping => {
                self.push_event(EventKind::Session, "session ended".to_string());
            }
            (SessionStatus::Idle, _) if previous == SessionStatus::Starting => {
                self.push_event(EventKind::Error, "session start aborted".to_string());
            }
            _ => {}
        }
    }

    fn record_usage(&mut self, last: Option<IrrigationRecord>) {
        if last.is_none() || last == self.last_record {
            return;
        }
        self.last_record = last;
        if let Some(r) = &self.last_record {
            self.push_event(
                EventKind::Usage,
                format!(
                    "{} irrigation recorded: {:.1} min, {:.3} m³",
                    r.kind, r.duration_minutes, r.volume_m3
                ),
            );
        }
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot, newest event first.
    pub fn to_status(&self, live: LiveStatus) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            connection: live.connection,
            session: live.session,
            device: self.device.clone(),
            last_telemetry: self.last_telemetry.clone(),
            last_record: live.last_record,
            recent_messages: live.recent_messages,
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

// ---------------------------------------------------------------------------
// Recorder task
// ---------------------------------------------------------------------------

/// Spawn the task that folds [`StateEvent`]s into `state`. Observer
/// callbacks are synchronous, so they push into the returned sender.
pub fn spawn_recorder(state: SharedState) -> EventSender {
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            state.write().await.apply(event);
        }
    });
    tx
}

// ===========================================================================
// Tests
// ===========================================================================
