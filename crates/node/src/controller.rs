//! Relay state machine with the bridge's safety rules: a hard cap on
//! on-time, an optional shorter deadline from the hub's session
//! announcement, and a forced "off" whenever the link to the broker fails.

use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::command::{Command, StatusMsg, TelemetryMsg};
use crate::relay::Relay;

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

/// Simulated flow meter reading around the nominal rate.
pub(crate) fn sample_flow(nominal_lpm: f64) -> f64 {
    (nominal_lpm + nominal_lpm * 0.03 * approx_std_normal()).max(0.0)
}

pub(crate) struct Controller {
    relay: Relay,
    max_on: Duration,
    on_since: Option<Instant>,
    deadline: Option<Instant>,
    last_sample: Option<Instant>,
    delivered_liters: f64,
}

impl Controller {
    pub(crate) fn new(relay: Relay, max_on: Duration) -> Self {
        Self {
            relay,
            max_on,
            on_since: None,
            deadline: None,
            last_sample: None,
            delivered_liters: 0.0,
        }
    }

    pub(crate) fn is_on(&self) -> bool {
        self.relay.is_on()
    }

    /// Apply a hub command. Returns true when the relay changed state.
    pub(crate) fn handle(&mut self, cmd: Command, now: Instant) -> bool {
        match cmd {
            Command::Relay(true) => self.switch_on(now),
            Command::Relay(false) => self.switch_off("relay command"),
            Command::Session {
                irrigation: false, ..
            } => self.switch_off("session ended"),
            Command::Session {
                irrigation: true,
                duration_minutes,
            } => {
                let (Some(since), Some(minutes)) = (self.on_since, duration_minutes) else {
                    return false;
                };
                if !minutes.is_finite() || minutes <= 0.0 {
                    warn!(minutes, "controller: ignoring unusable session duration");
                    return false;
                }
                let planned = now + Duration::from_secs_f64(minutes * 60.0);
                let cap = since + self.max_on;
                self.deadline = Some(planned.min(cap));
                info!(minutes, "controller: session deadline armed");
                false
            }
        }
    }

    /// Switch off once the deadline passed. Returns true when it did.
    pub(crate) fn enforce_deadline(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                warn!("controller: on-time limit reached, forcing relay off");
                self.switch_off("deadline")
            }
            _ => false,
        }
    }

    /// Fail-safe used on broker errors and shutdown.
    pub(crate) fn force_off(&mut self, reason: &str) -> bool {
        self.switch_off(reason)
    }

    pub(crate) fn status(&self) -> StatusMsg {
        StatusMsg::new(self.relay.is_on())
    }

    /// One telemetry sample while irrigating; `None` when idle.
    pub(crate) fn telemetry(&mut self, now: Instant, flow_lpm: f64) -> Option<TelemetryMsg> {
        let since = self.on_since?;
        let last = self.last_sample.unwrap_or(since);
        let minutes = now.saturating_duration_since(last).as_secs_f64() / 60.0;
        self.delivered_liters += flow_lpm * minutes;
        self.last_sample = Some(now);
        Some(TelemetryMsg {
            flow_lpm,
            delivered_liters: self.delivered_liters,
            on_seconds: now.saturating_duration_since(since).as_secs(),
            timestamp: OffsetDateTime::now_utc(),
        })
    }

    fn switch_on(&mut self, now: Instant) -> bool {
        if !self.relay.set(true) {
            return false;
        }
        self.on_since = Some(now);
        self.deadline = Some(now + self.max_on);
        self.last_sample = None;
        self.delivered_liters = 0.0;
        true
    }

    fn switch_off(&mut self, reason: &str) -> bool {
        self.on_since = None;
        self.deadline = None;
        self.last_sample = None;
        let changed = self.relay.set(false);
        if changed {
            info!(reason, "controller: relay off");
        }
        changed
    }
}

// ===========================================================================
// Tests
// ===========================================================================
