//! Session coordinator: at most one irrigation session at a time.
//!
//! ## Session state machine
//!
//! ```text
//! Idle ──[start, publish ok]──▶ Starting ──▶ Active ──[stop | timer | device off]──▶ Stopping ──▶ Idle
//!                                  │                                                      ▲
//!                                  ├──[stop queued while starting, on accepted]───────────┘
//!                                  └──[publish failed]──▶ Idle
//! ```
//!
//! Every transition happens under one lock and never across an await, so two
//! concurrent `start` calls cannot both leave `Idle`, and a manual stop racing
//! the auto-stop timer produces a single record.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::mqtt::DeviceState;
use crate::observer::{Observers, Subscription};
use crate::publisher::ControlChannel;
use crate::timer::{CancelToken, Scheduler};
use crate::usage::{IrrigationRecord, Provisional, SessionKind, UsageAggregator};

/// Device status reports arriving this soon after a local start or stop are
/// treated as stale echoes.
const DEVICE_SYNC_GRACE: Duration = Duration::from_secs(5);

const DEVICE_LABEL: &str = "device";

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub stop_attempts: u32,
    pub stop_retry_delay: Duration,
    pub stop_cooldown: Duration,
    pub confirm_timeout: Duration,
    pub max_duration_minutes: f64,
    pub flow_rate_lpm: f64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            stop_attempts: 2,
            stop_retry_delay: Duration::from_millis(500),
            stop_cooldown: Duration::from_secs(1),
            confirm_timeout: Duration::from_secs(5),
            max_duration_minutes: 180.0,
            flow_rate_lpm: 15.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IrrigationSession {
    pub id: Uuid,
    pub kind: SessionKind,
    pub source_label: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub planned_duration_minutes: Option<f64>,
    pub predicted_volume_m3: Option<f64>,
    #[serde(skip)]
    started_mono: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Starting,
    Active,
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StopReason {
    Manual,
    Timer,
    Device,
    Shutdown,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Manual => write!(f, "manual"),
            Self::Timer => write!(f, "timer"),
            Self::Device => write!(f, "device"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartCheck {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    Started(Uuid),
    Conflict(String),
    /// The "on" command was not accepted; no session exists.
    PublishFailed,
    InvalidDuration(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    Stopped,
    /// Another stop is running or just finished.
    Coalesced,
    /// The session is still starting; it stops as soon as "on" is settled.
    Queued,
    NotActive,
}

#[derive(Debug, Clone, Serialize)]
pub struct StopReport {
    pub outcome: StopOutcome,
    /// The broker client accepted "off".
    pub mqtt_success: bool,
    /// The device reported "off" afterwards, or was the one reporting it.
    pub device_confirmed: bool,
    /// The usage aggregator stored the record.
    pub backend_success: bool,
    pub record: Option<IrrigationRecord>,
}

impl StopReport {
    fn skipped(outcome: StopOutcome) -> Self {
        Self {
            outcome,
            mqtt_success: false,
            device_confirmed: false,
            backend_success: false,
            record: None,
        }
    }
}

/// What observers and the status endpoint see.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub status: SessionStatus,
    pub session: Option<IrrigationSession>,
    pub elapsed_minutes: Option<f64>,
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

enum SessionPhase {
    Idle,
    Starting {
        session: IrrigationSession,
        stop_requested: Option<StopReason>,
    },
    Active {
        session: IrrigationSession,
        timer: Option<CancelToken>,
    },
    Stopping(IrrigationSession),
}

impl SessionPhase {
    fn status(&self) -> SessionStatus {
        match self {
            Self::Idle => SessionStatus::Idle,
            Self::Starting { .. } => SessionStatus::Starting,
            Self::Active { .. } => SessionStatus::Active,
            Self::Stopping(_) => SessionStatus::Stopping,
        }
    }

    fn session(&self) -> Option<&IrrigationSession> {
        match self {
            Self::Idle => None,
            Self::Stopping(s) => Some(s),
            Self::Starting { session, .. } | Self::Active { session, .. } => Some(session),
        }
    }
}

struct Machine {
    phase: SessionPhase,
    cooldown_until: Option<Instant>,
    last_transition: Option<Instant>,
}

struct Inner {
    control: Arc<dyn ControlChannel>,
    scheduler: Arc<dyn Scheduler>,
    usage: Arc<UsageAggregator>,
    settings: SessionSettings,
    machine: Mutex<Machine>,
    observers: Observers<SessionView>,
}

#[derive(Clone)]
pub struct SessionCoordinator {
    inner: Arc<Inner>,
}

impl SessionCoordinator {
    pub fn new(
        control: Arc<dyn ControlChannel>,
        scheduler: Arc<dyn Scheduler>,
        usage: Arc<UsageAggregator>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                control,
                scheduler,
                usage,
                settings,
                machine: Mutex::new(Machine {
                    phase: SessionPhase::Idle,
                    cooldown_until: None,
                    last_transition: None,
                }),
                observers: Observers::new(),
            }),
        }
    }

    pub fn subscribe<F>(&self, f: F) -> Subscription
    where
        F: Fn(&SessionView) + Send + Sync + 'static,
    {
        self.inner.observers.subscribe(f)
    }

    pub fn view(&self) -> SessionView {
        let now = self.inner.scheduler.now();
        let m = self.inner.machine.lock();
        let session = m.phase.session().cloned();
        SessionView {
            status: m.phase.status(),
            elapsed_minutes: session.as_ref().map(|s| elapsed_minutes(s, now)),
            session,
        }
    }

    fn notify(&self) {
        let view = self.view();
        self.inner.observers.notify(&view);
    }

    // -- can_start --------------------------------------------------------

    /// Consulted synchronously before any side-effecting publish.
    pub fn can_start(&self, kind: SessionKind) -> StartCheck {
        let now = self.inner.scheduler.now();
        let m = self.inner.machine.lock();
        match m.phase.session() {
            None => StartCheck {
                allowed: true,
                reason: None,
            },
            Some(current) => StartCheck {
                allowed: false,
                reason: Some(conflict_reason(kind, &m.phase, current, now)),
            },
        }
    }

    // -- start ------------------------------------------------------------

    pub async fn start(
        &self,
        kind: SessionKind,
        source_label: &str,
        duration_minutes: Option<f64>,
        predicted_volume_m3: Option<f64>,
    ) -> StartOutcome {
        if let Some(d) = duration_minutes {
            let max = self.inner.settings.max_duration_minutes;
            if !d.is_finite() || d <= 0.0 || d > max {
                return StartOutcome::InvalidDuration(format!(
                    "duration must be between 0 and {max} minutes, got {d}"
                ));
            }
        }

        let now = self.inner.scheduler.now();
        let session = {
            let mut m = self.inner.machine.lock();
            if let Some(current) = m.phase.session() {
                let reason = conflict_reason(kind, &m.phase, current, now);
                debug!(%kind, reason = %reason, "session: start refused");
                return StartOutcome::Conflict(reason);
            }
            let session = IrrigationSession {
                id: Uuid::new_v4(),
                kind,
                source_label: source_label.to_string(),
                started_at: OffsetDateTime::now_utc(),
                planned_duration_minutes: duration_minutes,
                predicted_volume_m3,
                started_mono: now,
            };
            m.phase = SessionPhase::Starting {
                session: session.clone(),
                stop_requested: None,
            };
            session
        };
        self.notify();

        if !self.inner.control.send_control(DeviceState::On).await {
            {
                let mut m = self.inner.machine.lock();
                if matches!(&m.phase, SessionPhase::Starting { session: s, .. } if s.id == session.id) {
                    m.phase = SessionPhase::Idle;
                }
            }
            self.notify();
            warn!(session = %session.id, %kind, "session: start aborted, on command not accepted");
            return StartOutcome::PublishFailed;
        }

        let queued_stop = {
            let mut m = self.inner.machine.lock();
            let stop_requested = match &m.phase {
                SessionPhase::Starting { session: s, stop_requested } if s.id == session.id => {
                    *stop_requested
                }
                _ => {
                    return StartOutcome::Conflict(
                        "session was replaced while starting".to_string(),
                    )
                }
            };
            m.last_transition = Some(self.inner.scheduler.now());
            match stop_requested {
                Some(reason) => {
                    m.phase = SessionPhase::Stopping(session.clone());
                    Some(reason)
                }
                None => {
                    let timer = duration_minutes.map(|d| self.arm_timer(session.id, d));
                    m.phase = SessionPhase::Active {
                        session: session.clone(),
                        timer,
                    };
                    None
                }
            }
        };

        if let Some(reason) = queued_stop {
            info!(session = %session.id, %reason, "session: stop requested while starting");
            self.notify();
            self.finish_stop(session.clone(), reason).await;
            return StartOutcome::Started(session.id);
        }

        self.inner.usage.set_provisional(Some(Provisional {
            kind,
            source_label: session.source_label.clone(),
            started_at: session.started_at,
            volume_per_minute: self.volume_per_minute(&session),
            volume_cap: predicted_volume_m3,
        }));
        self.notify();
        info!(
            session = %session.id,
            %kind,
            label = %session.source_label,
            ?duration_minutes,
            "session: started"
        );

        if !self.inner.control.announce(true, duration_minutes).await {
            debug!(session = %session.id, "session: start announce not accepted");
        }
        StartOutcome::Started(session.id)
    }

    fn arm_timer(&self, id: Uuid, minutes: f64) -> CancelToken {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let delay = Duration::from_secs_f64(minutes * 60.0);
        self.inner.scheduler.after(
            delay,
            Box::pin(async move {
                if let Some(inner) = weak.upgrade() {
                    SessionCoordinator { inner }
                        .stop_session(Some(id), StopReason::Timer)
                        .await;
                }
            }),
        )
    }

    // -- stop -------------------------------------------------------------

    /// Stop the active session. Duplicate calls are coalesced into the one
    /// already running.
    pub async fn stop(&self, reason: StopReason) -> StopReport {
        self.stop_session(None, reason).await
    }

    /// `expected` pins the stop to one session so a stale timer cannot end
    /// a newer one.
    async fn stop_session(&self, expected: Option<Uuid>, reason: StopReason) -> StopReport {
        let now = self.inner.scheduler.now();
        let taken = {
            let mut m = self.inner.machine.lock();
            let cooling = m.cooldown_until.is_some_and(|until| now < until);
            match std::mem::replace(&mut m.phase, SessionPhase::Idle) {
                SessionPhase::Active { session, timer }
                    if expected.map_or(true, |id| id == session.id) =>
                {
                    m.phase = SessionPhase::Stopping(session.clone());
                    Ok((session, timer))
                }
                SessionPhase::Stopping(s) => {
                    m.phase = SessionPhase::Stopping(s);
                    Err(StopOutcome::Coalesced)
                }
                SessionPhase::Starting {
                    session,
                    stop_requested,
                } if expected.is_none() => {
                    let outcome = if stop_requested.is_some() {
                        StopOutcome::Coalesced
                    } else {
                        StopOutcome::Queued
                    };
                    m.phase = SessionPhase::Starting {
                        session,
                        stop_requested: stop_requested.or(Some(reason)),
                    };
                    Err(outcome)
                }
                other => {
                    m.phase = other;
                    Err(if cooling && expected.is_none() {
                        StopOutcome::Coalesced
                    } else {
                        StopOutcome::NotActive
                    })
                }
            }
        };

        let (session, timer) = match taken {
            Ok(t) => t,
            Err(outcome) => {
                debug!(%reason, ?outcome, "session: stop skipped");
                return StopReport::skipped(outcome);
            }
        };
        if let Some(timer) = timer {
            timer.cancel();
        }
        self.notify();
        self.finish_stop(session, reason).await
    }

    /// Switch off, record usage and return to `Idle`. The phase is already
    /// `Stopping`.
    async fn finish_stop(&self, session: IrrigationSession, reason: StopReason) -> StopReport {
        info!(session = %session.id, %reason, "session: stopping");

        // Always publish "off", even when the device reported it: the
        // retained relay value must not stay "on".
        let mqtt_success = self.send_off().await;
        if mqtt_success && !self.inner.control.announce(false, None).await {
            debug!(session = %session.id, "session: stop announce not accepted");
        }
        let device_confirmed = match reason {
            StopReason::Device => true,
            _ if mqtt_success => {
                self.inner
                    .control
                    .confirm(DeviceState::Off, self.inner.settings.confirm_timeout)
                    .await
            }
            _ => false,
        };

        let finished = self.inner.scheduler.now();
        let record = self.to_record(&session, finished);
        self.inner.usage.set_provisional(None);
        let backend_success = self.inner.usage.add_record(record.clone());

        {
            let mut m = self.inner.machine.lock();
            m.phase = SessionPhase::Idle;
            m.cooldown_until = Some(finished + self.inner.settings.stop_cooldown);
            m.last_transition = Some(finished);
        }
        self.notify();

        if !mqtt_success {
            warn!(
                session = %session.id,
                attempts = self.inner.settings.stop_attempts,
                "session: off command not accepted, check the device manually"
            );
        } else if !device_confirmed {
            warn!(
                session = %session.id,
                timeout = ?self.inner.settings.confirm_timeout,
                "session: device did not confirm off, check the device manually"
            );
        } else {
            info!(
                session = %session.id,
                duration_minutes = record.duration_minutes,
                volume_m3 = record.volume_m3,
                "session: stopped"
            );
        }

        StopReport {
            outcome: StopOutcome::Stopped,
            mqtt_success,
            device_confirmed,
            backend_success,
            record: Some(record),
        }
    }

    async fn send_off(&self) -> bool {
        let attempts = self.inner.settings.stop_attempts.max(1);
        for attempt in 1..=attempts {
            if self.inner.control.send_control(DeviceState::Off).await {
                return true;
            }
            warn!(attempt, attempts, "session: off command not accepted");
            if attempt < attempts {
                tokio::time::sleep(self.inner.settings.stop_retry_delay).await;
            }
        }
        false
    }

    fn volume_per_minute(&self, session: &IrrigationSession) -> f64 {
        match (session.predicted_volume_m3, session.planned_duration_minutes) {
            (Some(volume), Some(planned)) if planned > 0.0 => volume / planned,
            _ => self.inner.settings.flow_rate_lpm / 1000.0,
        }
    }

    fn to_record(&self, session: &IrrigationSession, now: Instant) -> IrrigationRecord {
        let duration_minutes = elapsed_minutes(session, now);
        let mut volume_m3 = duration_minutes * self.volume_per_minute(session);
        if let Some(predicted) = session.predicted_volume_m3 {
            volume_m3 = volume_m3.min(predicted);
        }
        IrrigationRecord {
            timestamp: session.started_at,
            duration_minutes,
            volume_m3,
            kind: session.kind,
            source_label: session.source_label.clone(),
        }
    }

    // -- device status ----------------------------------------------------

    /// Reconcile with a status report pushed by the device bridge.
    pub async fn sync_with_device(&self, irrigating: bool) {
        let now = self.inner.scheduler.now();
        let (status, recent) = {
            let m = self.inner.machine.lock();
            let recent = m
                .last_transition
                .is_some_and(|at| now.saturating_duration_since(at) < DEVICE_SYNC_GRACE);
            (m.phase.status(), recent)
        };
        if recent {
            debug!(irrigating, "session: device report within grace period ignored");
            return;
        }

        match (irrigating, status) {
            (true, SessionStatus::Idle) => self.adopt_external(now),
            (false, SessionStatus::Active) => {
                info!("session: device reports irrigation off");
                self.stop_session(None, StopReason::Device).await;
            }
            _ => {}
        }
    }

    /// The relay was switched on outside the dashboard.
    fn adopt_external(&self, now: Instant) {
        let session = {
            let mut m = self.inner.machine.lock();
            if !matches!(m.phase, SessionPhase::Idle) {
                return;
            }
            let session = IrrigationSession {
                id: Uuid::new_v4(),
                kind: SessionKind::Manual,
                source_label: DEVICE_LABEL.to_string(),
                started_at: OffsetDateTime::now_utc(),
                planned_duration_minutes: None,
                predicted_volume_m3: None,
                started_mono: now,
            };
            m.phase = SessionPhase::Active {
                session: session.clone(),
                timer: None,
            };
            m.last_transition = Some(now);
            session
        };

        self.inner.usage.set_provisional(Some(Provisional {
            kind: session.kind,
            source_label: session.source_label.clone(),
            started_at: session.started_at,
            volume_per_minute: self.volume_per_minute(&session),
            volume_cap: None,
        }));
        self.notify();
        info!(session = %session.id, "session: adopted irrigation started on the device");
    }
}

fn elapsed_minutes(session: &IrrigationSession, now: Instant) -> f64 {
    now.saturating_duration_since(session.started_mono).as_secs_f64() / 60.0
}

fn conflict_reason(
    wanted: SessionKind,
    phase: &SessionPhase,
    current: &IrrigationSession,
    now: Instant,
) -> String {
    let state = match phase.status() {
        SessionStatus::Starting => "is starting",
        SessionStatus::Stopping => "is stopping",
        _ => "is active",
    };
    format!(
        "cannot start {wanted} irrigation: a {} session ({}) {state}, running for {:.1} min",
        current.kind,
        current.source_label,
        elapsed_minutes(current, now)
    )
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::fake::FakeControl;
    use crate::timer::ManualScheduler;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use time::UtcOffset;

    struct Harness {
        coordinator: SessionCoordinator,
        control: Arc<FakeControl>,
        scheduler: Arc<ManualScheduler>,
        usage: Arc<UsageAggregator>,
    }

    fn harness() -> Harness {
        let control = Arc::new(FakeControl::default());
        let scheduler = Arc::new(ManualScheduler::new());
        let usage = Arc::new(UsageAggregator::new(1_000, UtcOffset::UTC));
        let coordinator = SessionCoordinator::new(
            control.clone(),
            scheduler.clone(),
            usage.clone(),
            SessionSettings::default(),
        );
        Harness {
            coordinator,
            control,
            scheduler,
            usage,
        }
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    // -- can_start --------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn manual_session_blocks_ml_start() {
        let h = harness();
        let out = h
            .coordinator
            .start(SessionKind::Manual, "dashboard", Some(30.0), None)
            .await;
        assert!(matches!(out, StartOutcome::Started(_)));

        let check = h.coordinator.can_start(SessionKind::Ml);
        assert!(!check.allowed);
        assert!(check.reason.unwrap().contains("manual"));
    }

    #[tokio::test(start_paused = true)]
    async fn ml_session_blocks_manual_start() {
        let h = harness();
        h.coordinator
            .start(SessionKind::Ml, "ML_Auto", Some(12.0), Some(0.2))
            .await;

        let check = h.coordinator.can_start(SessionKind::Manual);
        assert!(!check.allowed);
        assert!(check.reason.as_deref().unwrap().contains("ml session"));

        let out = h
            .coordinator
            .start(SessionKind::Manual, "dashboard", None, None)
            .await;
        assert!(matches!(out, StartOutcome::Conflict(_)));
        assert_eq!(h.control.sent(), vec![DeviceState::On]);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_allows_either_kind() {
        let h = harness();
        assert!(h.coordinator.can_start(SessionKind::Manual).allowed);
        assert!(h.coordinator.can_start(SessionKind::Ml).allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn racing_starts_yield_one_session() {
        let h = harness();
        let (a, b) = tokio::join!(
            h.coordinator.start(SessionKind::Manual, "dashboard", Some(5.0), None),
            h.coordinator.start(SessionKind::Ml, "ML_Auto", Some(5.0), None),
        );
        assert!(matches!(a, StartOutcome::Started(_)));
        assert!(matches!(b, StartOutcome::Conflict(_)));
        assert_eq!(h.control.sent(), vec![DeviceState::On]);
        assert_eq!(h.scheduler.armed(), 1);
    }

    // -- start ------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn publish_failure_creates_no_session() {
        let h = harness();
        h.control.reject_on.store(true, Ordering::SeqCst);

        let out = h
            .coordinator
            .start(SessionKind::Manual, "dashboard", Some(10.0), None)
            .await;
        assert_eq!(out, StartOutcome::PublishFailed);
        assert_eq!(h.coordinator.view().status, SessionStatus::Idle);
        assert_eq!(h.scheduler.armed(), 0);
        assert!(h.coordinator.can_start(SessionKind::Ml).allowed);
        assert!(h.control.announced.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_durations_rejected() {
        let h = harness();
        for d in [0.0, -5.0, f64::NAN, f64::INFINITY, 500.0] {
            let out = h
                .coordinator
                .start(SessionKind::Manual, "dashboard", Some(d), None)
                .await;
            assert!(matches!(out, StartOutcome::InvalidDuration(_)), "duration {d}");
        }
        assert!(h.control.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn start_without_duration_arms_no_timer() {
        let h = harness();
        h.coordinator
            .start(SessionKind::Manual, "dashboard", None, None)
            .await;
        assert_eq!(h.scheduler.armed(), 0);
        assert_eq!(h.coordinator.view().status, SessionStatus::Active);
        assert_eq!(*h.control.announced.lock(), vec![(true, None)]);
    }

    // -- auto-stop --------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn timer_stops_exactly_once() {
        let h = harness();
        h.coordinator
            .start(SessionKind::Manual, "dashboard", Some(1.0), None)
            .await;

        assert_eq!(h.scheduler.advance(Duration::from_millis(59_999)).await, 0);
        assert_eq!(h.scheduler.advance(Duration::from_millis(1)).await, 1);
        assert_eq!(h.scheduler.advance(Duration::from_secs(600)).await, 0);

        assert_eq!(h.usage.record_count(), 1);
        assert_eq!(h.control.sent(), vec![DeviceState::On, DeviceState::Off]);
        let record = h.usage.last_record().unwrap();
        assert!(approx(record.duration_minutes, 1.0));
        assert_eq!(h.coordinator.view().status, SessionStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_stop_cancels_timer() {
        let h = harness();
        h.coordinator
            .start(SessionKind::Ml, "ML_Auto", Some(1.0), None)
            .await;
        assert_eq!(h.scheduler.armed(), 1);

        let report = h.coordinator.stop(StopReason::Manual).await;
        assert_eq!(report.outcome, StopOutcome::Stopped);
        assert_eq!(h.scheduler.armed(), 0);
        assert_eq!(h.scheduler.advance(Duration::from_secs(120)).await, 0);
        assert_eq!(h.usage.record_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_timer_cannot_stop_newer_session() {
        let h = harness();
        h.coordinator
            .start(SessionKind::Manual, "dashboard", None, None)
            .await;

        let report = h
            .coordinator
            .stop_session(Some(Uuid::new_v4()), StopReason::Timer)
            .await;
        assert_eq!(report.outcome, StopOutcome::NotActive);
        assert_eq!(h.coordinator.view().status, SessionStatus::Active);
    }

    // -- stop -------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn double_stop_yields_one_record() {
        let h = harness();
        h.coordinator
            .start(SessionKind::Manual, "dashboard", Some(30.0), None)
            .await;

        let (a, b) = tokio::join!(
            h.coordinator.stop(StopReason::Manual),
            h.coordinator.stop(StopReason::Manual),
        );
        assert_eq!(a.outcome, StopOutcome::Stopped);
        assert_eq!(b.outcome, StopOutcome::Coalesced);
        assert_eq!(h.usage.record_count(), 1);

        // A click inside the cool-down is absorbed too.
        let c = h.coordinator.stop(StopReason::Manual).await;
        assert_eq!(c.outcome, StopOutcome::Coalesced);
        assert_eq!(h.usage.record_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_after_cooldown_reports_not_active() {
        let h = harness();
        h.coordinator
            .start(SessionKind::Manual, "dashboard", None, None)
            .await;
        h.coordinator.stop(StopReason::Manual).await;
        h.scheduler.advance(Duration::from_secs(2)).await;

        let report = h.coordinator.stop(StopReason::Manual).await;
        assert_eq!(report.outcome, StopOutcome::NotActive);
        assert!(!report.mqtt_success);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_while_idle_is_not_active() {
        let h = harness();
        let report = h.coordinator.stop(StopReason::Manual).await;
        assert_eq!(report.outcome, StopOutcome::NotActive);
        assert!(report.record.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_retries_off_once() {
        let h = harness();
        h.coordinator
            .start(SessionKind::Manual, "dashboard", None, None)
            .await;
        h.control.reject_off.store(1, Ordering::SeqCst);

        let report = h.coordinator.stop(StopReason::Manual).await;
        assert!(report.mqtt_success);
        assert!(report.device_confirmed);
        assert!(report.backend_success);
        assert_eq!(
            h.control.sent(),
            vec![DeviceState::On, DeviceState::Off, DeviceState::Off]
        );
        assert_eq!(*h.control.confirm_waits.lock(), vec![DeviceState::Off]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_stop_still_tears_down() {
        let h = harness();
        h.coordinator
            .start(SessionKind::Manual, "dashboard", Some(20.0), None)
            .await;
        h.control.reject_off.store(10, Ordering::SeqCst);

        let report = h.coordinator.stop(StopReason::Manual).await;
        assert_eq!(report.outcome, StopOutcome::Stopped);
        assert!(!report.mqtt_success);
        assert!(!report.device_confirmed);
        assert!(report.backend_success);
        assert_eq!(h.coordinator.view().status, SessionStatus::Idle);
        assert_eq!(h.usage.record_count(), 1);
        assert_eq!(h.scheduler.armed(), 0);
        // Two attempts, no more.
        assert_eq!(h.control.sent().len(), 3);
        assert!(h.control.confirm_waits.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_device_reported_unconfirmed() {
        let h = harness();
        h.coordinator
            .start(SessionKind::Manual, "dashboard", None, None)
            .await;
        h.control.silent.store(true, Ordering::SeqCst);

        let started = Instant::now();
        let report = h.coordinator.stop(StopReason::Manual).await;
        assert_eq!(report.outcome, StopOutcome::Stopped);
        assert!(report.mqtt_success);
        assert!(!report.device_confirmed);
        assert!(started.elapsed() >= SessionSettings::default().confirm_timeout);
        assert_eq!(h.coordinator.view().status, SessionStatus::Idle);
        assert_eq!(h.usage.record_count(), 1);
    }

    // -- stop while starting ----------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn stop_during_start_is_honoured() {
        let h = harness();
        let (start, stop) = tokio::join!(
            h.coordinator.start(SessionKind::Manual, "dashboard", None, None),
            h.coordinator.stop(StopReason::Manual),
        );
        assert!(matches!(start, StartOutcome::Started(_)));
        assert_eq!(stop.outcome, StopOutcome::Queued);

        assert_eq!(h.coordinator.view().status, SessionStatus::Idle);
        assert_eq!(h.control.sent(), vec![DeviceState::On, DeviceState::Off]);
        assert_eq!(h.usage.record_count(), 1);
        assert_eq!(h.scheduler.armed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_stops_during_start_queue_once() {
        let h = harness();
        let (_, first, second) = tokio::join!(
            h.coordinator.start(SessionKind::Ml, "ML_Auto", Some(30.0), Some(0.5)),
            h.coordinator.stop(StopReason::Manual),
            h.coordinator.stop(StopReason::Manual),
        );
        assert_eq!(first.outcome, StopOutcome::Queued);
        assert_eq!(second.outcome, StopOutcome::Coalesced);

        assert_eq!(h.control.sent(), vec![DeviceState::On, DeviceState::Off]);
        assert_eq!(h.usage.record_count(), 1);
        assert_eq!(h.scheduler.armed(), 0);
        assert!(h.usage.snapshot(crate::usage::Granularity::Daily, OffsetDateTime::now_utc())
            .in_progress
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn queued_stop_dropped_when_on_rejected() {
        let h = harness();
        h.control.reject_on.store(true, Ordering::SeqCst);
        let (start, stop) = tokio::join!(
            h.coordinator.start(SessionKind::Manual, "dashboard", None, None),
            h.coordinator.stop(StopReason::Manual),
        );
        assert_eq!(start, StartOutcome::PublishFailed);
        assert_eq!(stop.outcome, StopOutcome::Queued);
        assert_eq!(h.control.sent(), vec![DeviceState::On]);
        assert_eq!(h.usage.record_count(), 0);
    }

    // -- records ----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn record_uses_elapsed_time_and_flow_rate() {
        let h = harness();
        h.coordinator
            .start(SessionKind::Manual, "dashboard", Some(30.0), None)
            .await;
        h.scheduler.advance(Duration::from_secs(10 * 60)).await;

        let report = h.coordinator.stop(StopReason::Manual).await;
        let record = report.record.unwrap();
        assert!(approx(record.duration_minutes, 10.0));
        assert!(approx(record.volume_m3, 0.15));
        assert_eq!(record.kind, SessionKind::Manual);
        assert_eq!(record.source_label, "dashboard");
        assert!(h.usage.snapshot(crate::usage::Granularity::Daily, OffsetDateTime::now_utc())
            .in_progress
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn predicted_volume_prorated() {
        let h = harness();
        h.coordinator
            .start(SessionKind::Ml, "ML_Auto", Some(20.0), Some(0.4))
            .await;
        h.scheduler.advance(Duration::from_secs(10 * 60)).await;

        let record = h.coordinator.stop(StopReason::Manual).await.record.unwrap();
        assert!(approx(record.volume_m3, 0.2));
        assert_eq!(record.kind, SessionKind::Ml);
    }

    #[tokio::test(start_paused = true)]
    async fn live_session_reported_as_provisional() {
        let h = harness();
        h.coordinator
            .start(SessionKind::Ml, "ML_Auto", Some(20.0), Some(0.4))
            .await;

        let snap = h
            .usage
            .snapshot(crate::usage::Granularity::Daily, OffsetDateTime::now_utc());
        let live = snap.in_progress.unwrap();
        assert_eq!(live.kind, SessionKind::Ml);
        assert_eq!(live.source_label, "ML_Auto");
    }

    // -- device sync ------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn device_on_adopts_external_session() {
        let h = harness();
        h.coordinator.sync_with_device(true).await;

        let view = h.coordinator.view();
        assert_eq!(view.status, SessionStatus::Active);
        let session = view.session.unwrap();
        assert_eq!(session.source_label, "device");
        assert_eq!(session.kind, SessionKind::Manual);
        assert!(h.control.sent().is_empty());
        assert!(!h.coordinator.can_start(SessionKind::Ml).allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn device_off_closes_session_and_clears_relay() {
        let h = harness();
        h.coordinator
            .start(SessionKind::Manual, "dashboard", Some(30.0), None)
            .await;
        h.scheduler.advance(Duration::from_secs(60)).await;

        h.coordinator.sync_with_device(false).await;
        assert_eq!(h.coordinator.view().status, SessionStatus::Idle);
        assert_eq!(h.control.sent(), vec![DeviceState::On, DeviceState::Off]);
        // The device itself reported off; nothing to wait for.
        assert!(h.control.confirm_waits.lock().is_empty());
        assert_eq!(h.usage.record_count(), 1);
        assert_eq!(h.scheduler.armed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn device_off_leaves_no_retained_start_on_broker() {
        use crate::connection::{ConnectionManager, ConnectionSettings};
        use crate::endpoint::BrokerEndpoint;
        use crate::mqtt::Topics;
        use crate::publisher::CommandPublisher;
        use crate::transport::scripted::{Attempt, ScriptedConnector};
        use crate::transport::Connector;

        let connector = ScriptedConnector::new([Attempt::Succeed]);
        let topics = Topics::new("PulsarInfinite");
        let dyn_connector: Arc<dyn Connector> = connector.clone();
        let connection = ConnectionManager::new(
            vec![BrokerEndpoint::parse("mqtt://localhost").unwrap()],
            topics.clone(),
            ConnectionSettings {
                auto_reconnect: false,
                ..ConnectionSettings::default()
            },
            dyn_connector,
        );
        connection.connect().await;

        let scheduler = Arc::new(ManualScheduler::new());
        let usage = Arc::new(UsageAggregator::new(1_000, UtcOffset::UTC));
        let coordinator = SessionCoordinator::new(
            Arc::new(CommandPublisher::new(connection, topics, true)),
            scheduler.clone(),
            usage.clone(),
            SessionSettings::default(),
        );

        coordinator
            .start(SessionKind::Manual, "dashboard", Some(30.0), None)
            .await;
        scheduler.advance(Duration::from_secs(60)).await;
        coordinator.sync_with_device(false).await;
        assert_eq!(coordinator.view().status, SessionStatus::Idle);

        let link = connector.last_link();
        let relay = link.published_on("data/PulsarInfinite/swr");
        let last = relay.last().unwrap();
        assert_eq!(last.payload, br#"{"device":0}"#);
        assert!(last.retain);

        let control = link.published_on("irrigation/PulsarInfinite/control");
        assert!(!control.is_empty());
        assert!(control.iter().all(|p| !p.retain));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_device_report_ignored_right_after_start() {
        let h = harness();
        h.coordinator
            .start(SessionKind::Manual, "dashboard", Some(30.0), None)
            .await;

        h.coordinator.sync_with_device(false).await;
        assert_eq!(h.coordinator.view().status, SessionStatus::Active);
    }

    // -- observers --------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn observers_see_full_lifecycle() {
        let h = harness();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let _sub = h.coordinator.subscribe(move |v| s.lock().push(v.status));

        h.coordinator
            .start(SessionKind::Manual, "dashboard", None, None)
            .await;
        h.coordinator.stop(StopReason::Manual).await;

        assert_eq!(
            *seen.lock(),
            vec![
                SessionStatus::Starting,
                SessionStatus::Active,
                SessionStatus::Stopping,
                SessionStatus::Idle,
            ]
        );
    }

    // -- invariant --------------------------------------------------------

    #[derive(Debug, Clone)]
    enum Op {
        Start(SessionKind, u8),
        RacingStarts,
        Stop,
        DoubleStop,
        Advance(u16),
        Device(bool),
        RejectNextOn,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (any::<bool>(), 0u8..4).prop_map(|(ml, m)| Op::Start(
                if ml { SessionKind::Ml } else { SessionKind::Manual },
                m
            )),
            Just(Op::RacingStarts),
            Just(Op::Stop),
            Just(Op::DoubleStop),
            (1u16..400).prop_map(Op::Advance),
            any::<bool>().prop_map(Op::Device),
            Just(Op::RejectNextOn),
        ]
    }

    proptest! {
        #[test]
        fn at_most_one_active_session(ops in prop::collection::vec(op(), 1..40)) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();

            rt.block_on(async {
                let h = harness();
                let active: Arc<Mutex<Option<Uuid>>> = Arc::new(Mutex::new(None));
                let violated = Arc::new(AtomicBool::new(false));
                let (a, v) = (Arc::clone(&active), Arc::clone(&violated));
                let _sub = h.coordinator.subscribe(move |view| {
                    let mut current = a.lock();
                    match (view.status, &view.session) {
                        (SessionStatus::Active, Some(s)) => {
                            if current.is_some_and(|id| id != s.id) {
                                v.store(true, Ordering::SeqCst);
                            }
                            *current = Some(s.id);
                        }
                        (SessionStatus::Idle, _) => *current = None,
                        _ => {}
                    }
                });

                let mut stopped = 0usize;
                for op in ops {
                    match op {
                        Op::Start(kind, minutes) => {
                            let d = (minutes > 0).then_some(f64::from(minutes));
                            h.coordinator.start(kind, "prop", d, None).await;
                        }
                        Op::RacingStarts => {
                            let (x, y) = tokio::join!(
                                h.coordinator.start(SessionKind::Manual, "prop", Some(1.0), None),
                                h.coordinator.start(SessionKind::Ml, "prop", Some(2.0), None),
                            );
                            let started = [x, y]
                                .iter()
                                .filter(|o| matches!(o, StartOutcome::Started(_)))
                                .count();
                            assert!(started <= 1);
                        }
                        Op::Stop => {
                            if h.coordinator.stop(StopReason::Manual).await.outcome
                                == StopOutcome::Stopped
                            {
                                stopped += 1;
                            }
                        }
                        Op::DoubleStop => {
                            let (x, y) = tokio::join!(
                                h.coordinator.stop(StopReason::Manual),
                                h.coordinator.stop(StopReason::Manual),
                            );
                            stopped += [x, y]
                                .iter()
                                .filter(|r| r.outcome == StopOutcome::Stopped)
                                .count();
                        }
                        Op::Advance(secs) => {
                            h.scheduler.advance(Duration::from_secs(u64::from(secs))).await;
                        }
                        Op::Device(on) => h.coordinator.sync_with_device(on).await,
                        Op::RejectNextOn => {
                            let prev = h.control.reject_on.load(Ordering::SeqCst);
                            h.control.reject_on.store(!prev, Ordering::SeqCst);
                        }
                    }
                    assert!(!violated.load(Ordering::SeqCst));
                }
                // Every explicit stop produced one record; timer and device
                // stops may add more, never fewer.
                assert!(h.usage.record_count() >= stopped);
            });
        }
    }
}
