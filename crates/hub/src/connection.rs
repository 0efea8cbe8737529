//! Connection manager: owns the single broker link.
//!
//! Endpoints are dialed strictly one at a time, in table order, until one
//! accepts or the retry ceiling is reached. Exhausting the ceiling leaves the
//! manager in [`Phase::Failed`] until an explicit [`ConnectionManager::retry`].
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──ok──▶ Connected ──link lost──▶ Disconnected
//!                              │  ▲                                          │
//!                           error │ (below ceiling)            auto-reconnect┘
//!                              ▼  │
//!                             Failed ──(ceiling)── terminal until retry()
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rumqttc::QoS;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::endpoint::BrokerEndpoint;
use crate::mqtt::{parse_inbound, InboundMessage, Topics};
use crate::observer::{Observers, Subscription};
use crate::transport::{Connector, LinkClient, LinkEvent, TransportError};

/// Without inbound traffic for this long the health check starts decaying
/// the score.
const SILENCE_THRESHOLD: Duration = Duration::from_secs(30);

const HEALTH_MAX: u8 = 100;
const HEALTH_ON_ACK: i16 = 2;
const HEALTH_ON_MESSAGE: i16 = 5;
const HEALTH_ON_REJECTED_PUBLISH: i16 = -10;
const HEALTH_ON_FAILED_ATTEMPT: i16 = -20;
const HEALTH_ON_SILENCE: i16 = -5;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub max_retries: u32,
    pub connect_timeout: Duration,
    pub retry_delay: Duration,
    pub message_buffer: usize,
    pub health_interval: Duration,
    pub auto_reconnect: bool,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            connect_timeout: Duration::from_secs(10),
            retry_delay: Duration::from_secs(2),
            message_buffer: 10,
            health_interval: Duration::from_secs(10),
            auto_reconnect: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    pub phase: Phase,
    pub endpoint_index: usize,
    pub consecutive_failures: u32,
    /// Failed attempts of the most recent attempt sequence.
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
    pub health: u8,
}

impl ConnectionState {
    fn initial() -> Self {
        Self {
            phase: Phase::Disconnected,
            endpoint_index: 0,
            consecutive_failures: 0,
            reconnect_attempts: 0,
            last_error: None,
            health: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub is_connected: bool,
    pub health: u8,
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
    pub current_broker: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct PublishOptions {
    pub qos: QoS,
    pub retain: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            qos: QoS::AtLeastOnce,
            retain: false,
        }
    }
}

fn adjust(health: u8, delta: i16) -> u8 {
    (i16::from(health) + delta).clamp(0, i16::from(HEALTH_MAX)) as u8
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

struct Inner {
    endpoints: Vec<BrokerEndpoint>,
    topics: Topics,
    settings: ConnectionSettings,
    connector: Arc<dyn Connector>,

    state: Mutex<ConnectionState>,
    link: Mutex<Option<Arc<dyn LinkClient>>>,
    subscriptions: Mutex<Vec<String>>,
    recent: Mutex<VecDeque<InboundMessage>>,
    last_inbound: Mutex<Option<Instant>>,

    /// Bumped on every new link and on shutdown; events from older links
    /// are ignored.
    generation: AtomicU64,
    in_flight: AtomicBool,
    shut_down: AtomicBool,
    tasks: Mutex<Vec<AbortHandle>>,

    state_observers: Observers<ConnectionState>,
    message_observers: Observers<InboundMessage>,
}

/// Cheap to clone; every clone drives the same link.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

/// Clears the in-flight flag however the attempt sequence ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl ConnectionManager {
    pub fn new(
        endpoints: Vec<BrokerEndpoint>,
        topics: Topics,
        settings: ConnectionSettings,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let subscriptions = topics.subscriptions();
        Self {
            inner: Arc::new(Inner {
                endpoints,
                topics,
                settings,
                connector,
                state: Mutex::new(ConnectionState::initial()),
                link: Mutex::new(None),
                subscriptions: Mutex::new(subscriptions),
                recent: Mutex::new(VecDeque::new()),
                last_inbound: Mutex::new(None),
                generation: AtomicU64::new(0),
                in_flight: AtomicBool::new(false),
                shut_down: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
                state_observers: Observers::new(),
                message_observers: Observers::new(),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().phase == Phase::Connected
    }

    pub fn diagnostics(&self) -> Diagnostics {
        let st = self.inner.state.lock();
        let connected = st.phase == Phase::Connected;
        Diagnostics {
            is_connected: connected,
            health: st.health,
            reconnect_attempts: st.reconnect_attempts,
            last_error: st.last_error.clone(),
            current_broker: connected
                .then(|| self.inner.endpoints.get(st.endpoint_index))
                .flatten()
                .map(|ep| ep.url.clone()),
        }
    }

    /// Newest last.
    pub fn recent_messages(&self) -> Vec<InboundMessage> {
        self.inner.recent.lock().iter().cloned().collect()
    }

    pub fn subscribe_state<F>(&self, f: F) -> Subscription
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        self.inner.state_observers.subscribe(f)
    }

    pub fn subscribe_messages<F>(&self, f: F) -> Subscription
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        self.inner.message_observers.subscribe(f)
    }

    /// Add topics to the set issued on every connect. Applied to the live
    /// link immediately when connected.
    #[cfg(test)]
    pub fn add_subscriptions(&self, topics: &[String]) {
        let added: Vec<String> = {
            let mut subs = self.inner.subscriptions.lock();
            let fresh: Vec<String> = topics
                .iter()
                .filter(|t| !subs.contains(t))
                .cloned()
                .collect();
            subs.extend(fresh.iter().cloned());
            fresh
        };
        if added.is_empty() || !self.is_connected() {
            return;
        }
        if let Some(link) = self.inner.link.lock().clone() {
            for topic in &added {
                if let Err(e) = link.subscribe(topic, QoS::AtLeastOnce) {
                    warn!(topic = %topic, error = %e, "connection: subscribe failed");
                }
            }
        }
    }

    // -- connect / retry --------------------------------------------------

    /// Run an attempt sequence from endpoint 0. Returns the resulting phase.
    ///
    /// A call made while another sequence is in flight is coalesced and
    /// returns the current phase at once. Does nothing when already
    /// connected or after the retry ceiling was hit.
    pub async fn connect(&self) -> Phase {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return self.state().phase;
        }
        if self.inner.in_flight.swap(true, Ordering::SeqCst) {
            debug!("connection: connect coalesced with attempt in flight");
            return self.state().phase;
        }
        let _guard = InFlight(&self.inner.in_flight);

        let phase = self.state().phase;
        if matches!(phase, Phase::Connected | Phase::Failed) {
            return phase;
        }
        self.run_attempts().await
    }

    /// Reset the failure counter and start over from endpoint 0.
    pub async fn retry(&self) -> Phase {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return self.state().phase;
        }
        if self.inner.in_flight.swap(true, Ordering::SeqCst) {
            debug!("connection: retry coalesced with attempt in flight");
            return self.state().phase;
        }
        let _guard = InFlight(&self.inner.in_flight);

        {
            let mut st = self.inner.state.lock();
            if st.phase == Phase::Connected {
                return Phase::Connected;
            }
            st.consecutive_failures = 0;
            st.reconnect_attempts = 0;
        }
        info!("connection: manual retry");
        self.run_attempts().await
    }

    async fn run_attempts(&self) -> Phase {
        let inner = &self.inner;
        let n = inner.endpoints.len();
        if n == 0 {
            self.set_phase(|st| {
                st.phase = Phase::Failed;
                st.last_error = Some("no broker endpoints configured".to_string());
            });
            return Phase::Failed;
        }

        let timeout = inner.settings.connect_timeout;
        let mut failed_this_sequence: u32 = 0;
        let mut index = 0usize;

        loop {
            let slot = index % n;
            let endpoint = &inner.endpoints[slot];
            self.set_phase(|st| {
                st.phase = Phase::Connecting;
                st.endpoint_index = slot;
            });
            info!(endpoint = %endpoint, attempt = failed_this_sequence + 1, "connection: dialing");

            let result = match tokio::time::timeout(
                timeout,
                inner.connector.connect(endpoint, timeout),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout {
                    endpoint: endpoint.url.clone(),
                    timeout,
                }),
            };

            if inner.shut_down.load(Ordering::SeqCst) {
                if let Ok(link) = result {
                    link.client.close();
                }
                return Phase::Disconnected;
            }

            let error = match result {
                Ok(link) => {
                    self.install(link.client, link.events, slot, failed_this_sequence);
                    return Phase::Connected;
                }
                Err(e) => e,
            };

            failed_this_sequence += 1;
            warn!(endpoint = %endpoint, error = %error, "connection: attempt failed");
            let max_retries = inner.settings.max_retries;
            let mut exhausted = false;
            self.set_phase(|st| {
                st.phase = Phase::Failed;
                st.consecutive_failures += 1;
                st.reconnect_attempts = failed_this_sequence;
                st.last_error = Some(error.to_string());
                st.health = adjust(st.health, HEALTH_ON_FAILED_ATTEMPT);
                exhausted = st.consecutive_failures >= max_retries;
            });
            if exhausted {
                warn!(
                    attempts = failed_this_sequence,
                    max_retries, "connection: retry ceiling reached, waiting for manual retry"
                );
                return Phase::Failed;
            }

            tokio::time::sleep(inner.settings.retry_delay).await;
            if inner.shut_down.load(Ordering::SeqCst) {
                return Phase::Disconnected;
            }
            index += 1;
        }
    }

    fn install(
        &self,
        client: Arc<dyn LinkClient>,
        events: UnboundedReceiver<LinkEvent>,
        slot: usize,
        failed_this_sequence: u32,
    ) {
        let inner = &self.inner;
        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let topics = inner.subscriptions.lock().clone();
        for topic in &topics {
            if let Err(e) = client.subscribe(topic, QoS::AtLeastOnce) {
                warn!(topic = %topic, error = %e, "connection: subscribe failed");
            }
        }

        if let Some(old) = inner.link.lock().replace(client) {
            old.close();
        }
        *inner.last_inbound.lock() = Some(Instant::now());

        let reader = tokio::spawn(read_link(Arc::downgrade(inner), generation, events));
        {
            let mut tasks = inner.tasks.lock();
            tasks.retain(|t| !t.is_finished());
            tasks.push(reader.abort_handle());
        }

        self.set_phase(|st| {
            st.phase = Phase::Connected;
            st.endpoint_index = slot;
            st.consecutive_failures = 0;
            st.reconnect_attempts = failed_this_sequence;
            st.last_error = None;
            st.health = 0;
        });
        info!(
            endpoint = %inner.endpoints[slot],
            subscriptions = topics.len(),
            "connection: connected"
        );
    }

    // -- publish ----------------------------------------------------------

    /// Hand a message to the transport. Returns false at once when not
    /// connected or when the transport refuses it.
    pub fn publish(&self, topic: &str, payload: &[u8], opts: PublishOptions) -> bool {
        let link = {
            if self.inner.state.lock().phase != Phase::Connected {
                debug!(topic, "connection: publish rejected, not connected");
                return false;
            }
            self.inner.link.lock().clone()
        };
        let Some(link) = link else {
            return false;
        };

        match link.publish(topic, payload.to_vec(), opts.qos, opts.retain) {
            Ok(()) => true,
            Err(e) => {
                warn!(topic, error = %e, "connection: publish rejected by transport");
                self.adjust_health(HEALTH_ON_REJECTED_PUBLISH);
                false
            }
        }
    }

    // -- health -----------------------------------------------------------

    fn adjust_health(&self, delta: i16) {
        let mut st = self.inner.state.lock();
        st.health = adjust(st.health, delta);
    }

    /// Spawn the periodic ping/decay task.
    pub fn spawn_health_check(&self) {
        let weak = Arc::downgrade(&self.inner);
        let every = self.inner.settings.health_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { return };
                if inner.shut_down.load(Ordering::SeqCst) {
                    return;
                }
                ConnectionManager { inner }.health_tick();
            }
        });
        self.inner.tasks.lock().push(task.abort_handle());
    }

    fn health_tick(&self) {
        if !self.is_connected() {
            return;
        }
        let ping = serde_json::json!({ "timestamp": OffsetDateTime::now_utc().unix_timestamp() });
        let opts = PublishOptions {
            qos: QoS::AtMostOnce,
            retain: false,
        };
        self.publish(&self.inner.topics.ping(), ping.to_string().as_bytes(), opts);

        let silent = self
            .inner
            .last_inbound
            .lock()
            .is_some_and(|at| at.elapsed() > SILENCE_THRESHOLD);
        if silent {
            self.adjust_health(HEALTH_ON_SILENCE);
            debug!(health = self.state().health, "connection: no recent traffic");
        }
    }

    // -- link events ------------------------------------------------------

    fn on_message(&self, topic: &str, payload: &[u8]) {
        let msg = match parse_inbound(&self.inner.topics, topic, payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(topic, error = %e, "connection: dropping malformed message");
                return;
            }
        };

        {
            let mut recent = self.inner.recent.lock();
            if recent.len() >= self.inner.settings.message_buffer {
                recent.pop_front();
            }
            recent.push_back(msg.clone());
        }
        *self.inner.last_inbound.lock() = Some(Instant::now());
        self.adjust_health(HEALTH_ON_MESSAGE);
        self.inner.message_observers.notify(&msg);
    }

    fn on_link_lost(&self, reason: &str) {
        if let Some(link) = self.inner.link.lock().take() {
            link.close();
        }
        self.set_phase(|st| {
            st.phase = Phase::Disconnected;
            st.health = 0;
            st.last_error = Some(reason.to_string());
        });
        warn!(reason, "connection: link lost");

        if self.inner.settings.auto_reconnect && !self.inner.shut_down.load(Ordering::SeqCst) {
            let manager = self.clone();
            let delay = self.inner.settings.retry_delay;
            let task = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                manager.connect().await;
            });
            self.inner.tasks.lock().push(task.abort_handle());
        }
    }

    // -- teardown ---------------------------------------------------------

    /// Close the link and stop every background task. Safe to call more
    /// than once.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(link) = self.inner.link.lock().take() {
            link.close();
        }
        self.set_phase(|st| {
            st.phase = Phase::Disconnected;
            st.health = 0;
        });
        info!("connection: shut down");
    }

    /// Mutate state under the lock, then notify observers outside it.
    fn set_phase(&self, f: impl FnOnce(&mut ConnectionState)) {
        let snapshot = {
            let mut st = self.inner.state.lock();
            f(&mut st);
            st.clone()
        };
        self.inner.state_observers.notify(&snapshot);
    }
}

async fn read_link(inner: Weak<Inner>, generation: u64, mut events: UnboundedReceiver<LinkEvent>) {
    let mut close_reason = "link event stream ended".to_string();
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else { return };
        if inner.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        let manager = ConnectionManager { inner };
        match event {
            LinkEvent::Message { topic, payload } => manager.on_message(&topic, &payload),
            LinkEvent::Acked => manager.adjust_health(HEALTH_ON_ACK),
            LinkEvent::Closed(reason) => {
                close_reason = reason;
                break;
            }
        }
    }

    if let Some(inner) = inner.upgrade() {
        if inner.generation.load(Ordering::SeqCst) == generation {
            ConnectionManager { inner }.on_link_lost(&close_reason);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
