//! Command publisher: formats device commands and hands them to the
//! connection manager, then watches the status topic so callers can wait
//! for the device to confirm. Retry policy belongs to the caller.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::QoS;
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::connection::{ConnectionManager, PublishOptions};
use crate::mqtt::{DeviceMessage, DeviceState, IrrigationCommand, RelayCommand, StatusUpdate, Topics};
use crate::observer::Subscription;

/// Outbound control seam used by the session coordinator.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// Switch the relay. True once the broker client accepted the message.
    async fn send_control(&self, state: DeviceState) -> bool;

    /// Announce a session change on the irrigation control topic.
    async fn announce(&self, irrigating: bool, duration_minutes: Option<f64>) -> bool;

    /// Wait for the device to report `state` after the latest relay command.
    /// False when nothing matching arrives within `timeout`.
    async fn confirm(&self, state: DeviceState, timeout: Duration) -> bool;
}

pub struct CommandPublisher {
    connection: ConnectionManager,
    topics: Topics,
    retain: bool,
    /// Irrigation state reported since the last relay command.
    reported: Arc<watch::Sender<Option<bool>>>,
    _status: Subscription,
}

impl CommandPublisher {
    pub fn new(connection: ConnectionManager, topics: Topics, retain: bool) -> Self {
        let (reported, _) = watch::channel(None);
        let reported = Arc::new(reported);
        let tx = Arc::clone(&reported);
        let status = connection.subscribe_messages(move |msg| {
            if let DeviceMessage::Status(StatusUpdate {
                irrigating: Some(on),
            }) = &msg.message
            {
                tx.send_replace(Some(*on));
            }
        });
        Self {
            connection,
            topics,
            retain,
            reported,
            _status: status,
        }
    }

    /// Relay commands keep the configured retain flag so a restarted device
    /// picks up the last state.
    fn relay_options(&self) -> PublishOptions {
        PublishOptions {
            qos: QoS::AtLeastOnce,
            retain: self.retain,
        }
    }

    /// Announcements are never retained; a replayed "irrigation started"
    /// must not reach a device after the session ended.
    fn announce_options() -> PublishOptions {
        PublishOptions {
            qos: QoS::AtLeastOnce,
            retain: false,
        }
    }
}

#[async_trait]
impl ControlChannel for CommandPublisher {
    async fn send_control(&self, state: DeviceState) -> bool {
        let topic = self.topics.relay();
        let payload = match serde_json::to_vec(&RelayCommand::new(state)) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "publisher: relay command encode failed");
                return false;
            }
        };
        // Reports older than this command cannot confirm it.
        self.reported.send_replace(None);
        let ok = self.connection.publish(&topic, &payload, self.relay_options());
        debug!(topic = %topic, ?state, ok, "publisher: relay command");
        ok
    }

    async fn announce(&self, irrigating: bool, duration_minutes: Option<f64>) -> bool {
        let topic = self.topics.control();
        let cmd = IrrigationCommand {
            irrigation: irrigating,
            duration_minutes,
            timestamp: OffsetDateTime::now_utc(),
        };
        let payload = match serde_json::to_vec(&cmd) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "publisher: control command encode failed");
                return false;
            }
        };
        let ok = self
            .connection
            .publish(&topic, &payload, Self::announce_options());
        debug!(topic = %topic, irrigating, ok, "publisher: control announce");
        ok
    }

    async fn confirm(&self, state: DeviceState, timeout: Duration) -> bool {
        let want = state == DeviceState::On;
        let mut rx = self.reported.subscribe();
        let confirmed = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|r| *r == Some(want))).await,
            Ok(Ok(_))
        );
        debug!(?state, confirmed, "publisher: device confirmation");
        confirmed
    }
}

// ---------------------------------------------------------------------------
// Recording channel (tests)
// ---------------------------------------------------------------------------

#[cfg(test)]
pub mod fake {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Records every command. Yields before answering so concurrent callers
    /// interleave. The device confirms every command unless `silent`.
    #[derive(Default)]
    pub struct FakeControl {
        pub sent: Mutex<Vec<DeviceState>>,
        pub announced: Mutex<Vec<(bool, Option<f64>)>>,
        pub reject_on: AtomicBool,
        /// Number of upcoming "off" commands to reject.
        pub reject_off: AtomicUsize,
        pub silent: AtomicBool,
        pub confirm_waits: Mutex<Vec<DeviceState>>,
    }

    impl FakeControl {
        pub fn sent(&self) -> Vec<DeviceState> {
            self.sent.lock().clone()
        }
    }

    #[async_trait]
    impl ControlChannel for FakeControl {
        async fn send_control(&self, state: DeviceState) -> bool {
            tokio::task::yield_now().await;
            self.sent.lock().push(state);
            match state {
                DeviceState::On => !self.reject_on.load(Ordering::SeqCst),
                DeviceState::Off => self
                    .reject_off
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_err(),
            }
        }

        async fn announce(&self, irrigating: bool, duration_minutes: Option<f64>) -> bool {
            self.announced.lock().push((irrigating, duration_minutes));
            true
        }

        async fn confirm(&self, state: DeviceState, timeout: Duration) -> bool {
            self.confirm_waits.lock().push(state);
            if self.silent.load(Ordering::SeqCst) {
                tokio::time::sleep(timeout).await;
                return false;
            }
            true
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
