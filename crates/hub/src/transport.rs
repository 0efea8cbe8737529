//! Transport seam between the connection manager and the MQTT client.
//!
//! A [`Connector`] opens one link to one endpoint. The link never reconnects
//! by itself: when it drops it reports `LinkEvent::Closed` and the
//! connection manager decides what happens next.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, MqttOptions, Outgoing, Packet, QoS, Transport,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::endpoint::{BrokerEndpoint, TransportHint};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connect to {endpoint} failed: {reason}")]
    Connect { endpoint: String, reason: String },
    #[error("broker {endpoint} refused connection: {code}")]
    Refused { endpoint: String, code: String },
    #[error("connect to {endpoint} timed out after {timeout:?}")]
    Timeout { endpoint: String, timeout: Duration },
    #[error("publish rejected: {0}")]
    Publish(String),
    #[error("subscribe rejected: {0}")]
    Subscribe(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Message { topic: String, payload: Vec<u8> },
    /// Broker acknowledged a QoS 1/2 publish.
    Acked,
    Closed(String),
}

/// Synchronous handle on an open link. `publish` and `subscribe` report
/// local handoff only.
pub trait LinkClient: Send + Sync {
    fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS, retain: bool)
        -> Result<(), TransportError>;
    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError>;
    /// Idempotent.
    fn close(&self);
}

pub struct Link {
    pub client: Arc<dyn LinkClient>,
    pub events: mpsc::UnboundedReceiver<LinkEvent>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &BrokerEndpoint,
        timeout: Duration,
    ) -> Result<Link, TransportError>;
}

// ---------------------------------------------------------------------------
// rumqttc implementation
// ---------------------------------------------------------------------------

/// Capacity of the rumqttc request channel.
const REQUEST_CAP: usize = 32;

/// How long the pump may take to flush DISCONNECT before it is aborted.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Default, Clone)]
pub struct MqttConnector;

impl MqttConnector {
    fn options(endpoint: &BrokerEndpoint) -> MqttOptions {
        let client_id = if endpoint.client_id.is_empty() {
            format!("dripline-{}", uuid::Uuid::new_v4().simple())
        } else {
            endpoint.client_id.clone()
        };

        let mut opts = if endpoint.transport.is_websocket() {
            // rumqttc takes the full url as host for websocket transports.
            MqttOptions::new(client_id, endpoint.url.clone(), endpoint.port)
        } else {
            MqttOptions::new(client_id, endpoint.host.clone(), endpoint.port)
        };
        opts.set_keep_alive(endpoint.keep_alive);
        opts.set_clean_session(true);

        match endpoint.transport {
            TransportHint::Tcp => {}
            TransportHint::Tls => {
                opts.set_transport(Transport::tls_with_default_config());
            }
            TransportHint::Ws => {
                opts.set_transport(Transport::Ws);
            }
            TransportHint::Wss => {
                opts.set_transport(Transport::wss_with_default_config());
            }
        }
        opts
    }
}

#[async_trait]
impl Connector for MqttConnector {
    async fn connect(
        &self,
        endpoint: &BrokerEndpoint,
        timeout: Duration,
    ) -> Result<Link, TransportError> {
        let (client, mut eventloop) = AsyncClient::new(Self::options(endpoint), REQUEST_CAP);

        let handshake = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        return if ack.code == ConnectReturnCode::Success {
                            Ok(())
                        } else {
                            Err(TransportError::Refused {
                                endpoint: endpoint.url.clone(),
                                code: format!("{:?}", ack.code),
                            })
                        };
                    }
                    Ok(_) => {}
                    Err(e) => {
                        return Err(TransportError::Connect {
                            endpoint: endpoint.url.clone(),
                            reason: e.to_string(),
                        })
                    }
                }
            }
        };

        match tokio::time::timeout(timeout, handshake).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(TransportError::Timeout {
                    endpoint: endpoint.url.clone(),
                    timeout,
                })
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let url = endpoint.url.clone();
        let pump = tokio::spawn(async move {
            loop {
                let event = match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(p))) => LinkEvent::Message {
                        topic: p.topic.clone(),
                        payload: p.payload.to_vec(),
                    },
                    Ok(Event::Incoming(Packet::PubAck(_) | Packet::PubComp(_))) => LinkEvent::Acked,
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        let _ = tx.send(LinkEvent::Closed("broker sent disconnect".to_string()));
                        break;
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        debug!(endpoint = %url, "link: local disconnect");
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = tx.send(LinkEvent::Closed(e.to_string()));
                        break;
                    }
                };
                if tx.send(event).is_err() {
                    break;
                }
            }
        });

        Ok(Link {
            client: Arc::new(MqttLinkClient {
                client,
                pump: pump.abort_handle(),
                closed: AtomicBool::new(false),
            }),
            events: rx,
        })
    }
}

struct MqttLinkClient {
    client: AsyncClient,
    pump: AbortHandle,
    closed: AtomicBool,
}

impl LinkClient for MqttLinkClient {
    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError> {
        self.client
            .try_publish(topic, qos, retain, payload)
            .map_err(|e| TransportError::Publish(e.to_string()))
    }

    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        self.client
            .try_subscribe(topic, qos)
            .map_err(|e| TransportError::Subscribe(e.to_string()))
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let queued = self.client.try_disconnect().is_ok();
            abort_after_grace(self.pump.clone(), queued, CLOSE_GRACE);
        }
    }
}

/// The pump exits by itself once DISCONNECT is written. Abort it only if it
/// is still running after `grace`, or at once when nothing was queued.
fn abort_after_grace(pump: AbortHandle, disconnect_queued: bool, grace: Duration) {
    if !disconnect_queued {
        pump.abort();
        return;
    }
    match tokio::runtime::Handle::try_current() {
        Ok(rt) => {
            rt.spawn(async move {
                tokio::time::sleep(grace).await;
                if !pump.is_finished() {
                    debug!("link: disconnect not flushed in time, aborting pump");
                    pump.abort();
                }
            });
        }
        Err(_) => pump.abort(),
    }
}

// ---------------------------------------------------------------------------
// Scripted connector (tests)
// ---------------------------------------------------------------------------


// ===========================================================================
// Tests
// ===========================================================================
