mod config;
mod connection;
mod endpoint;
mod mqtt;
mod observer;
mod predict;
mod publisher;
mod session;
mod state;
mod timer;
mod transport;
mod usage;
mod web;

use anyhow::{Context, Result};
use std::{env, sync::Arc, time::Duration};
use tokio::sync::{mpsc, RwLock};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use connection::ConnectionManager;
use mqtt::{DeviceMessage, Topics};
use predict::{HttpPredictor, Predictor};
use publisher::CommandPublisher;
use session::{SessionCoordinator, StopOutcome, StopReason};
use state::{StateEvent, SystemState};
use timer::TokioScheduler;
use transport::MqttConnector;
use usage::UsageAggregator;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config file ─────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load_or_default(&config_path)?;

    let endpoints = cfg.endpoints()?;
    let topics = Topics::new(cfg.device.id.clone());
    info!(
        device = %cfg.device.id,
        brokers = endpoints.len(),
        prediction = cfg.prediction.is_some(),
        "hub: config loaded"
    );

    // ── Services ────────────────────────────────────────────────────
    let connection = ConnectionManager::new(
        endpoints.clone(),
        topics.clone(),
        cfg.connection_settings(),
        Arc::new(MqttConnector),
    );
    let publisher = Arc::new(CommandPublisher::new(
        connection.clone(),
        topics,
        cfg.device.retain_commands,
    ));
    let usage = Arc::new(UsageAggregator::new(
        cfg.usage.history_limit,
        cfg.utc_offset()?,
    ));
    let sessions = SessionCoordinator::new(
        publisher,
        Arc::new(TokioScheduler),
        usage.clone(),
        cfg.session_settings(),
    );
    let predictor: Option<Arc<dyn Predictor>> = match &cfg.prediction {
        Some(p) => Some(Arc::new(
            HttpPredictor::new(p.url.clone(), Duration::from_millis(p.timeout_ms))
                .context("prediction client")?,
        )),
        None => None,
    };

    // ── Shared state (ephemeral, for the dashboard) ─────────────────
    let shared = Arc::new(RwLock::new(SystemState::new(
        endpoints.iter().map(|ep| ep.url.clone()).collect(),
    )));
    let events = state::spawn_recorder(Arc::clone(&shared));
    let _ = events.send(StateEvent::System("hub started".to_string()));

    // Device status reports are reconciled off the observer thread.
    let (status_tx, mut status_rx) = mpsc::unbounded_channel::<bool>();
    let subscriptions = {
        let conn_events = events.clone();
        let msg_events = events.clone();
        let session_events = events.clone();
        let usage_events = events.clone();
        vec![
            connection.subscribe_state(move |st| {
                let _ = conn_events.send(StateEvent::Connection(st.clone()));
            }),
            connection.subscribe_messages(move |msg| {
                if let DeviceMessage::Status(update) = &msg.message {
                    if let Some(irrigating) = update.irrigating {
                        let _ = status_tx.send(irrigating);
                    }
                }
                let _ = msg_events.send(StateEvent::Message(msg.clone()));
            }),
            sessions.subscribe(move |view| {
                let _ = session_events.send(StateEvent::Session(view.clone()));
            }),
            usage.subscribe(move |chart| {
                let _ = usage_events.send(StateEvent::Usage(chart.last_record.clone()));
            }),
        ]
    };

    {
        let sessions = sessions.clone();
        tokio::spawn(async move {
            while let Some(irrigating) = status_rx.recv().await {
                sessions.sync_with_device(irrigating).await;
            }
        });
    }

    // ── Web server ──────────────────────────────────────────────────
    let app = web::AppState {
        shared: Arc::clone(&shared),
        connection: connection.clone(),
        sessions: sessions.clone(),
        usage: usage.clone(),
        predictor,
        features: cfg.prediction_features(),
    };
    let web_port = web::resolve_port(cfg.web.port);
    let web_events = events.clone();
    tokio::spawn(async move {
        if let Err(e) = web::serve(app, web_port).await {
            error!(error = %format!("{e:#}"), "web: server stopped");
            let _ = web_events.send(StateEvent::Error(format!("web server stopped: {e:#}")));
        }
    });

    // ── MQTT ────────────────────────────────────────────────────────
    connection.spawn_health_check();
    {
        let connection = connection.clone();
        tokio::spawn(async move {
            let phase = connection.connect().await;
            info!(?phase, "hub: initial connection sequence finished");
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("hub: shutting down");

    // Best-effort fail-safe: close any running session before the link goes.
    let report = sessions.stop(StopReason::Shutdown).await;
    if report.outcome == StopOutcome::Stopped && !report.device_confirmed {
        warn!(
            mqtt_success = report.mqtt_success,
            "hub: device did not confirm off at shutdown, check the device"
        );
    }

    drop(subscriptions);
    connection.shutdown();
    Ok(())
}
