mod command;
mod controller;
mod relay;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use std::{env, str::FromStr, time::Duration};
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use command::{parse_command, Command, Topics};
use controller::{sample_flow, Controller};
use relay::Relay;

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn publish_json<T: Serialize>(client: &AsyncClient, topic: &str, msg: &T, retain: bool) {
    let payload = match serde_json::to_vec(msg) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, topic, "node: encode failed");
            return;
        }
    };
    if let Err(e) = client.try_publish(topic, QoS::AtLeastOnce, retain, payload) {
        warn!(error = %e, topic, "node: publish failed");
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Env config
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env_or("MQTT_PORT", 1883);
    let device_id = env::var("DEVICE_ID").unwrap_or_else(|_| "PulsarInfinite".to_string());
    let flow_rate_lpm: f64 = env_or("FLOW_RATE_LPM", 15.0);
    let max_on_minutes: u64 = env_or("MAX_ON_MINUTES", 180);
    let telemetry_every_s: u64 = env_or("TELEMETRY_EVERY_S", 5);
    let gpio_pin: u8 = env_or("RELAY_GPIO_PIN", 17);
    // Many common relay boards are active-low. If yours is active-high, set false.
    let active_low = env::var("RELAY_ACTIVE_LOW")
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(true);

    let topics = Topics::new(&device_id);
    let mut controller = Controller::new(
        Relay::new(gpio_pin, active_low)?,
        Duration::from_secs(max_on_minutes * 60),
    );

    let mut mqttoptions = MqttOptions::new(format!("dripline-node-{device_id}"), broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

    info!(device = %device_id, relay = %topics.relay, control = %topics.control, "node: starting");

    let mut safety = interval(Duration::from_secs(1));
    safety.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut telemetry = interval(Duration::from_secs(telemetry_every_s.max(1)));
    telemetry.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!(relay_on = controller.is_on(), "node: connected to mqtt");
                    for topic in [&topics.relay, &topics.control] {
                        if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                            warn!(error = %e, topic = %topic, "node: subscribe failed");
                        }
                    }
                    publish_json(&client, &topics.status, &controller.status(), true);
                }
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    match parse_command(&topics, &p.topic, &p.payload) {
                        Ok(cmd) if cmd.is_stale_replay(p.retain) => {
                            info!(?cmd, topic = %p.topic, "node: ignoring retained start");
                        }
                        Ok(cmd) => {
                            debug!(?cmd, "node: command");
                            // Relay commands are always answered so the hub can confirm.
                            let answer = matches!(cmd, Command::Relay(_));
                            if controller.handle(cmd, Instant::now()) || answer {
                                publish_json(&client, &topics.status, &controller.status(), true);
                            }
                        }
                        Err(e) => warn!(error = %format!("{e:#}"), topic = %p.topic, "node: bad command"),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "node: mqtt error, reconnecting");
                    // Fail-safe: no broker, no irrigation.
                    controller.force_off("mqtt error");
                    sleep(Duration::from_secs(2)).await;
                }
            },
            _ = safety.tick() => {
                if controller.enforce_deadline(Instant::now()) {
                    publish_json(&client, &topics.status, &controller.status(), true);
                }
            }
            _ = telemetry.tick() => {
                if let Some(msg) = controller.telemetry(Instant::now(), sample_flow(flow_rate_lpm)) {
                    publish_json(&client, &topics.logs, &msg, false);
                }
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
