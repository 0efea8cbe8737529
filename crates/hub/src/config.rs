//! TOML config file loading and validation for the broker table, device
//! topics, session policy and usage reporting.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use time::UtcOffset;
use tracing::warn;

use crate::connection::ConnectionSettings;
use crate::endpoint::BrokerEndpoint;
use crate::predict::{Features, DEFAULT_FEATURES, FEATURE_COUNT};
use crate::session::SessionSettings;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceSection,
    pub brokers: Vec<BrokerEntry>,
    pub connection: ConnectionSection,
    pub session: SessionSection,
    pub usage: UsageSection,
    pub prediction: Option<PredictionSection>,
    pub web: WebSection,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DeviceSection {
    pub id: String,
    pub flow_rate_lpm: f64,
    pub retain_commands: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerEntry {
    pub url: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default = "default_keep_alive_sec")]
    pub keep_alive_sec: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ConnectionSection {
    pub max_retries: u32,
    pub connect_timeout_ms: u64,
    pub retry_delay_ms: u64,
    pub message_buffer: usize,
    pub health_interval_sec: u64,
    pub auto_reconnect: bool,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub stop_attempts: u32,
    pub stop_retry_delay_ms: u64,
    pub stop_cooldown_ms: u64,
    /// How long a stop waits for the device to report "off".
    pub confirm_timeout_ms: u64,
    pub max_duration_minutes: f64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct UsageSection {
    pub history_limit: usize,
    pub utc_offset_hours: i8,
}

#[derive(Debug, Deserialize)]
pub struct PredictionSection {
    pub url: String,
    #[serde(default = "default_prediction_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub features: Option<Vec<f64>>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WebSection {
    pub port: u16,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

const DEFAULT_BROKERS: &[&str] = &[
    "ws://217.182.210.54:8080/mqtt",
    "wss://broker.emqx.io:8084/mqtt",
    "wss://mqtt.eclipseprojects.io:443/mqtt",
];

/// rumqttc rejects keep-alives under five seconds.
const MIN_KEEP_ALIVE_SEC: u64 = 5;

/// One day.
const MAX_SESSION_MINUTES: f64 = 1_440.0;

fn default_keep_alive_sec() -> u64 {
    30
}

fn default_prediction_timeout_ms() -> u64 {
    15_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: DeviceSection::default(),
            brokers: DEFAULT_BROKERS
                .iter()
                .map(|url| BrokerEntry {
                    url: (*url).to_string(),
                    client_id: None,
                    keep_alive_sec: default_keep_alive_sec(),
                })
                .collect(),
            connection: ConnectionSection::default(),
            session: SessionSection::default(),
            usage: UsageSection::default(),
            prediction: None,
            web: WebSection::default(),
        }
    }
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            id: "PulsarInfinite".to_string(),
            flow_rate_lpm: 15.0,
            retain_commands: true,
        }
    }
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            connect_timeout_ms: 10_000,
            retry_delay_ms: 2_000,
            message_buffer: 10,
            health_interval_sec: 10,
            auto_reconnect: true,
        }
    }
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            stop_attempts: 2,
            stop_retry_delay_ms: 500,
            stop_cooldown_ms: 1_000,
            confirm_timeout_ms: 5_000,
            max_duration_minutes: 180.0,
        }
    }
}

impl Default for UsageSection {
    fn default() -> Self {
        Self {
            history_limit: 10_000,
            utc_offset_hours: 0,
        }
    }
}

impl Default for WebSection {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate every section. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_device(&mut errors);
        self.validate_brokers(&mut errors);
        self.validate_connection(&mut errors);
        self.validate_session(&mut errors);
        self.validate_usage(&mut errors);
        self.validate_prediction(&mut errors);

        if self.web.port == 0 {
            errors.push("web: port must be non-zero".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_device(&self, errors: &mut Vec<String>) {
        let d = &self.device;
        if d.id.trim().is_empty() {
            errors.push("device: id is empty".to_string());
        } else if d.id.contains(['/', '+', '#']) {
            errors.push(format!(
                "device: id '{}' must not contain '/', '+' or '#'",
                d.id
            ));
        }
        if !d.flow_rate_lpm.is_finite() || d.flow_rate_lpm <= 0.0 {
            errors.push(format!(
                "device: flow_rate_lpm must be positive, got {}",
                d.flow_rate_lpm
            ));
        }
    }

    fn validate_brokers(&self, errors: &mut Vec<String>) {
        if self.brokers.is_empty() {
            errors.push("brokers: at least one [[brokers]] entry is required".to_string());
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for (i, b) in self.brokers.iter().enumerate() {
            let ctx = || {
                if b.url.is_empty() {
                    format!("brokers[{i}]")
                } else {
                    format!("broker '{}'", b.url)
                }
            };

            if let Err(e) = BrokerEndpoint::parse(&b.url) {
                errors.push(format!("{}: {e}", ctx()));
            } else if !seen.insert(&b.url) {
                errors.push(format!("{}: duplicate url", ctx()));
            }

            if b.keep_alive_sec < MIN_KEEP_ALIVE_SEC {
                errors.push(format!(
                    "{}: keep_alive_sec must be at least {MIN_KEEP_ALIVE_SEC}, got {}",
                    ctx(),
                    b.keep_alive_sec
                ));
            }
            if b.client_id.as_deref().is_some_and(|id| id.trim().is_empty()) {
                errors.push(format!("{}: client_id is empty", ctx()));
            }
        }
    }

    fn validate_connection(&self, errors: &mut Vec<String>) {
        let c = &self.connection;
        if c.max_retries == 0 {
            errors.push("connection: max_retries must be at least 1".to_string());
        }
        if c.connect_timeout_ms == 0 {
            errors.push("connection: connect_timeout_ms must be positive".to_string());
        }
        if c.message_buffer == 0 {
            errors.push("connection: message_buffer must be at least 1".to_string());
        }
        if c.health_interval_sec == 0 {
            errors.push("connection: health_interval_sec must be positive".to_string());
        }
    }

    fn validate_session(&self, errors: &mut Vec<String>) {
        let s = &self.session;
        if s.stop_attempts == 0 {
            errors.push("session: stop_attempts must be at least 1".to_string());
        }
        if !s.max_duration_minutes.is_finite() || s.max_duration_minutes <= 0.0 {
            errors.push(format!(
                "session: max_duration_minutes must be positive, got {}",
                s.max_duration_minutes
            ));
        } else if s.max_duration_minutes > MAX_SESSION_MINUTES {
            errors.push(format!(
                "session: max_duration_minutes must be at most {MAX_SESSION_MINUTES}, got {}",
                s.max_duration_minutes
            ));
        }
        if s.confirm_timeout_ms == 0 {
            errors.push("session: confirm_timeout_ms must be at least 1".to_string());
        }
    }

    fn validate_usage(&self, errors: &mut Vec<String>) {
        let u = &self.usage;
        if u.history_limit == 0 {
            errors.push("usage: history_limit must be at least 1".to_string());
        }
        if !(-12..=14).contains(&u.utc_offset_hours) {
            errors.push(format!(
                "usage: utc_offset_hours {} out of range [-12, 14]",
                u.utc_offset_hours
            ));
        }
    }

    fn validate_prediction(&self, errors: &mut Vec<String>) {
        let Some(p) = &self.prediction else { return };
        if !(p.url.starts_with("http://") || p.url.starts_with("https://")) {
            errors.push(format!(
                "prediction: url '{}' must start with http:// or https://",
                p.url
            ));
        }
        if p.timeout_ms == 0 {
            errors.push("prediction: timeout_ms must be positive".to_string());
        }
        if let Some(features) = &p.features {
            if features.len() != FEATURE_COUNT {
                errors.push(format!(
                    "prediction: features must have {FEATURE_COUNT} values, got {}",
                    features.len()
                ));
            } else if features.iter().any(|f| !f.is_finite()) {
                errors.push("prediction: features must be finite numbers".to_string());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Derived settings
// ---------------------------------------------------------------------------

impl Config {
    /// Broker table in failover order. Entries without a client id get
    /// `<device>_<random>`.
    pub fn endpoints(&self) -> Result<Vec<BrokerEndpoint>> {
        self.brokers
            .iter()
            .map(|b| {
                let client_id = b.client_id.clone().unwrap_or_else(|| {
                    format!("{}_{}", self.device.id, uuid::Uuid::new_v4().simple())
                });
                Ok(BrokerEndpoint::parse(&b.url)
                    .with_context(|| format!("broker '{}'", b.url))?
                    .with_client_id(client_id)
                    .with_keep_alive(Duration::from_secs(b.keep_alive_sec)))
            })
            .collect()
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        let c = &self.connection;
        ConnectionSettings {
            max_retries: c.max_retries,
            connect_timeout: Duration::from_millis(c.connect_timeout_ms),
            retry_delay: Duration::from_millis(c.retry_delay_ms),
            message_buffer: c.message_buffer,
            health_interval: Duration::from_secs(c.health_interval_sec),
            auto_reconnect: c.auto_reconnect,
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        let s = &self.session;
        SessionSettings {
            stop_attempts: s.stop_attempts,
            stop_retry_delay: Duration::from_millis(s.stop_retry_delay_ms),
            stop_cooldown: Duration::from_millis(s.stop_cooldown_ms),
            confirm_timeout: Duration::from_millis(s.confirm_timeout_ms),
            max_duration_minutes: s.max_duration_minutes,
            flow_rate_lpm: self.device.flow_rate_lpm,
        }
    }

    pub fn utc_offset(&self) -> Result<UtcOffset> {
        UtcOffset::from_hms(self.usage.utc_offset_hours, 0, 0)
            .with_context(|| format!("utc_offset_hours {}", self.usage.utc_offset_hours))
    }

    pub fn prediction_features(&self) -> Features {
        self.prediction
            .as_ref()
            .and_then(|p| p.features.as_deref())
            .and_then(|f| Features::try_from(f).ok())
            .unwrap_or(DEFAULT_FEATURES)
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Like [`load`], but a missing file yields the built-in defaults.
pub fn load_or_default(path: &str) -> Result<Config> {
    if Path::new(path).exists() {
        return load(path);
    }
    warn!(path, "config file not found, using built-in defaults");
    let config = Config::default();
    config.validate().context("built-in defaults")?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
