//! Broker endpoint table: the ordered list of brokers the connection manager
//! may dial. Position in the table is failover priority.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportHint {
    Tcp,
    Tls,
    Ws,
    Wss,
}

impl TransportHint {
    fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "mqtt" | "tcp" => Some(Self::Tcp),
            "mqtts" | "ssl" | "tls" => Some(Self::Tls),
            "ws" => Some(Self::Ws),
            "wss" => Some(Self::Wss),
            _ => None,
        }
    }

    fn default_port(self) -> u16 {
        match self {
            Self::Tcp => 1883,
            Self::Tls => 8883,
            Self::Ws => 80,
            Self::Wss => 443,
        }
    }

    pub fn is_websocket(self) -> bool {
        matches!(self, Self::Ws | Self::Wss)
    }
}

impl fmt::Display for TransportHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Tls => write!(f, "tls"),
            Self::Ws => write!(f, "ws"),
            Self::Wss => write!(f, "wss"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EndpointError {
    #[error("broker url '{0}' has no scheme (expected mqtt://, mqtts://, ws:// or wss://)")]
    MissingScheme(String),
    #[error("broker url '{url}' has unsupported scheme '{scheme}'")]
    UnsupportedScheme { url: String, scheme: String },
    #[error("broker url '{0}' has no host")]
    MissingHost(String),
    #[error("broker url '{url}' has invalid port '{port}'")]
    InvalidPort { url: String, port: String },
}

/// One entry of the endpoint table. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrokerEndpoint {
    pub url: String,
    pub transport: TransportHint,
    pub host: String,
    pub port: u16,
    pub client_id: String,
    #[serde(skip)]
    pub keep_alive: Duration,
}

impl BrokerEndpoint {
    /// Parse `scheme://host[:port][/path]`.
    pub fn parse(url: &str) -> Result<Self, EndpointError> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| EndpointError::MissingScheme(url.to_string()))?;
        let transport =
            TransportHint::from_scheme(scheme).ok_or_else(|| EndpointError::UnsupportedScheme {
                url: url.to_string(),
                scheme: scheme.to_string(),
            })?;

        let authority = rest.split('/').next().unwrap_or_default();
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port_str)) => {
                let port = port_str
                    .parse::<u16>()
                    .ok()
                    .filter(|p| *p != 0)
                    .ok_or_else(|| EndpointError::InvalidPort {
                        url: url.to_string(),
                        port: port_str.to_string(),
                    })?;
                (host, port)
            }
            None => (authority, transport.default_port()),
        };
        if host.trim().is_empty() {
            return Err(EndpointError::MissingHost(url.to_string()));
        }

        Ok(Self {
            url: url.to_string(),
            transport,
            host: host.to_string(),
            port,
            client_id: String::new(),
            keep_alive: Duration::from_secs(30),
        })
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }
}

impl fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_websocket_with_path() {
        let ep = BrokerEndpoint::parse("ws://217.182.210.54:8080/mqtt").unwrap();
        assert_eq!(ep.transport, TransportHint::Ws);
        assert_eq!(ep.host, "217.182.210.54");
        assert_eq!(ep.port, 8080);
    }

    #[test]
    fn parse_secure_websocket() {
        let ep = BrokerEndpoint::parse("wss://broker.emqx.io:8084/mqtt").unwrap();
        assert_eq!(ep.transport, TransportHint::Wss);
        assert_eq!(ep.host, "broker.emqx.io");
        assert_eq!(ep.port, 8084);
    }

    #[test]
    fn parse_default_ports() {
        assert_eq!(BrokerEndpoint::parse("mqtt://localhost").unwrap().port, 1883);
        assert_eq!(BrokerEndpoint::parse("mqtts://localhost").unwrap().port, 8883);
        assert_eq!(BrokerEndpoint::parse("ws://localhost/mqtt").unwrap().port, 80);
        assert_eq!(BrokerEndpoint::parse("wss://localhost/mqtt").unwrap().port, 443);
    }

    #[test]
    fn parse_tcp_alias() {
        let ep = BrokerEndpoint::parse("tcp://10.0.0.2:1884").unwrap();
        assert_eq!(ep.transport, TransportHint::Tcp);
        assert_eq!(ep.port, 1884);
    }

    #[test]
    fn parse_missing_scheme() {
        assert!(matches!(
            BrokerEndpoint::parse("localhost:1883"),
            Err(EndpointError::MissingScheme(_))
        ));
    }

    #[test]
    fn parse_unsupported_scheme() {
        assert!(matches!(
            BrokerEndpoint::parse("http://localhost"),
            Err(EndpointError::UnsupportedScheme { .. })
        ));
    }

    #[test]
    fn parse_missing_host() {
        assert!(matches!(
            BrokerEndpoint::parse("ws://:8080/mqtt"),
            Err(EndpointError::MissingHost(_))
        ));
    }

    #[test]
    fn parse_bad_port() {
        assert!(matches!(
            BrokerEndpoint::parse("mqtt://host:99999"),
            Err(EndpointError::InvalidPort { .. })
        ));
        assert!(matches!(
            BrokerEndpoint::parse("mqtt://host:0"),
            Err(EndpointError::InvalidPort { .. })
        ));
    }
}
