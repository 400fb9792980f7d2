//! # MQTT Session
//!
//! The transport seam between the device logic and the broker. Everything the
//! bootstrapper, the telemetry publishers and the shadow reactor need from MQTT
//! goes through the [`MqttSession`] trait:
//!
//! ```text
//! mqtt/
//! ├── message.rs          - Inbound message representation
//! └── rumqtt_session.rs   - rumqttc-backed session over mutual TLS
//! ```
//!
//! Connection progress is reported through a typed status channel handed to
//! [`MqttSession::connect`]; inbound messages are delivered through one
//! receiver per subscription. At most one connection is active per session
//! object.

pub mod message;
pub mod rumqtt_session;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use rumqttc::QoS;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::persistence::VaultError;

pub use message::InboundMessage;
pub use rumqtt_session::RumqttSession;

/// Delivery quality used for every publish and subscription of the device
pub const DEVICE_QOS: QoS = QoS::AtMostOnce;

/// Status of the single broker connection.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    #[default]
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Refused,
    ConnectionError,
    ProtocolError,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = match self {
            ConnectionStatus::Idle => "Idle",
            ConnectionStatus::Connecting => "Connecting...",
            ConnectionStatus::Connected => "Connected",
            ConnectionStatus::Disconnected => "Disconnected",
            ConnectionStatus::Refused => "Connection Refused",
            ConnectionStatus::ConnectionError => "Connection Error",
            ConnectionStatus::ProtocolError => "Protocol Error",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub client_id: String,
    pub clean_session: bool,
    pub certificate_id: String,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("A connection is already active")]
    AlreadyConnected,

    #[error("Not connected")]
    NotConnected,

    #[error("No identity stored for certificate {0}")]
    MissingIdentity(String),

    #[error("Identity vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("Failed to read broker CA: {0}")]
    CaUnavailable(String),

    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait MqttSession: Send + Sync {
    /// Starts connecting; progress arrives on `status_tx`.
    async fn connect(
        &self,
        request: ConnectRequest,
        status_tx: mpsc::Sender<ConnectionStatus>,
    ) -> Result<(), SessionError>;

    async fn disconnect(&self) -> Result<(), SessionError>;

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), SessionError>;

    async fn subscribe(
        &self,
        topic: &str,
        qos: QoS,
    ) -> Result<mpsc::Receiver<InboundMessage>, SessionError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), SessionError>;
}

/// MQTT topic filter matching with `+` and `#` wildcards.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_topics_match() {
        assert!(topic_matches("torch", "torch"));
        assert!(!topic_matches("torch", "torch/extra"));
        assert!(!topic_matches("gyroData", "batteryLevel"));
    }

    #[test]
    fn wildcards_match_levels() {
        assert!(topic_matches(
            "$aws/things/+/shadow/get/accepted",
            "$aws/things/berksiphone/shadow/get/accepted"
        ));
        assert!(topic_matches("$aws/things/#", "$aws/things/a/shadow/get"));
        assert!(!topic_matches("$aws/things/+", "$aws/things/a/shadow"));
    }

    #[test]
    fn status_texts_match_status_line() {
        assert_eq!(ConnectionStatus::Connecting.to_string(), "Connecting...");
        assert_eq!(ConnectionStatus::Refused.to_string(), "Connection Refused");
        assert_eq!(ConnectionStatus::ProtocolError.to_string(), "Protocol Error");
    }
}
