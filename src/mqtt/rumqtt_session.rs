use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, Incoming, MqttOptions, Outgoing, QoS,
    TlsConfiguration, Transport,
};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{topic_matches, ConnectRequest, ConnectionStatus, InboundMessage, MqttSession, SessionError};
use crate::config::BrokerConfig;
use crate::persistence::IdentityVault;

/// ALPN protocol required by AWS IoT for MQTT over port 443
const AWS_MQTT_ALPN: &[u8] = b"x-amzn-mqtt-ca";
const SUBSCRIPTION_BUFFER: usize = 32;
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

type Subscribers = Arc<StdMutex<HashMap<String, Vec<mpsc::Sender<InboundMessage>>>>>;

struct ActiveConnection {
    client: AsyncClient,
    event_loop: JoinHandle<()>,
    status_tx: mpsc::Sender<ConnectionStatus>,
}

/// [`MqttSession`] over rumqttc, authenticating with the device certificate
/// from the identity vault.
pub struct RumqttSession {
    broker: BrokerConfig,
    ca_path: PathBuf,
    vault: Arc<dyn IdentityVault>,
    active: Mutex<Option<ActiveConnection>>,
    subscribers: Subscribers,
}

impl RumqttSession {
    pub fn new(broker: BrokerConfig, ca_path: PathBuf, vault: Arc<dyn IdentityVault>) -> Self {
        Self {
            broker,
            ca_path,
            vault,
            active: Mutex::new(None),
            subscribers: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    async fn mqtt_options(&self, request: &ConnectRequest) -> Result<MqttOptions, SessionError> {
        let identity = self
            .vault
            .load(&request.certificate_id)
            .await?
            .ok_or_else(|| SessionError::MissingIdentity(request.certificate_id.clone()))?;

        let ca = tokio::fs::read(&self.ca_path).await.map_err(|e| {
            SessionError::CaUnavailable(format!("{}: {}", self.ca_path.display(), e))
        })?;

        let alpn = (self.broker.port == 443).then(|| vec![AWS_MQTT_ALPN.to_vec()]);

        let mut options =
            MqttOptions::new(request.client_id.clone(), self.broker.host.clone(), self.broker.port);
        options
            .set_keep_alive(Duration::from_secs(self.broker.keep_alive_secs))
            .set_clean_session(request.clean_session)
            .set_transport(Transport::Tls(TlsConfiguration::Simple {
                ca,
                alpn,
                client_auth: Some((
                    identity.certificate_pem.into_bytes(),
                    identity.private_key_pem.into_bytes(),
                )),
            }));
        Ok(options)
    }

    /// Clone of the active client, so requests are awaited without holding
    /// the connection lock.
    async fn client(&self) -> Result<AsyncClient, SessionError> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|connection| connection.client.clone())
            .ok_or(SessionError::NotConnected)
    }
}

/// Drops every subscriber sender. Receivers held by consumers observe the
/// closed channel and know the subscription is gone.
pub(crate) fn close_subscriptions(subscribers: &Subscribers) {
    match subscribers.lock() {
        Ok(mut subscribers) => {
            if !subscribers.is_empty() {
                debug!("Closing {} subscriptions", subscribers.len());
            }
            subscribers.clear();
        }
        Err(_) => error!("Subscriber registry poisoned"),
    }
}

/// Maps a terminal event loop error onto the connection status reported to
/// observers.
pub(crate) fn classify_error(err: &ConnectionError) -> ConnectionStatus {
    match err {
        ConnectionError::ConnectionRefused(_) => ConnectionStatus::Refused,
        ConnectionError::MqttState(_) | ConnectionError::NotConnAck(_) => {
            ConnectionStatus::ProtocolError
        }
        _ => ConnectionStatus::ConnectionError,
    }
}

/// Fans an inbound publish out to every subscription whose filter matches.
/// Receivers that went away are pruned.
pub(crate) fn dispatch(subscribers: &Subscribers, message: InboundMessage) {
    let Ok(mut subscribers) = subscribers.lock() else {
        error!("Subscriber registry poisoned, dropping message on {}", message.topic);
        return;
    };

    let mut delivered = false;
    for (filter, senders) in subscribers.iter_mut() {
        if !topic_matches(filter, &message.topic) {
            continue;
        }
        senders.retain(|sender| match sender.try_send(message.clone()) {
            Ok(()) => {
                delivered = true;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Subscriber for {} is full, message dropped", filter);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    if !delivered {
        debug!("No subscriber took message on {}", message.topic);
    }
}

async fn run_event_loop(
    mut event_loop: rumqttc::EventLoop,
    status_tx: mpsc::Sender<ConnectionStatus>,
    subscribers: Subscribers,
) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    info!("Broker accepted connection");
                    let _ = status_tx.send(ConnectionStatus::Connected).await;
                } else {
                    warn!("Broker refused connection: {:?}", ack.code);
                    let _ = status_tx.send(ConnectionStatus::Refused).await;
                    break;
                }
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                debug!("Received {} bytes on {}", publish.payload.len(), publish.topic);
                dispatch(
                    &subscribers,
                    InboundMessage::new(publish.topic.clone(), publish.payload.to_vec()),
                );
            }
            Ok(Event::Incoming(Incoming::Disconnect)) | Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                info!("MQTT connection closed");
                let _ = status_tx.send(ConnectionStatus::Disconnected).await;
                break;
            }
            Ok(event) => debug!("MQTT event: {:?}", event),
            Err(e) => {
                let status = classify_error(&e);
                error!("MQTT connection failed ({}): {}", status, e);
                let _ = status_tx.send(status).await;
                break;
            }
        }
    }
    close_subscriptions(&subscribers);
}

#[async_trait]
impl MqttSession for RumqttSession {
    async fn connect(
        &self,
        request: ConnectRequest,
        status_tx: mpsc::Sender<ConnectionStatus>,
    ) -> Result<(), SessionError> {
        let mut active = self.active.lock().await;
        if let Some(connection) = active.as_ref() {
            if !connection.event_loop.is_finished() {
                return Err(SessionError::AlreadyConnected);
            }
        }

        // Clean sessions start without subscriptions on the broker side
        close_subscriptions(&self.subscribers);

        let options = self.mqtt_options(&request).await?;
        info!(
            client_id = %request.client_id,
            certificate_id = %request.certificate_id,
            "Connecting to {}:{}",
            self.broker.host,
            self.broker.port
        );

        let (client, event_loop) = AsyncClient::new(options, self.broker.channel_capacity);
        let _ = status_tx.send(ConnectionStatus::Connecting).await;

        let event_loop = tokio::spawn(run_event_loop(
            event_loop,
            status_tx.clone(),
            self.subscribers.clone(),
        ));

        *active = Some(ActiveConnection {
            client,
            event_loop,
            status_tx,
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), SessionError> {
        let Some(connection) = self.active.lock().await.take() else {
            debug!("Disconnect requested without an active connection");
            return Ok(());
        };

        close_subscriptions(&self.subscribers);

        if connection.event_loop.is_finished() {
            return Ok(());
        }

        if let Err(e) = connection.client.disconnect().await {
            warn!("Failed to request clean disconnect: {}", e);
        }

        let mut event_loop = connection.event_loop;
        if tokio::time::timeout(DISCONNECT_GRACE, &mut event_loop)
            .await
            .is_err()
        {
            warn!("Event loop did not stop in time, aborting it");
            event_loop.abort();
            let _ = connection
                .status_tx
                .send(ConnectionStatus::Disconnected)
                .await;
        }
        info!("Disconnected from broker");
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), SessionError> {
        let client = self.client().await?;
        client.publish(topic, qos, false, payload).await?;
        debug!("Published to {}", topic);
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        qos: QoS,
    ) -> Result<mpsc::Receiver<InboundMessage>, SessionError> {
        let client = self.client().await?;
        client.subscribe(topic, qos).await?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.entry(topic.to_string()).or_default().push(tx);
        }
        info!("Subscribed to {}", topic);
        Ok(rx)
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), SessionError> {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.remove(topic);
        }
        let client = self.client().await?;
        client.unsubscribe(topic).await?;
        info!("Unsubscribed from {}", topic);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{DeviceIdentity, MockIdentityVault};

    fn session(vault: MockIdentityVault) -> RumqttSession {
        RumqttSession::new(
            BrokerConfig::default(),
            PathBuf::from("/nonexistent/ca.pem"),
            Arc::new(vault),
        )
    }

    fn request() -> ConnectRequest {
        ConnectRequest {
            client_id: "client".to_string(),
            clean_session: true,
            certificate_id: "cert".to_string(),
        }
    }

    #[test]
    fn refused_connections_are_reported_as_refused() {
        let err = ConnectionError::ConnectionRefused(ConnectReturnCode::NotAuthorized);
        assert_eq!(classify_error(&err), ConnectionStatus::Refused);
    }

    #[test]
    fn transport_failures_are_connection_errors() {
        let err = ConnectionError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert_eq!(classify_error(&err), ConnectionStatus::ConnectionError);
        assert_eq!(
            classify_error(&ConnectionError::NetworkTimeout),
            ConnectionStatus::ConnectionError
        );
    }

    #[test]
    fn dispatch_reaches_matching_subscribers_only() {
        let subscribers: Subscribers = Arc::new(StdMutex::new(HashMap::new()));
        let (torch_tx, mut torch_rx) = mpsc::channel(4);
        let (shadow_tx, mut shadow_rx) = mpsc::channel(4);
        {
            let mut map = subscribers.lock().unwrap();
            map.insert("torch".to_string(), vec![torch_tx]);
            map.insert("$aws/things/+/shadow/get/accepted".to_string(), vec![shadow_tx]);
        }

        dispatch(&subscribers, InboundMessage::new("torch", "0"));

        assert_eq!(torch_rx.try_recv().unwrap().payload, b"0".to_vec());
        assert!(shadow_rx.try_recv().is_err());
    }

    #[test]
    fn dispatch_prunes_closed_receivers() {
        let subscribers: Subscribers = Arc::new(StdMutex::new(HashMap::new()));
        let (tx, rx) = mpsc::channel(4);
        subscribers
            .lock()
            .unwrap()
            .insert("torch".to_string(), vec![tx]);
        drop(rx);

        dispatch(&subscribers, InboundMessage::new("torch", "1"));

        assert!(subscribers.lock().unwrap()["torch"].is_empty());
    }

    #[tokio::test]
    async fn publishing_without_connection_fails() {
        let session = session(MockIdentityVault::new());
        let result = session.publish("torch", b"0".to_vec(), QoS::AtMostOnce).await;
        assert!(matches!(result, Err(SessionError::NotConnected)));
    }

    #[tokio::test]
    async fn connect_requires_stored_identity() {
        let mut vault = MockIdentityVault::new();
        vault.expect_load().times(1).returning(|_| Ok(None));
        let (tx, _rx) = mpsc::channel(4);

        let result = session(vault).connect(request(), tx).await;
        assert!(matches!(result, Err(SessionError::MissingIdentity(id)) if id == "cert"));
    }

    #[tokio::test]
    async fn connect_requires_broker_ca() {
        let mut vault = MockIdentityVault::new();
        vault.expect_load().returning(|_| {
            Ok(Some(DeviceIdentity {
                certificate_pem: "cert".to_string(),
                private_key_pem: "key".to_string(),
            }))
        });
        let (tx, _rx) = mpsc::channel(4);

        let result = session(vault).connect(request(), tx).await;
        assert!(matches!(result, Err(SessionError::CaUnavailable(_))));
    }

    #[tokio::test]
    async fn new_connect_closes_previous_subscriptions() {
        let mut vault = MockIdentityVault::new();
        vault.expect_load().times(1).returning(|_| Ok(None));
        let session = session(vault);

        let (stale_tx, mut stale_rx) = mpsc::channel(4);
        session
            .subscribers
            .lock()
            .unwrap()
            .insert("torch".to_string(), vec![stale_tx]);

        let (tx, _rx) = mpsc::channel(4);
        assert!(session.connect(request(), tx).await.is_err());

        assert!(stale_rx.recv().await.is_none());
        assert!(session.subscribers.lock().unwrap().is_empty());
    }

    #[test]
    fn closing_subscriptions_ends_receivers() {
        let subscribers: Subscribers = Arc::new(StdMutex::new(HashMap::new()));
        let (tx, mut rx) = mpsc::channel::<InboundMessage>(4);
        subscribers
            .lock()
            .unwrap()
            .insert("$aws/things/+/shadow/get/accepted".to_string(), vec![tx]);

        close_subscriptions(&subscribers);

        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn disconnect_without_connection_is_a_no_op() {
        let session = session(MockIdentityVault::new());
        assert!(session.disconnect().await.is_ok());
    }
}
