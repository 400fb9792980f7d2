//! Shadow polling and torch control task.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::actuator::DeviceActuator;
use super::{decode_shadow, decode_torch, encode_torch, DesiredAction, FieldResult, ShadowDecode};
use crate::config::ShadowConfig;
use crate::mqtt::{InboundMessage, MqttSession, SessionError, DEVICE_QOS};

const EMPTY_DOCUMENT: &[u8] = b"{}";

struct RunningReactor {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// Subscribes to the accepted shadow topic and the torch topic, requests the
/// shadow periodically and applies the desired state.
pub struct ShadowReactor {
    session: Arc<dyn MqttSession>,
    actuator: Arc<dyn DeviceActuator>,
    get_topic: String,
    accepted_topic: String,
    torch_topic: String,
    poll_interval: Duration,
    running: Mutex<Option<RunningReactor>>,
}

impl ShadowReactor {
    pub fn new(
        session: Arc<dyn MqttSession>,
        actuator: Arc<dyn DeviceActuator>,
        thing_name: &str,
        torch_topic: &str,
        config: &ShadowConfig,
    ) -> Self {
        Self {
            session,
            actuator,
            get_topic: ShadowConfig::get_topic(thing_name),
            accepted_topic: ShadowConfig::get_accepted_topic(thing_name),
            torch_topic: torch_topic.to_string(),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            running: Mutex::new(None),
        }
    }

    /// Returns false if the reactor was already running. A reactor whose
    /// subscriptions were closed by the session counts as stopped.
    pub async fn start(&self) -> Result<bool, SessionError> {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            debug!("Shadow reactor already running");
            return Ok(false);
        }

        let shadow_rx = self.session.subscribe(&self.accepted_topic, DEVICE_QOS).await?;
        let torch_rx = match self.session.subscribe(&self.torch_topic, DEVICE_QOS).await {
            Ok(rx) => rx,
            Err(e) => {
                self.unsubscribe(&self.accepted_topic).await;
                return Err(e);
            }
        };

        info!(
            "Shadow reactor started, polling {} every {:?}",
            self.get_topic, self.poll_interval
        );
        let token = CancellationToken::new();
        let task = tokio::spawn(run_reactor(
            self.session.clone(),
            self.actuator.clone(),
            self.get_topic.clone(),
            self.poll_interval,
            shadow_rx,
            torch_rx,
            token.clone(),
        ));
        *running = Some(RunningReactor { token, task });
        Ok(true)
    }

    /// Stops polling and unsubscribes from both topics.
    pub async fn stop(&self) {
        let Some(reactor) = self.running.lock().await.take() else {
            return;
        };
        reactor.token.cancel();
        if let Err(e) = reactor.task.await {
            error!("Shadow reactor ended abnormally: {}", e);
        }
        self.unsubscribe(&self.accepted_topic).await;
        self.unsubscribe(&self.torch_topic).await;
        info!("Shadow reactor stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.task.is_finished())
    }

    /// Publishes the torch state on the torch topic.
    pub async fn publish_torch(&self, on: bool) -> Result<(), SessionError> {
        self.session
            .publish(&self.torch_topic, encode_torch(on).as_bytes().to_vec(), DEVICE_QOS)
            .await
    }

    async fn unsubscribe(&self, topic: &str) {
        if let Err(e) = self.session.unsubscribe(topic).await {
            warn!("Failed to unsubscribe from {}: {}", topic, e);
        }
    }
}

async fn run_reactor(
    session: Arc<dyn MqttSession>,
    actuator: Arc<dyn DeviceActuator>,
    get_topic: String,
    poll_interval: Duration,
    mut shadow_rx: mpsc::Receiver<InboundMessage>,
    mut torch_rx: mpsc::Receiver<InboundMessage>,
    token: CancellationToken,
) {
    let mut poll = tokio::time::interval(poll_interval);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = poll.tick() => {
                if let Err(e) = session.publish(&get_topic, EMPTY_DOCUMENT.to_vec(), DEVICE_QOS).await {
                    warn!("Shadow request failed: {}", e);
                }
            }
            message = shadow_rx.recv() => {
                let Some(message) = message else {
                    warn!("Shadow subscription closed, reactor stopping");
                    break;
                };
                debug!("Shadow document: {}", message);
                apply_shadow(actuator.as_ref(), &message.payload).await;
            }
            message = torch_rx.recv() => {
                let Some(message) = message else {
                    warn!("Torch subscription closed, reactor stopping");
                    break;
                };
                apply_torch(actuator.as_ref(), &message.payload).await;
            }
        }
    }
}

/// Decodes a shadow document and applies each field that decoded.
pub async fn apply_shadow(actuator: &dyn DeviceActuator, payload: &[u8]) -> ShadowDecode {
    let decoded = decode_shadow(payload);
    for (field, result) in [
        ("flashlight", &decoded.flashlight),
        ("camera", &decoded.camera),
        ("alertmessage", &decoded.alert),
    ] {
        apply_field(actuator, field, result).await;
    }
    decoded
}

async fn apply_field(actuator: &dyn DeviceActuator, field: &str, result: &FieldResult) {
    let action = match result {
        Ok(action) => action,
        Err(e) => {
            warn!("Skipping {}: {}", field, e);
            return;
        }
    };

    let outcome = match action {
        DesiredAction::TorchEnabled => actuator.set_torch(true).await,
        DesiredAction::TorchDisabled => actuator.set_torch(false).await,
        DesiredAction::OpenCamera => actuator.open_camera().await,
        DesiredAction::ShowAlert(message) => actuator.show_alert(message).await,
        DesiredAction::None => return,
    };

    match outcome {
        Ok(()) => info!("{}: {}", field, action),
        Err(e) => warn!("{}: {}", field, e),
    }
}

pub async fn apply_torch(actuator: &dyn DeviceActuator, payload: &[u8]) -> bool {
    let on = decode_torch(payload);
    match actuator.set_torch(on).await {
        Ok(()) => info!("torch: {}", if on { "on" } else { "off" }),
        Err(e) => warn!("torch: {}", e),
    }
    on
}
