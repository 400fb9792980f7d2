//! Timer driven sensor publishing
//!
//! Each sensor gets its own task sampling on a fixed interval and publishing
//! at-most-once. A task runs until its [`PublisherHandle`] is stopped; publish
//! and sampling failures are logged and the next tick proceeds.

use chrono::Local;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::sensors::SensorSource;
use super::{encode_payload, encode_slider, DeviceInfo, SensorKind};
use crate::config::{TelemetryConfig, TopicConfig};
use crate::mqtt::{MqttSession, DEVICE_QOS};

/// Slider values above this trigger the override notice
pub const SLIDER_LIMIT: f32 = 30.0;
pub const SLIDER_OVERRIDE: f32 = 29.0;
pub const SLIDER_NOTICE: &str = "Slider Went Over 30.0. Override to 29.0.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
    Unavailable,
}

/// Running publisher task.
pub struct PublisherHandle {
    kind: SensorKind,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl PublisherHandle {
    pub fn kind(&self) -> SensorKind {
        self.kind
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            error!("{} publisher ended abnormally: {}", self.kind, e);
        }
        info!("{} publisher stopped", self.kind);
    }
}

struct PublisherSpec {
    topic: String,
    interval: Duration,
}

pub struct TelemetryPublisher {
    session: Arc<dyn MqttSession>,
    device: DeviceInfo,
    topics: TopicConfig,
    telemetry: TelemetryConfig,
    sources: HashMap<SensorKind, Arc<dyn SensorSource>>,
    running: Mutex<HashMap<SensorKind, PublisherHandle>>,
}

impl TelemetryPublisher {
    pub fn new(
        session: Arc<dyn MqttSession>,
        device: DeviceInfo,
        topics: TopicConfig,
        telemetry: TelemetryConfig,
    ) -> Self {
        Self {
            session,
            device,
            topics,
            telemetry,
            sources: HashMap::new(),
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_source(mut self, source: Arc<dyn SensorSource>) -> Self {
        self.sources.insert(source.kind(), source);
        self
    }

    fn spec(&self, kind: SensorKind) -> PublisherSpec {
        let (topic, interval_ms) = match kind {
            SensorKind::Battery => (&self.topics.battery, self.telemetry.battery_interval_ms),
            SensorKind::Gyroscope => (&self.topics.gyroscope, self.telemetry.gyroscope_interval_ms),
            SensorKind::Accelerometer => (
                &self.topics.accelerometer,
                self.telemetry.accelerometer_interval_ms,
            ),
        };
        PublisherSpec {
            topic: topic.clone(),
            interval: Duration::from_millis(interval_ms.max(1)),
        }
    }

    /// Starts publishing `kind`. Unavailable sensors are reported once and
    /// not started.
    pub async fn start(&self, kind: SensorKind) -> StartOutcome {
        let mut running = self.running.lock().await;
        if running.get(&kind).is_some_and(PublisherHandle::is_running) {
            debug!("{} publisher already running", kind);
            return StartOutcome::AlreadyRunning;
        }

        let Some(source) = self.sources.get(&kind).cloned() else {
            warn!("{} not available.", kind);
            return StartOutcome::Unavailable;
        };
        if !source.is_available().await {
            warn!("{} not available.", kind);
            return StartOutcome::Unavailable;
        }

        let spec = self.spec(kind);
        info!(
            "Starting {} publisher on {} every {:?}",
            kind, spec.topic, spec.interval
        );

        let token = CancellationToken::new();
        let task = tokio::spawn(run_publisher(
            source,
            self.session.clone(),
            self.device.clone(),
            spec,
            token.clone(),
        ));
        running.insert(kind, PublisherHandle { kind, token, task });
        StartOutcome::Started
    }

    /// Returns false if the publisher was not running.
    pub async fn stop(&self, kind: SensorKind) -> bool {
        let handle = self.running.lock().await.remove(&kind);
        match handle {
            Some(handle) => {
                handle.stop().await;
                true
            }
            None => false,
        }
    }

    pub async fn stop_all(&self) {
        let handles: Vec<PublisherHandle> =
            self.running.lock().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.stop().await;
        }
    }

    pub async fn running(&self) -> Vec<SensorKind> {
        self.running
            .lock()
            .await
            .values()
            .filter(|h| h.is_running())
            .map(PublisherHandle::kind)
            .collect()
    }

    /// Publishes a manual value. Values above the limit also publish the
    /// override notice; the effective value is returned.
    pub async fn publish_slider(&self, value: f32) -> f32 {
        let topic = &self.topics.slider;
        publish_logged(
            self.session.as_ref(),
            topic,
            encode_slider(value, &self.device),
        )
        .await;

        if value > SLIDER_LIMIT {
            warn!("Slider has gone higher than {}. Please reduce.", SLIDER_LIMIT);
            publish_logged(self.session.as_ref(), topic, SLIDER_NOTICE.as_bytes().to_vec()).await;
            return SLIDER_OVERRIDE;
        }
        value
    }
}

async fn publish_logged(session: &dyn MqttSession, topic: &str, payload: Vec<u8>) {
    match session.publish(topic, payload, DEVICE_QOS).await {
        Ok(()) => debug!("Published to {}", topic),
        Err(e) => warn!("Publish to {} failed: {}", topic, e),
    }
}

async fn run_publisher(
    source: Arc<dyn SensorSource>,
    session: Arc<dyn MqttSession>,
    device: DeviceInfo,
    spec: PublisherSpec,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(spec.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                match source.sample().await {
                    Ok(reading) => {
                        let payload = encode_payload(&reading, &device, Local::now());
                        publish_logged(session.as_ref(), &spec.topic, payload).await;
                    }
                    Err(e) => warn!("{} sample failed: {}", source.kind(), e),
                }
            }
        }
    }
}
