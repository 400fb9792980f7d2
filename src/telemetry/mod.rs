//! # Telemetry
//!
//! Periodic sensor publishing plus the manual slider value.
//!
//! ```text
//! telemetry/
//! ├── sensors.rs    - sysfs / IIO backed sensor sources
//! └── publisher.rs  - per-sensor timer tasks with start/stop handles
//! ```
//!
//! Every sensor payload is a flat JSON object with the reading fields plus
//! `date`, `deviceId` and `deviceName`. A payload that cannot be serialized is
//! replaced by the literal `error`.

pub mod publisher;
pub mod sensors;

use chrono::{DateTime, Local};
use serde::{Serialize, Serializer};
use serde_json::{json, Value};
use std::fmt;
use thiserror::Error;
use tracing::warn;

use crate::config::DeviceConfig;

pub use publisher::{PublisherHandle, StartOutcome, TelemetryPublisher};
pub use sensors::{IioMotionSensor, SensorSource, SysfsBattery};

/// Payload sent in place of a reading that failed to serialize
pub const ERROR_PAYLOAD: &[u8] = b"error";

/// `yyyy-MMM-dd HH:mm:ss` in local time
pub const DATE_FORMAT: &str = "%Y-%b-%d %H:%M:%S";

#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Reading did not encode to a JSON object")]
    NotAnObject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorKind {
    Battery,
    Gyroscope,
    Accelerometer,
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            SensorKind::Battery => "Battery",
            SensorKind::Gyroscope => "Gyroscope",
            SensorKind::Accelerometer => "Accelerometer",
        };
        f.write_str(name)
    }
}

/// One sample, serialized with the field names the backend expects.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SensorReading {
    Battery {
        /// Charge as fraction 0..1, sent as a string
        #[serde(rename = "batteryLevel", serialize_with = "level_as_string")]
        level: f32,
    },
    Gyroscope {
        #[serde(rename = "gyroscopeX")]
        x: f64,
        #[serde(rename = "gyroscopeY")]
        y: f64,
        #[serde(rename = "gyroscopeZ")]
        z: f64,
    },
    Accelerometer {
        #[serde(rename = "accelerometerX")]
        x: f64,
        #[serde(rename = "accelerometerY")]
        y: f64,
        #[serde(rename = "accelerometerZ")]
        z: f64,
    },
}

fn level_as_string<S: Serializer>(level: &f32, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&level.to_string())
}

/// Identity fields attached to every published payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_id: String,
    pub device_name: String,
}

impl From<&DeviceConfig> for DeviceInfo {
    fn from(config: &DeviceConfig) -> Self {
        Self {
            device_id: config.device_id.clone(),
            device_name: config.device_name.clone(),
        }
    }
}

fn try_encode<T: Serialize>(
    body: &T,
    device: &DeviceInfo,
    now: DateTime<Local>,
) -> Result<Vec<u8>, SerializationError> {
    let Value::Object(mut fields) = serde_json::to_value(body)? else {
        return Err(SerializationError::NotAnObject);
    };
    fields.insert("date".to_string(), Value::from(now.format(DATE_FORMAT).to_string()));
    fields.insert("deviceId".to_string(), Value::from(device.device_id.clone()));
    fields.insert("deviceName".to_string(), Value::from(device.device_name.clone()));
    Ok(serde_json::to_vec(&fields)?)
}

/// Encodes a reading with the device fields. Never fails: an unencodable
/// body yields [`ERROR_PAYLOAD`].
pub fn encode_payload<T: Serialize>(body: &T, device: &DeviceInfo, now: DateTime<Local>) -> Vec<u8> {
    try_encode(body, device, now).unwrap_or_else(|e| {
        warn!("Failed to encode telemetry payload: {}", e);
        ERROR_PAYLOAD.to_vec()
    })
}

/// Slider payload: the raw value plus device id and name, without a date.
pub fn encode_slider(value: f32, device: &DeviceInfo) -> Vec<u8> {
    let body = json!({
        "payload": value,
        "deviceId": device.device_id,
        "deviceName": device.device_name,
    });
    serde_json::to_vec(&body).unwrap_or_else(|e| {
        warn!("Failed to encode slider payload: {}", e);
        ERROR_PAYLOAD.to_vec()
    })
}
