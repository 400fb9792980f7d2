//! # Application Configuration
//!
//! Loads the device configuration from `~/.config/scorch/config.toml`. On first
//! start a default file is written so the device has something to edit.
//! `SCORCH_CONFIG` points at an alternative file.
//!
//! All other persisted state (stored credential, imported identities) lives in
//! the same directory as the configuration file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

const CONFIG_DIR: &str = ".config/scorch";
const CONFIG_FILE: &str = "config.toml";
const CONFIG_ENV: &str = "SCORCH_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to access configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Complete device configuration as stored on disk.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    pub device: DeviceConfig,
    pub provisioning: ProvisioningConfig,
    pub identity: IdentityConfig,
    pub topics: TopicConfig,
    pub telemetry: TelemetryConfig,
    pub shadow: ShadowConfig,
    pub actuator: ActuatorConfig,
}

/// MQTT broker endpoint. The device always authenticates with its client
/// certificate, so there are no username/password fields.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    /// Root CA used to verify the broker. Relative paths resolve against the
    /// configuration directory.
    pub ca_path: PathBuf,
    pub keep_alive_secs: u64,
    pub channel_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "a3g5gcx3s4m2ka-ats.iot.us-east-1.amazonaws.com".to_string(),
            port: 8883,
            ca_path: PathBuf::from("AmazonRootCA1.pem"),
            keep_alive_secs: 30,
            channel_capacity: 64,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    /// Stable device identifier reported in every telemetry payload
    pub device_id: String,
    pub device_name: String,
    /// Thing name used to build the shadow topics
    pub thing_name: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_id: uuid::Uuid::new_v4().to_string(),
            device_name: default_device_name(),
            thing_name: "scorch-device".to_string(),
        }
    }
}

fn default_device_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "scorch".to_string())
}

/// Static certificate signing request attributes plus the policy attached to
/// freshly issued certificates.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// Base URL of the certificate issuance service
    pub endpoint: String,
    pub common_name: String,
    pub country_name: String,
    pub organization_name: String,
    pub organizational_unit_name: String,
    pub policy_name: String,
    /// Delay between a successful policy attachment and the first connect
    pub connect_delay_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://provisioning.example.com".to_string(),
            common_name: "IoTDemo".to_string(),
            country_name: "TR".to_string(),
            organization_name: "Deloitte".to_string(),
            organizational_unit_name: "Berk".to_string(),
            policy_name: "IoTDemoPolicy".to_string(),
            connect_delay_ms: 2000,
            request_timeout_secs: 30,
        }
    }
}

impl ProvisioningConfig {
    pub fn connect_delay(&self) -> Duration {
        Duration::from_millis(self.connect_delay_ms)
    }
}

/// Where bundled identities are looked up before falling back to issuance.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct IdentityConfig {
    pub bundle_dir: PathBuf,
    pub bundle_extension: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            bundle_dir: PathBuf::from("bundle"),
            bundle_extension: "pem".to_string(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct TopicConfig {
    pub battery: String,
    pub gyroscope: String,
    pub accelerometer: String,
    pub slider: String,
    pub torch: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            battery: "batteryLevel".to_string(),
            gyroscope: "gyroData".to_string(),
            accelerometer: "accelerometerData".to_string(),
            slider: "slider".to_string(),
            torch: "torch".to_string(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct TelemetryConfig {
    pub battery_interval_ms: u64,
    pub gyroscope_interval_ms: u64,
    pub accelerometer_interval_ms: u64,
    /// sysfs power supply directory, e.g. /sys/class/power_supply/BAT0
    pub battery_path: PathBuf,
    /// IIO device directory exposing in_anglvel_* attributes
    pub gyroscope_path: PathBuf,
    /// IIO device directory exposing in_accel_* attributes
    pub accelerometer_path: PathBuf,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            battery_interval_ms: 10_000,
            gyroscope_interval_ms: 500,
            accelerometer_interval_ms: 1_000,
            battery_path: PathBuf::from("/sys/class/power_supply/BAT0"),
            gyroscope_path: PathBuf::from("/sys/bus/iio/devices/iio:device0"),
            accelerometer_path: PathBuf::from("/sys/bus/iio/devices/iio:device1"),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ShadowConfig {
    pub poll_interval_ms: u64,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10_000,
        }
    }
}

impl ShadowConfig {
    pub fn get_topic(thing_name: &str) -> String {
        format!("$aws/things/{}/shadow/get", thing_name)
    }

    pub fn get_accepted_topic(thing_name: &str) -> String {
        format!("$aws/things/{}/shadow/get/accepted", thing_name)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ActuatorConfig {
    /// LED class device used as torch, e.g. /sys/class/leds/flash
    pub torch_led: Option<PathBuf>,
    /// Video capture device opened on a camera request
    pub camera_device: Option<PathBuf>,
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            torch_led: None,
            camera_device: Some(PathBuf::from("/dev/video0")),
        }
    }
}

impl AppConfig {
    /// Directory holding the configuration and all persisted device state.
    pub fn config_dir() -> PathBuf {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => PathBuf::from(path)
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
            None => {
                let mut base = get_home_dir();
                base.push(CONFIG_DIR);
                base
            }
        }
    }

    pub fn config_path() -> PathBuf {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => PathBuf::from(path),
            None => Self::config_dir().join(CONFIG_FILE),
        }
    }

    /// Writes a default configuration if none exists yet and returns the
    /// loaded configuration.
    pub async fn ensure_default_config() -> Result<Self, ConfigError> {
        let path = Self::config_path();
        let exists = tokio::fs::try_exists(&path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            })?;

        if !exists {
            info!("Creating default configuration at {}", path.display());
            let config = Self::default();
            config.save_to(&path).await?;
            return Ok(config);
        }

        Self::load_from(&path).await
    }

    pub async fn load_from(path: &Path) -> Result<Self, ConfigError> {
        debug!("Loading configuration from {}", path.display());
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(toml::from_str(&content)?)
    }

    pub async fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| ConfigError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(path, content)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Resolves a configured path against the configuration directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Self::config_dir().join(path)
        }
    }
}

fn get_home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn saved_config_loads_back_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = AppConfig::default();
        config.device.thing_name = "berksiphone".to_string();
        config.actuator.torch_led = Some(PathBuf::from("/sys/class/leds/flash"));
        config.save_to(&path).await.unwrap();

        let loaded = AppConfig::load_from(&path).await.unwrap();
        assert_eq!(loaded, config);
    }

    #[tokio::test]
    async fn missing_sections_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        tokio::fs::write(&path, "[broker]\nhost = \"localhost\"\n")
            .await
            .unwrap();

        let loaded = AppConfig::load_from(&path).await.unwrap();
        assert_eq!(loaded.broker.host, "localhost");
        assert_eq!(loaded.broker.port, 8883);
        assert_eq!(loaded.topics.battery, "batteryLevel");
        assert_eq!(loaded.provisioning.connect_delay(), Duration::from_secs(2));
    }

    #[test]
    fn shadow_topics_follow_thing_name() {
        assert_eq!(
            ShadowConfig::get_topic("berksiphone"),
            "$aws/things/berksiphone/shadow/get"
        );
        assert_eq!(
            ShadowConfig::get_accepted_topic("berksiphone"),
            "$aws/things/berksiphone/shadow/get/accepted"
        );
    }
}
