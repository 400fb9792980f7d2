//! Sensor sources backed by Linux sysfs.
//!
//! - battery: `<power_supply>/capacity` in percent
//! - motion: IIO `in_<channel>_{x,y,z}_raw` scaled by `in_<channel>_scale`

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use super::{SensorKind, SensorReading};

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unexpected value '{value}' in {path}")]
    Parse { path: PathBuf, value: String },
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait SensorSource: Send + Sync {
    fn kind(&self) -> SensorKind;

    /// Checked once before a publisher is started.
    async fn is_available(&self) -> bool;

    async fn sample(&self) -> Result<SensorReading, SensorError>;
}

async fn read_number(path: &Path) -> Result<f64, SensorError> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| SensorError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    let value = raw.trim();
    value.parse::<f64>().map_err(|_| SensorError::Parse {
        path: path.to_path_buf(),
        value: value.to_string(),
    })
}

pub struct SysfsBattery {
    capacity_path: PathBuf,
}

impl SysfsBattery {
    pub fn new(power_supply: &Path) -> Self {
        Self {
            capacity_path: power_supply.join("capacity"),
        }
    }
}

#[async_trait]
impl SensorSource for SysfsBattery {
    fn kind(&self) -> SensorKind {
        SensorKind::Battery
    }

    async fn is_available(&self) -> bool {
        tokio::fs::try_exists(&self.capacity_path)
            .await
            .unwrap_or(false)
    }

    async fn sample(&self) -> Result<SensorReading, SensorError> {
        let percent = read_number(&self.capacity_path).await?;
        let level = (percent / 100.0).clamp(0.0, 1.0) as f32;
        Ok(SensorReading::Battery { level })
    }
}

/// Three-axis IIO channel, either angular velocity or acceleration.
pub struct IioMotionSensor {
    device: PathBuf,
    channel: &'static str,
    kind: SensorKind,
}

impl IioMotionSensor {
    pub fn gyroscope(device: &Path) -> Self {
        Self {
            device: device.to_path_buf(),
            channel: "anglvel",
            kind: SensorKind::Gyroscope,
        }
    }

    pub fn accelerometer(device: &Path) -> Self {
        Self {
            device: device.to_path_buf(),
            channel: "accel",
            kind: SensorKind::Accelerometer,
        }
    }

    fn axis_path(&self, axis: char) -> PathBuf {
        self.device
            .join(format!("in_{}_{}_raw", self.channel, axis))
    }

    async fn scale(&self) -> Result<f64, SensorError> {
        let path = self.device.join(format!("in_{}_scale", self.channel));
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!("No scale attribute at {}, using raw values", path.display());
            return Ok(1.0);
        }
        read_number(&path).await
    }
}

#[async_trait]
impl SensorSource for IioMotionSensor {
    fn kind(&self) -> SensorKind {
        self.kind
    }

    async fn is_available(&self) -> bool {
        tokio::fs::try_exists(self.axis_path('x'))
            .await
            .unwrap_or(false)
    }

    async fn sample(&self) -> Result<SensorReading, SensorError> {
        let scale = self.scale().await?;
        let x = read_number(&self.axis_path('x')).await? * scale;
        let y = read_number(&self.axis_path('y')).await? * scale;
        let z = read_number(&self.axis_path('z')).await? * scale;

        Ok(match self.kind {
            SensorKind::Accelerometer => SensorReading::Accelerometer { x, y, z },
            _ => SensorReading::Gyroscope { x, y, z },
        })
    }
}
