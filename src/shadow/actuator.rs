use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::ActuatorConfig;

#[derive(Debug, Error)]
pub enum ActuatorError {
    #[error("Flashlight is not available")]
    TorchUnavailable,

    #[error("Flashlight could not be used: {0}")]
    Torch(#[source] std::io::Error),

    #[error("Camera not available")]
    CameraUnavailable,
}

/// Local device effects requested through the shadow or the torch topic.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DeviceActuator: Send + Sync {
    async fn set_torch(&self, on: bool) -> Result<(), ActuatorError>;
    async fn open_camera(&self) -> Result<(), ActuatorError>;
    async fn show_alert(&self, message: &str) -> Result<(), ActuatorError>;
}

/// Actuator driving a sysfs LED as torch. Alerts go to the log.
pub struct LocalActuator {
    torch_led: Option<PathBuf>,
    camera_device: Option<PathBuf>,
}

impl LocalActuator {
    pub fn new(config: &ActuatorConfig) -> Self {
        Self {
            torch_led: config.torch_led.clone(),
            camera_device: config.camera_device.clone(),
        }
    }

    async fn max_brightness(led: &std::path::Path) -> String {
        match tokio::fs::read_to_string(led.join("max_brightness")).await {
            Ok(value) => value.trim().to_string(),
            Err(e) => {
                debug!("No max_brightness for {}: {}", led.display(), e);
                "1".to_string()
            }
        }
    }
}

#[async_trait]
impl DeviceActuator for LocalActuator {
    async fn set_torch(&self, on: bool) -> Result<(), ActuatorError> {
        let Some(led) = &self.torch_led else {
            return Err(ActuatorError::TorchUnavailable);
        };
        if !tokio::fs::try_exists(led).await.unwrap_or(false) {
            return Err(ActuatorError::TorchUnavailable);
        }

        let brightness = if on {
            Self::max_brightness(led).await
        } else {
            "0".to_string()
        };
        tokio::fs::write(led.join("brightness"), brightness)
            .await
            .map_err(ActuatorError::Torch)?;
        info!("Torch {}", if on { "on" } else { "off" });
        Ok(())
    }

    async fn open_camera(&self) -> Result<(), ActuatorError> {
        let Some(device) = &self.camera_device else {
            return Err(ActuatorError::CameraUnavailable);
        };
        if !tokio::fs::try_exists(device).await.unwrap_or(false) {
            return Err(ActuatorError::CameraUnavailable);
        }
        info!("Camera requested on {}", device.display());
        Ok(())
    }

    async fn show_alert(&self, message: &str) -> Result<(), ActuatorError> {
        warn!("Attention: {}", message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn actuator(torch_led: Option<PathBuf>, camera_device: Option<PathBuf>) -> LocalActuator {
        LocalActuator::new(&ActuatorConfig {
            torch_led,
            camera_device,
        })
    }

    #[tokio::test]
    async fn torch_writes_led_brightness() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("max_brightness"), "255\n").unwrap();
        let torch = actuator(Some(dir.path().to_path_buf()), None);

        torch.set_torch(true).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("brightness")).unwrap(),
            "255"
        );

        torch.set_torch(false).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("brightness")).unwrap(),
            "0"
        );
    }

    #[tokio::test]
    async fn missing_led_means_no_flashlight() {
        let torch = actuator(None, None);
        let err = torch.set_torch(true).await.unwrap_err();
        assert_eq!(err.to_string(), "Flashlight is not available");
    }

    #[tokio::test]
    async fn missing_camera_device_is_reported() {
        let camera = actuator(None, Some(PathBuf::from("/nonexistent/video9")));
        let err = camera.open_camera().await.unwrap_err();
        assert_eq!(err.to_string(), "Camera not available");
    }
}
