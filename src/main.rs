use color_eyre::{eyre::eyre, Result};
use scorch::config::AppConfig;
use scorch::connection::{BootstrapSettings, ConnectionHandle, CredentialSources};
use scorch::console::Console;
use scorch::mqtt::{MqttSession, RumqttSession};
use scorch::persistence::{FileCredentialStore, FileIdentityVault, IdentityVault};
use scorch::provisioning::HttpProvisioningService;
use scorch::shadow::{LocalActuator, ShadowReactor};
use scorch::telemetry::{DeviceInfo, IioMotionSensor, SysfsBattery, TelemetryPublisher};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config = AppConfig::ensure_default_config().await?;
    let state_dir = AppConfig::config_dir();
    info!(
        "Device {} ({}) using {}",
        config.device.device_name,
        config.device.device_id,
        state_dir.display()
    );

    let vault: Arc<dyn IdentityVault> = Arc::new(FileIdentityVault::in_dir(&state_dir));
    let session: Arc<dyn MqttSession> = Arc::new(RumqttSession::new(
        config.broker.clone(),
        config.resolve(&config.broker.ca_path),
        vault.clone(),
    ));
    let provisioning = HttpProvisioningService::new(&config.provisioning)
        .map_err(|e| eyre!("Failed to set up provisioning client: {}", e))?;

    let sources = CredentialSources {
        store: Arc::new(FileCredentialStore::in_dir(&state_dir)),
        vault,
        provisioning: Arc::new(provisioning),
    };
    let connection = ConnectionHandle::spawn(
        sources,
        BootstrapSettings::from_config(&config),
        session.clone(),
    );

    let telemetry = Arc::new(
        TelemetryPublisher::new(
            session.clone(),
            DeviceInfo::from(&config.device),
            config.topics.clone(),
            config.telemetry.clone(),
        )
        .with_source(Arc::new(SysfsBattery::new(&config.telemetry.battery_path)))
        .with_source(Arc::new(IioMotionSensor::gyroscope(
            &config.telemetry.gyroscope_path,
        )))
        .with_source(Arc::new(IioMotionSensor::accelerometer(
            &config.telemetry.accelerometer_path,
        ))),
    );

    let shadow = Arc::new(ShadowReactor::new(
        session,
        Arc::new(LocalActuator::new(&config.actuator)),
        &config.device.thing_name,
        &config.topics.torch,
        &config.shadow,
    ));

    let console = Console::new(connection, telemetry, shadow);
    tokio::select! {
        _ = console.run() => info!("Console closed"),
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }
    console.shutdown().await;

    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
