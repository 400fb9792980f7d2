//! Device side IoT client: certificate bootstrap, MQTT session, sensor
//! telemetry and shadow state reactions.

pub mod config;
pub mod connection;
pub mod console;
pub mod mqtt;
pub mod persistence;
pub mod provisioning;
pub mod shadow;
pub mod telemetry;
