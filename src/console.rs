//! Line oriented terminal console
//!
//! Stands in for the device screen: one command per line on stdin, status
//! lines printed as the connection snapshot changes. Publish and subscribe
//! commands are only accepted while the connected surface is shown.

use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::connection::{ConnectionHandle, ConnectionSnapshot, Surface, ToggleOutcome};
use crate::shadow::ShadowReactor;
use crate::telemetry::{SensorKind, StartOutcome, TelemetryPublisher};

const HELP: &str = "\
commands:
  toggle                         connect or disconnect
  status                         show connection status
  forget                         remove the stored certificate
  battery|gyro|accel on|off      start or stop a sensor publisher
  slider <value>                 publish a slider value
  torch on|off                   publish on the torch topic
  shadow start|stop              react to the device shadow
  help
  quit";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConsoleError {
    #[error("Unknown command '{0}', type 'help'")]
    Unknown(String),

    #[error("Missing argument: {0}")]
    MissingArgument(&'static str),

    #[error("Invalid value '{0}'")]
    InvalidValue(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Toggle,
    Status,
    Forget,
    Sensor { kind: SensorKind, on: bool },
    Slider(f32),
    Torch(bool),
    Shadow(bool),
    Help,
    Quit,
}

impl ConsoleCommand {
    /// Commands that need the connected surface.
    fn needs_connection(&self) -> bool {
        matches!(
            self,
            ConsoleCommand::Sensor { on: true, .. }
                | ConsoleCommand::Slider(_)
                | ConsoleCommand::Torch(_)
                | ConsoleCommand::Shadow(true)
        )
    }
}

fn parse_switch(arg: Option<&str>, name: &'static str) -> Result<bool, ConsoleError> {
    match arg {
        Some("on") | Some("start") => Ok(true),
        Some("off") | Some("stop") => Ok(false),
        Some(other) => Err(ConsoleError::InvalidValue(other.to_string())),
        None => Err(ConsoleError::MissingArgument(name)),
    }
}

impl FromStr for ConsoleCommand {
    type Err = ConsoleError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut parts = line.split_whitespace();
        let Some(command) = parts.next() else {
            return Err(ConsoleError::Unknown(String::new()));
        };
        let arg = parts.next();

        let sensor = |kind| {
            parse_switch(arg, "on|off").map(|on| ConsoleCommand::Sensor { kind, on })
        };

        match command.to_ascii_lowercase().as_str() {
            "toggle" | "connect" | "disconnect" => Ok(ConsoleCommand::Toggle),
            "status" => Ok(ConsoleCommand::Status),
            "forget" => Ok(ConsoleCommand::Forget),
            "battery" => sensor(SensorKind::Battery),
            "gyro" | "gyroscope" => sensor(SensorKind::Gyroscope),
            "accel" | "accelerometer" => sensor(SensorKind::Accelerometer),
            "slider" => {
                let raw = arg.ok_or(ConsoleError::MissingArgument("value"))?;
                raw.parse::<f32>()
                    .ok()
                    .filter(|v| v.is_finite())
                    .map(ConsoleCommand::Slider)
                    .ok_or_else(|| ConsoleError::InvalidValue(raw.to_string()))
            }
            "torch" => parse_switch(arg, "on|off").map(ConsoleCommand::Torch),
            "shadow" => parse_switch(arg, "start|stop").map(ConsoleCommand::Shadow),
            "help" | "?" => Ok(ConsoleCommand::Help),
            "quit" | "exit" => Ok(ConsoleCommand::Quit),
            other => Err(ConsoleError::Unknown(other.to_string())),
        }
    }
}

pub struct Console {
    connection: ConnectionHandle,
    telemetry: Arc<TelemetryPublisher>,
    shadow: Arc<ShadowReactor>,
}

impl Console {
    pub fn new(
        connection: ConnectionHandle,
        telemetry: Arc<TelemetryPublisher>,
        shadow: Arc<ShadowReactor>,
    ) -> Self {
        Self {
            connection,
            telemetry,
            shadow,
        }
    }

    /// Reads commands until `quit` or end of input.
    pub async fn run(&self) {
        println!("{}", HELP);
        let status_printer = tokio::spawn(print_status_changes(self.connection.subscribe()));
        let loss_watcher = tokio::spawn(stop_on_connection_loss(
            self.connection.subscribe(),
            self.telemetry.clone(),
            self.shadow.clone(),
        ));

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    error!("Failed to read console input: {}", e);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            match line.parse::<ConsoleCommand>() {
                Ok(ConsoleCommand::Quit) => break,
                Ok(command) => self.execute(command).await,
                Err(e) => println!("{}", e),
            }
        }

        status_printer.abort();
        loss_watcher.abort();
        debug!("Console input closed");
    }

    pub async fn execute(&self, command: ConsoleCommand) {
        if command.needs_connection() && self.connection.snapshot().surface != Surface::Connected {
            println!("Not connected, use 'toggle' first");
            return;
        }

        match command {
            ConsoleCommand::Toggle => {
                let connection = self.connection.clone();
                tokio::spawn(async move {
                    match connection.toggle().await {
                        Ok(ToggleOutcome::Connected { client_id, .. }) => {
                            info!("Toggle finished, connected as {}", client_id)
                        }
                        Ok(ToggleOutcome::Disconnected) => info!("Toggle finished, disconnected"),
                        Err(e) => println!("{}", e),
                    }
                });
            }
            ConsoleCommand::Status => println!("{}", self.connection.snapshot()),
            ConsoleCommand::Forget => match self.connection.forget_credential().await {
                Ok(()) => println!("Stored certificate removed, next connect provisions again"),
                Err(e) => println!("{}", e),
            },
            ConsoleCommand::Sensor { kind, on: true } => {
                match self.telemetry.start(kind).await {
                    StartOutcome::Started => println!("{} publisher started", kind),
                    StartOutcome::AlreadyRunning => println!("{} publisher already running", kind),
                    StartOutcome::Unavailable => println!("{} not available.", kind),
                }
            }
            ConsoleCommand::Sensor { kind, on: false } => {
                if !self.telemetry.stop(kind).await {
                    println!("{} publisher is not running", kind);
                }
            }
            ConsoleCommand::Slider(value) => {
                let effective = self.telemetry.publish_slider(value).await;
                if effective != value {
                    println!("Slider has gone higher than 30. Please reduce. Now {}", effective);
                }
            }
            ConsoleCommand::Torch(on) => {
                if let Err(e) = self.shadow.publish_torch(on).await {
                    println!("{}", e);
                }
            }
            ConsoleCommand::Shadow(true) => match self.shadow.start().await {
                Ok(true) => println!("Listening to shadow updates"),
                Ok(false) => println!("Shadow reactor already running"),
                Err(e) => println!("{}", e),
            },
            ConsoleCommand::Shadow(false) => self.shadow.stop().await,
            ConsoleCommand::Help => println!("{}", HELP),
            ConsoleCommand::Quit => {}
        }
    }

    /// Stops every publisher and tears the connection down.
    pub async fn shutdown(&self) {
        self.telemetry.stop_all().await;
        self.shadow.stop().await;
        match self.connection.disconnect().await {
            Ok(snapshot) => info!("Shut down: {}", snapshot),
            Err(e) => warn!("Connection task already gone: {}", e),
        }
    }
}

/// Stops the sensor publishers and the shadow reactor whenever the connection
/// goes from connected to disconnected, whether by toggle or by loss.
async fn stop_on_connection_loss(
    mut snapshots: watch::Receiver<ConnectionSnapshot>,
    telemetry: Arc<TelemetryPublisher>,
    shadow: Arc<ShadowReactor>,
) {
    let mut was_connected = snapshots.borrow_and_update().connected;
    while snapshots.changed().await.is_ok() {
        let connected = snapshots.borrow_and_update().connected;
        if was_connected && !connected {
            info!("Connection gone, stopping publishers");
            telemetry.stop_all().await;
            shadow.stop().await;
        }
        was_connected = connected;
    }
}

async fn print_status_changes(mut snapshots: watch::Receiver<ConnectionSnapshot>) {
    let mut last_line = String::new();
    while snapshots.changed().await.is_ok() {
        let snapshot = snapshots.borrow_and_update().clone();
        if snapshot.status_line != last_line && !snapshot.status_line.is_empty() {
            println!("{}", snapshot.status_line);
            last_line = snapshot.status_line;
        }
    }
}
