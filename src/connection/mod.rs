//! # Connection Bootstrapper
//!
//! Turns a single user toggle into either a connected MQTT session or a clean
//! pre-connect state.
//!
//! ## Architecture
//!
//! ```text
//! ConnectionHandle ──commands──► connection task ──► CredentialResolver
//!        ▲                            │  ▲                (bootstrapper.rs)
//!        │                            │  └── status events (tagged by client id)
//!   watch<ConnectionSnapshot> ◄───────┘
//! ```
//!
//! The connection task is the only owner of the `connected` flag and of the
//! active session. Credential resolution, connect delays and disconnects run
//! on helper tasks that report back through the task's inbox, so observers
//! always see a consistent snapshot.

pub mod bootstrapper;
pub mod connection_handle;
pub mod error;

use std::fmt;

use crate::mqtt::ConnectionStatus;

pub use bootstrapper::{BootstrapSettings, CredentialSources};
pub use connection_handle::{ConnectionHandle, ToggleOutcome};
pub use error::BootstrapError;

/// Which controls are exposed to the user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Surface {
    /// Only the connect toggle is available
    #[default]
    PreConnect,
    /// Publish and subscribe controls are available
    Connected,
}

/// Observer view of the bootstrapper, published on every change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub connected: bool,
    pub status: ConnectionStatus,
    pub client_id: Option<String>,
    pub certificate_id: Option<String>,
    pub surface: Surface,
    /// Human readable progress line
    pub status_line: String,
    /// A toggle is in flight and further toggles are rejected
    pub busy: bool,
}

impl fmt::Display for ConnectionSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}] {}", self.status, self.status_line)
    }
}

pub(crate) fn connected_status_line(certificate_id: &str, client_id: &str) -> String {
    format!(
        "Using certificate:\n{}\n\n\nClient ID:\n{}",
        certificate_id, client_id
    )
}
