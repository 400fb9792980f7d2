use thiserror::Error;

use crate::mqtt::{ConnectionStatus, SessionError};
use crate::persistence::{StoreError, VaultError};
use crate::provisioning::ProvisioningError;

/// Terminal outcomes of a toggle. None of them is retried.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("No usable credential could be found")]
    CredentialNotFound,

    #[error("Unable to create keys and/or certificate: {0}")]
    ProvisioningFailed(#[source] ProvisioningError),

    #[error("Failed to attach policy: {0}")]
    PolicyAttachmentFailed(#[source] ProvisioningError),

    #[error("Connection Refused")]
    ConnectionRefused,

    #[error("Connection Error")]
    ConnectionError,

    #[error("Protocol Error")]
    ProtocolError,

    #[error("Another connection operation is still in progress")]
    Busy,

    #[error("Credential store error: {0}")]
    Store(#[from] StoreError),

    #[error("Identity vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("MQTT session error: {0}")]
    Session(#[from] SessionError),

    #[error("Connection task is no longer running")]
    ChannelClosed,
}

impl BootstrapError {
    /// Error for a connect attempt that ended in `status` before the broker
    /// accepted it.
    pub fn from_status(status: ConnectionStatus) -> Self {
        match status {
            ConnectionStatus::Refused => BootstrapError::ConnectionRefused,
            ConnectionStatus::ProtocolError => BootstrapError::ProtocolError,
            _ => BootstrapError::ConnectionError,
        }
    }
}
