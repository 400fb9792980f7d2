//! # Persistence Module
//!
//! Device state that has to survive a restart: the active credential (a
//! handful of string settings) and the certificate/key pair it refers to.
//!
//! ## Key Abstractions
//! - **Credential Store**: flat key/value settings holding `certificateId`,
//!   `certificateArn` and `certificateSource`
//! - **Identity Vault**: secure storage for the certificate and private key
//!   belonging to a certificate id
//!
//! Both are traits so the connection bootstrapper can be exercised without a
//! filesystem. The file-backed implementations live in
//! [`credential_store`] and [`identity_vault`].
//!
//! A credential is created once per installation and replaced wholesale on
//! re-provisioning; it is never patched field by field.

pub mod credential_store;
pub mod identity_vault;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, warn};

pub use credential_store::FileCredentialStore;
pub use identity_vault::FileIdentityVault;

pub const CERTIFICATE_ID_KEY: &str = "certificateId";
pub const CERTIFICATE_ARN_KEY: &str = "certificateArn";
pub const CERTIFICATE_SOURCE_KEY: &str = "certificateSource";

/// ARN recorded for identities imported from the local bundle
pub const BUNDLED_ARN: &str = "from-bundle";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to access credential store {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Credential store is corrupt: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("Failed to access identity vault: {0}")]
    Io(#[from] std::io::Error),

    #[error("Identity is not valid PEM: {0}")]
    InvalidPem(String),

    #[error("Identity bundle has no {0}")]
    Incomplete(&'static str),
}

/// Where the active credential came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CredentialSource {
    /// Imported from an identity file shipped alongside the application
    Bundled,
    /// Issued by the provisioning service for a locally generated key
    Issued,
}

impl CredentialSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialSource::Bundled => "bundled",
            CredentialSource::Issued => "issued",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "bundled" => Some(CredentialSource::Bundled),
            "issued" => Some(CredentialSource::Issued),
            _ => None,
        }
    }
}

impl fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub certificate_id: String,
    pub certificate_arn: String,
    pub source: CredentialSource,
}

impl Credential {
    pub fn bundled(certificate_id: impl Into<String>) -> Self {
        Self {
            certificate_id: certificate_id.into(),
            certificate_arn: BUNDLED_ARN.to_string(),
            source: CredentialSource::Bundled,
        }
    }

    pub fn issued(certificate_id: impl Into<String>, certificate_arn: impl Into<String>) -> Self {
        Self {
            certificate_id: certificate_id.into(),
            certificate_arn: certificate_arn.into(),
            source: CredentialSource::Issued,
        }
    }

    /// Usable for connect iff the certificate id is non-empty. Expiry and
    /// revocation are not checked here.
    pub fn is_valid(&self) -> bool {
        !self.certificate_id.is_empty()
    }
}

/// Certificate and private key belonging to one certificate id.
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub certificate_pem: String,
    pub private_key_pem: String,
}

impl fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("certificate_pem", &self.certificate_pem)
            .field("private_key_pem", &"<redacted>")
            .finish()
    }
}

/// Persistent string settings.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    async fn clear(&self, key: &str) -> Result<(), StoreError>;
}

/// Secure storage for device identities.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IdentityVault: Send + Sync {
    async fn import(&self, certificate_id: &str, identity: &DeviceIdentity)
        -> Result<(), VaultError>;
    async fn load(&self, certificate_id: &str) -> Result<Option<DeviceIdentity>, VaultError>;
}

/// Reads the active credential. An empty certificate id counts as absent.
pub async fn load_credential<S: CredentialStore + ?Sized>(
    store: &S,
) -> Result<Option<Credential>, StoreError> {
    let Some(certificate_id) = store.get(CERTIFICATE_ID_KEY).await? else {
        debug!("No certificate id stored");
        return Ok(None);
    };

    let certificate_arn = store.get(CERTIFICATE_ARN_KEY).await?.unwrap_or_default();
    let source = match store.get(CERTIFICATE_SOURCE_KEY).await? {
        Some(raw) => CredentialSource::parse(&raw)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown credential source '{}'", raw)))?,
        // Entries written before the source key existed
        None if certificate_arn == BUNDLED_ARN => CredentialSource::Bundled,
        None => CredentialSource::Issued,
    };

    let credential = Credential {
        certificate_id,
        certificate_arn,
        source,
    };

    if credential.is_valid() {
        Ok(Some(credential))
    } else {
        warn!("Stored certificate id is empty, ignoring it");
        Ok(None)
    }
}

/// Replaces the active credential wholesale.
///
/// The certificate id is removed first and written last. A failure part way
/// leaves no credential rather than a new id next to the old ARN and source.
pub async fn persist_credential<S: CredentialStore + ?Sized>(
    store: &S,
    credential: &Credential,
) -> Result<(), StoreError> {
    store.clear(CERTIFICATE_ID_KEY).await?;
    store
        .set(CERTIFICATE_ARN_KEY, &credential.certificate_arn)
        .await?;
    store
        .set(CERTIFICATE_SOURCE_KEY, credential.source.as_str())
        .await?;
    store
        .set(CERTIFICATE_ID_KEY, &credential.certificate_id)
        .await?;
    debug!(
        "Persisted {} credential {}",
        credential.source, credential.certificate_id
    );
    Ok(())
}

pub async fn clear_credential<S: CredentialStore + ?Sized>(store: &S) -> Result<(), StoreError> {
    store.clear(CERTIFICATE_ID_KEY).await?;
    store.clear(CERTIFICATE_ARN_KEY).await?;
    store.clear(CERTIFICATE_SOURCE_KEY).await
}
