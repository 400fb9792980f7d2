//! Credential resolution with statum typestates
//!
//! Decides which credential the next connect uses. The order is fixed:
//!
//! ```text
//! Lookup ──► BundleScan ──► Provisioning ──► Resolved
//!   │            │                              ▲
//!   └────────────┴──────────────────────────────┘
//!        (stored credential / bundle import)
//! ```
//!
//! Each stage only exists on the resolver in its matching state, so a stage
//! cannot be skipped or run twice within one resolution.

use statum::{machine, state};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::error::BootstrapError;
use crate::config::AppConfig;
use crate::persistence::identity_vault::{list_bundled_identities, parse_identity_bundle};
use crate::persistence::{
    load_credential, persist_credential, Credential, CredentialStore, IdentityVault,
};
use crate::provisioning::{ProvisioningRequest, ProvisioningService};

/// Bundled identities are only imported when strictly more files than this
/// are present. Kept for compatibility with deployed bundles; a single
/// bundled identity is ignored.
pub const BUNDLE_IMPORT_THRESHOLD: usize = 10;

pub const STATUS_SEARCHING_BUNDLE: &str = "No identity available, searching bundle...";
pub const STATUS_CREATING_IDENTITY: &str = "No identity found in bundle, creating one...";
pub const STATUS_PROVISIONING_FAILED: &str =
    "Unable to create keys and/or certificate, check values in the configuration";

/// Static inputs of a resolution.
#[derive(Debug, Clone)]
pub struct BootstrapSettings {
    pub bundle_dir: PathBuf,
    pub bundle_extension: String,
    pub request: ProvisioningRequest,
    pub policy_name: String,
    pub connect_delay: Duration,
}

impl BootstrapSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            bundle_dir: config.resolve(&config.identity.bundle_dir),
            bundle_extension: config.identity.bundle_extension.clone(),
            request: ProvisioningRequest::from(&config.provisioning),
            policy_name: config.provisioning.policy_name.clone(),
            connect_delay: config.provisioning.connect_delay(),
        }
    }
}

/// Collaborators shared by the bootstrapper and every resolution it starts.
#[derive(Clone)]
pub struct CredentialSources {
    pub store: Arc<dyn CredentialStore>,
    pub vault: Arc<dyn IdentityVault>,
    pub provisioning: Arc<dyn ProvisioningService>,
}

#[state]
#[derive(Debug, Clone)]
pub enum ResolutionState {
    Lookup,       // Reading the credential store
    BundleScan,   // Looking for shipped identity files
    Provisioning, // Requesting a fresh certificate
    Resolved,     // Credential available for connect
}

#[machine]
pub struct CredentialResolver<S: ResolutionState> {
    sources: CredentialSources,
    settings: BootstrapSettings,
    progress: mpsc::Sender<String>,
    credential: Option<Credential>,
}

pub enum LookupOutcome {
    Stored(CredentialResolver<Resolved>),
    Missing(CredentialResolver<BundleScan>),
}

pub enum BundleOutcome {
    Imported(CredentialResolver<Resolved>),
    Empty(CredentialResolver<Provisioning>),
}

impl<S: ResolutionState> CredentialResolver<S> {
    async fn report(&self, line: impl Into<String>) {
        let line = line.into();
        info!("{}", line);
        if self.progress.send(line).await.is_err() {
            debug!("Progress receiver dropped");
        }
    }
}

impl CredentialResolver<Lookup> {
    pub fn create(
        sources: CredentialSources,
        settings: BootstrapSettings,
        progress: mpsc::Sender<String>,
    ) -> Self {
        Self::new(sources, settings, progress, None)
    }

    /// Runs every stage needed until a credential is available.
    pub async fn resolve(self) -> Result<Credential, BootstrapError> {
        let resolved = match self.lookup().await? {
            LookupOutcome::Stored(resolved) => resolved,
            LookupOutcome::Missing(scan) => match scan.scan_bundle().await? {
                BundleOutcome::Imported(resolved) => resolved,
                BundleOutcome::Empty(provisioning) => provisioning.provision().await?,
            },
        };
        resolved.into_credential()
    }

    pub async fn lookup(mut self) -> Result<LookupOutcome, BootstrapError> {
        match load_credential(self.sources.store.as_ref()).await? {
            Some(credential) => {
                info!(
                    "Using stored {} credential {}",
                    credential.source, credential.certificate_id
                );
                self.credential = Some(credential);
                Ok(LookupOutcome::Stored(self.transition()))
            }
            None => {
                self.report(STATUS_SEARCHING_BUNDLE).await;
                Ok(LookupOutcome::Missing(self.transition()))
            }
        }
    }
}

impl CredentialResolver<BundleScan> {
    pub async fn scan_bundle(mut self) -> Result<BundleOutcome, BootstrapError> {
        let files =
            list_bundled_identities(&self.settings.bundle_dir, &self.settings.bundle_extension)
                .await?;

        if files.len() <= BUNDLE_IMPORT_THRESHOLD {
            if !files.is_empty() {
                warn!(
                    "Found {} bundled identities in {}, import requires more than {}",
                    files.len(),
                    self.settings.bundle_dir.display(),
                    BUNDLE_IMPORT_THRESHOLD
                );
            }
            self.report(STATUS_CREATING_IDENTITY).await;
            return Ok(BundleOutcome::Empty(self.transition()));
        }

        let path = &files[0];
        self.report(format!("found identity {}, importing...", path.display()))
            .await;
        let credential = self.import_bundled(path).await?;
        self.credential = Some(credential);
        Ok(BundleOutcome::Imported(self.transition()))
    }

    async fn import_bundled(&self, path: &Path) -> Result<Credential, BootstrapError> {
        let data = tokio::fs::read(path)
            .await
            .map_err(crate::persistence::VaultError::from)?;
        let identity = parse_identity_bundle(&data)?;

        let certificate_id = path.display().to_string();
        self.sources.vault.import(&certificate_id, &identity).await?;

        let credential = Credential::bundled(certificate_id);
        persist_credential(self.sources.store.as_ref(), &credential).await?;
        Ok(credential)
    }
}

impl CredentialResolver<Provisioning> {
    /// Issues a certificate, stores it and attaches the policy. The connect
    /// delay is applied after a successful attachment.
    pub async fn provision(mut self) -> Result<CredentialResolver<Resolved>, BootstrapError> {
        let issued = match self
            .sources
            .provisioning
            .issue_certificate(&self.settings.request)
            .await
        {
            Ok(issued) => issued,
            Err(e) => {
                error!("Certificate issuance failed: {}", e);
                self.report(STATUS_PROVISIONING_FAILED).await;
                return Err(BootstrapError::ProvisioningFailed(e));
            }
        };

        self.sources
            .vault
            .import(&issued.certificate_id, &issued.identity())
            .await?;

        let credential = Credential::issued(&issued.certificate_id, &issued.certificate_arn);
        persist_credential(self.sources.store.as_ref(), &credential).await?;

        if let Err(e) = self
            .sources
            .provisioning
            .attach_policy(&self.settings.policy_name, &credential.certificate_arn)
            .await
        {
            error!(
                "Failed to attach policy {} to {}: {}",
                self.settings.policy_name, credential.certificate_arn, e
            );
            return Err(BootstrapError::PolicyAttachmentFailed(e));
        }

        debug!(
            "Waiting {:?} for the policy to propagate",
            self.settings.connect_delay
        );
        tokio::time::sleep(self.settings.connect_delay).await;

        self.credential = Some(credential);
        Ok(self.transition())
    }
}

impl CredentialResolver<Resolved> {
    pub fn into_credential(self) -> Result<Credential, BootstrapError> {
        self.credential.ok_or(BootstrapError::CredentialNotFound)
    }
}
