//! Certificate provisioning
//!
//! Obtains a device certificate when neither a stored nor a bundled identity
//! exists:
//!
//! 1. [`csr`] - key pair and certificate signing request, generated locally
//! 2. [`http_service`] - issuance and policy attachment over HTTPS
//!
//! The private key never leaves the device; only the CSR is sent.

pub mod csr;
pub mod http_service;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ProvisioningConfig;
use crate::persistence::DeviceIdentity;

pub use http_service::HttpProvisioningService;

#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("Failed to generate key material: {0}")]
    KeyGeneration(String),

    #[error("Provisioning request failed: {0}")]
    Http(String),

    #[error("Provisioning service rejected the request: {status} - {body}")]
    Rejected { status: u16, body: String },

    #[error("Invalid provisioning response: {0}")]
    InvalidResponse(String),
}

/// Subject attributes for the certificate signing request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningRequest {
    pub common_name: String,
    pub country_name: String,
    pub organization_name: String,
    pub organizational_unit_name: String,
}

impl From<&ProvisioningConfig> for ProvisioningRequest {
    fn from(config: &ProvisioningConfig) -> Self {
        Self {
            common_name: config.common_name.clone(),
            country_name: config.country_name.clone(),
            organization_name: config.organization_name.clone(),
            organizational_unit_name: config.organizational_unit_name.clone(),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    pub certificate_id: String,
    pub certificate_arn: String,
    pub certificate_pem: String,
    pub private_key_pem: String,
}

impl IssuedCertificate {
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            certificate_pem: self.certificate_pem.clone(),
            private_key_pem: self.private_key_pem.clone(),
        }
    }
}

impl std::fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("certificate_id", &self.certificate_id)
            .field("certificate_arn", &self.certificate_arn)
            .finish_non_exhaustive()
    }
}

/// Remote service issuing device certificates and attaching authorization
/// policies to them.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProvisioningService: Send + Sync {
    async fn issue_certificate(
        &self,
        request: &ProvisioningRequest,
    ) -> Result<IssuedCertificate, ProvisioningError>;

    async fn attach_policy(
        &self,
        policy_name: &str,
        certificate_arn: &str,
    ) -> Result<(), ProvisioningError>;
}
