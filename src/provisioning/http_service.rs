//! HTTPS client for the certificate issuance service.
//!
//! - `POST {endpoint}/certificates` with the CSR, answered with the certificate
//!   id, ARN and PEM
//! - `PUT {endpoint}/policies/{policy}/principals` attaching a policy to a
//!   certificate ARN

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use super::csr::CertificateRequest;
use super::{IssuedCertificate, ProvisioningError, ProvisioningRequest, ProvisioningService};
use crate::config::ProvisioningConfig;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IssueRequest<'a> {
    csr_pem: &'a str,
    subject: &'a ProvisioningRequest,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssueResponse {
    certificate_id: String,
    certificate_arn: String,
    certificate_pem: String,
}

#[derive(Serialize)]
struct AttachRequest<'a> {
    principal: &'a str,
}

pub struct HttpProvisioningService {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpProvisioningService {
    pub fn new(config: &ProvisioningConfig) -> Result<Self, ProvisioningError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| {
                ProvisioningError::Http(format!("Failed to build HTTP client: {}", e))
            })?;

        Ok(Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn certificates_url(&self) -> String {
        format!("{}/certificates", self.endpoint)
    }

    fn policy_url(&self, policy_name: &str) -> String {
        format!("{}/policies/{}/principals", self.endpoint, policy_name)
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ProvisioningError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(ProvisioningError::Rejected { status, body })
}

#[async_trait]
impl ProvisioningService for HttpProvisioningService {
    async fn issue_certificate(
        &self,
        request: &ProvisioningRequest,
    ) -> Result<IssuedCertificate, ProvisioningError> {
        info!(common_name = %request.common_name, "Generating keypair and CSR");
        let generated = CertificateRequest::new(request)?;

        let url = self.certificates_url();
        debug!(url = %url, "Submitting CSR");
        let response = self
            .client
            .post(&url)
            .json(&IssueRequest {
                csr_pem: generated.csr_pem(),
                subject: request,
            })
            .send()
            .await
            .map_err(|e| ProvisioningError::Http(e.to_string()))?;

        let issued: IssueResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| ProvisioningError::InvalidResponse(e.to_string()))?;

        if issued.certificate_id.is_empty() {
            return Err(ProvisioningError::InvalidResponse(
                "empty certificate id".to_string(),
            ));
        }

        info!(certificate_id = %issued.certificate_id, "Certificate issued");
        Ok(IssuedCertificate {
            certificate_id: issued.certificate_id,
            certificate_arn: issued.certificate_arn,
            certificate_pem: issued.certificate_pem,
            private_key_pem: generated.private_key_pem().to_string(),
        })
    }

    async fn attach_policy(
        &self,
        policy_name: &str,
        certificate_arn: &str,
    ) -> Result<(), ProvisioningError> {
        let url = self.policy_url(policy_name);
        debug!(url = %url, principal = %certificate_arn, "Attaching policy");
        let response = self
            .client
            .put(&url)
            .json(&AttachRequest {
                principal: certificate_arn,
            })
            .send()
            .await
            .map_err(|e| ProvisioningError::Http(e.to_string()))?;

        check_status(response).await?;
        info!("Policy {} attached to {}", policy_name, certificate_arn);
        Ok(())
    }
}
