//! Local key pair and CSR generation.

use rcgen::{CertificateParams, DistinguishedName, DnType, DnValue, KeyPair};

use super::{ProvisioningError, ProvisioningRequest};

/// A freshly generated key pair together with the CSR for it.
pub struct CertificateRequest {
    key_pem: String,
    csr_pem: String,
}

impl CertificateRequest {
    pub fn new(request: &ProvisioningRequest) -> Result<Self, ProvisioningError> {
        let key_pair = KeyPair::generate().map_err(|e| {
            ProvisioningError::KeyGeneration(format!("failed to generate device key: {}", e))
        })?;
        let key_pem = key_pair.serialize_pem();

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(request.common_name.clone()),
        );
        dn.push(
            DnType::CountryName,
            DnValue::Utf8String(request.country_name.clone()),
        );
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String(request.organization_name.clone()),
        );
        dn.push(
            DnType::OrganizationalUnitName,
            DnValue::Utf8String(request.organizational_unit_name.clone()),
        );
        params.distinguished_name = dn;

        let csr = params.serialize_request(&key_pair).map_err(|e| {
            ProvisioningError::KeyGeneration(format!("failed to create CSR: {}", e))
        })?;
        let csr_pem = csr.pem().map_err(|e| {
            ProvisioningError::KeyGeneration(format!("failed to serialize CSR: {}", e))
        })?;

        Ok(Self { key_pem, csr_pem })
    }

    pub fn csr_pem(&self) -> &str {
        &self.csr_pem
    }

    /// Private key in PEM format, kept on the device
    pub fn private_key_pem(&self) -> &str {
        &self.key_pem
    }
}
