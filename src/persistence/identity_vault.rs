//! File-backed identity vault and bundled identity discovery.
//!
//! Each identity is stored as `identities/<id>/certificate.pem` and
//! `identities/<id>/private_key.pem`, where `<id>` is the certificate id with
//! every character outside `[A-Za-z0-9._-]` replaced. Key files are created
//! owner-readable only on unix.

use super::{DeviceIdentity, IdentityVault, VaultError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const IDENTITIES_DIR: &str = "identities";
const CERTIFICATE_FILE: &str = "certificate.pem";
const PRIVATE_KEY_FILE: &str = "private_key.pem";

pub struct FileIdentityVault {
    root: PathBuf,
}

impl FileIdentityVault {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(IDENTITIES_DIR))
    }

    fn entry_dir(&self, certificate_id: &str) -> PathBuf {
        self.root.join(sanitize_id(certificate_id))
    }
}

fn sanitize_id(certificate_id: &str) -> String {
    certificate_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[async_trait]
impl IdentityVault for FileIdentityVault {
    async fn import(
        &self,
        certificate_id: &str,
        identity: &DeviceIdentity,
    ) -> Result<(), VaultError> {
        let dir = self.entry_dir(certificate_id);
        tokio::fs::create_dir_all(&dir).await?;

        tokio::fs::write(dir.join(CERTIFICATE_FILE), &identity.certificate_pem).await?;

        let key_path = dir.join(PRIVATE_KEY_FILE);
        tokio::fs::write(&key_path, &identity.private_key_pem).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600)).await?;
        }

        info!("Imported identity {} into {}", certificate_id, dir.display());
        Ok(())
    }

    async fn load(&self, certificate_id: &str) -> Result<Option<DeviceIdentity>, VaultError> {
        let dir = self.entry_dir(certificate_id);
        let certificate_path = dir.join(CERTIFICATE_FILE);
        let key_path = dir.join(PRIVATE_KEY_FILE);

        if !tokio::fs::try_exists(&certificate_path).await?
            || !tokio::fs::try_exists(&key_path).await?
        {
            debug!("No identity stored for {}", certificate_id);
            return Ok(None);
        }

        Ok(Some(DeviceIdentity {
            certificate_pem: tokio::fs::read_to_string(certificate_path).await?,
            private_key_pem: tokio::fs::read_to_string(key_path).await?,
        }))
    }
}

/// Splits a PEM bundle into its certificate chain and private key.
pub fn parse_identity_bundle(data: &[u8]) -> Result<DeviceIdentity, VaultError> {
    let blocks = pem::parse_many(data).map_err(|e| VaultError::InvalidPem(e.to_string()))?;

    let mut certificate_pem = String::new();
    let mut private_key_pem = None;

    for block in &blocks {
        match block.tag() {
            "CERTIFICATE" => certificate_pem.push_str(&pem::encode(block)),
            "PRIVATE KEY" | "RSA PRIVATE KEY" | "EC PRIVATE KEY" => {
                if private_key_pem.is_some() {
                    warn!("Identity bundle holds more than one private key, using the first");
                    continue;
                }
                private_key_pem = Some(pem::encode(block));
            }
            other => debug!("Skipping PEM block {}", other),
        }
    }

    if certificate_pem.is_empty() {
        return Err(VaultError::Incomplete("certificate"));
    }
    let private_key_pem = private_key_pem.ok_or(VaultError::Incomplete("private key"))?;

    Ok(DeviceIdentity {
        certificate_pem,
        private_key_pem,
    })
}

/// Lists identity files with the given extension, sorted by path. A missing
/// directory yields an empty list.
pub async fn list_bundled_identities(
    dir: &Path,
    extension: &str,
) -> Result<Vec<PathBuf>, VaultError> {
    if !tokio::fs::try_exists(dir).await? {
        debug!("Bundle directory {} does not exist", dir.display());
        return Ok(Vec::new());
    }

    let mut found = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let matches = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case(extension));
        if matches && entry.file_type().await?.is_file() {
            found.push(path);
        }
    }

    found.sort();
    Ok(found)
}
