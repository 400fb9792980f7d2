//! File-backed credential store.
//!
//! Settings are kept as a flat TOML table in `credentials.toml`. Every
//! operation re-reads the file so edits made while the device is stopped are
//! picked up; writes go through a temporary file and a rename.

use super::{CredentialStore, StoreError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

pub const CREDENTIALS_FILE: &str = "credentials.toml";

pub struct FileCredentialStore {
    path: PathBuf,
    // serializes read-modify-write cycles
    write_lock: Mutex<()>,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(CREDENTIALS_FILE))
    }

    async fn read_all(&self) -> Result<BTreeMap<String, String>, StoreError> {
        let exists = tokio::fs::try_exists(&self.path)
            .await
            .map_err(|source| self.io_error(source))?;
        if !exists {
            return Ok(BTreeMap::new());
        }

        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| self.io_error(source))?;
        toml::from_str(&content).map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    async fn write_all(&self, values: &BTreeMap<String, String>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| self.io_error(source))?;
        }

        let content =
            toml::to_string_pretty(values).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let tmp = self.path.with_extension("toml.tmp");
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|source| self.io_error(source))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|source| self.io_error(source))
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let values = self.read_all().await?;
        Ok(values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut values = self.read_all().await?;
        values.insert(key.to_string(), value.to_string());
        self.write_all(&values).await?;
        debug!("Stored {} in {}", key, self.path.display());
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut values = self.read_all().await?;
        if values.remove(key).is_some() {
            self.write_all(&values).await?;
            info!("Cleared {} from {}", key, self.path.display());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{
        clear_credential, load_credential, persist_credential, Credential, CredentialSource,
    };

    #[tokio::test]
    async fn persisted_credential_reloads_identically() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::in_dir(dir.path());

        let issued = Credential::issued("4f2a9c", "arn:aws:iot:us-east-1:1234:cert/4f2a9c");
        persist_credential(&store, &issued).await.unwrap();

        // a second store instance sees the same file
        let reopened = FileCredentialStore::in_dir(dir.path());
        let loaded = load_credential(&reopened).await.unwrap().unwrap();
        assert_eq!(loaded, issued);
        assert_eq!(loaded.source, CredentialSource::Issued);
    }

    #[tokio::test]
    async fn bundled_credential_keeps_its_source() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::in_dir(dir.path());

        let bundled = Credential::bundled("bundle/device-01.pem");
        persist_credential(&store, &bundled).await.unwrap();

        assert_eq!(load_credential(&store).await.unwrap(), Some(bundled));
    }

    #[tokio::test]
    async fn reprovisioning_replaces_every_field() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::in_dir(dir.path());

        persist_credential(&store, &Credential::bundled("old.pem"))
            .await
            .unwrap();
        let issued = Credential::issued("new", "arn:new");
        persist_credential(&store, &issued).await.unwrap();

        assert_eq!(load_credential(&store).await.unwrap(), Some(issued));
    }

    #[tokio::test]
    async fn cleared_store_has_no_credential() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::in_dir(dir.path());

        persist_credential(&store, &Credential::issued("id", "arn"))
            .await
            .unwrap();
        clear_credential(&store).await.unwrap();

        assert_eq!(load_credential(&store).await.unwrap(), None);
        assert_eq!(store.get("certificateArn").await.unwrap(), None);
    }

    #[tokio::test]
    async fn garbage_file_is_reported_as_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::in_dir(dir.path());
        tokio::fs::write(dir.path().join(CREDENTIALS_FILE), "certificateId = [").await.unwrap();

        assert!(matches!(
            store.get("certificateId").await,
            Err(StoreError::Corrupt(_))
        ));
    }
}
