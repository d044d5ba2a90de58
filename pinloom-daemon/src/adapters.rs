//! Built-in collaborator adapters
//!
//! Enough to run a node standalone: content-addressed blobs on the local
//! filesystem and a static identity map from the config file. Networked
//! deployments swap these for real shared-storage and registry adapters.

use async_trait::async_trait;
use pinloom_model::{
    Hash, IdentityError, IdentityResolver, SharedStorage, SharedStorageError,
};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::io::AsyncRead;

/// Blob storage in a local directory, one file per content reference.
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: PathBuf) -> std::io::Result<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn blob_path(&self, payload_ref: &str) -> Option<PathBuf> {
        // References are hex digests; anything else would escape the dir.
        if payload_ref.is_empty() || !payload_ref.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        Some(self.root.join(payload_ref))
    }
}

#[async_trait]
impl SharedStorage for FsStorage {
    async fn retrieve(
        &self,
        payload_ref: &str,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, SharedStorageError> {
        let path = self
            .blob_path(payload_ref)
            .ok_or_else(|| SharedStorageError::NotFound(payload_ref.to_string()))?;
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SharedStorageError::NotFound(payload_ref.to_string()))
            }
            Err(e) => Err(SharedStorageError::Unavailable(e.to_string())),
        }
    }

    async fn publish(&self, data: &[u8]) -> Result<String, SharedStorageError> {
        let payload_ref = Hash::of(data).to_string();
        let path = self.root.join(&payload_ref);
        tokio::fs::write(&path, data)
            .await
            .map_err(|e| SharedStorageError::Unavailable(e.to_string()))?;
        Ok(payload_ref)
    }
}

/// Identity resolution from a fixed key → author table.
pub struct StaticIdentityResolver {
    identities: HashMap<String, String>,
}

impl StaticIdentityResolver {
    pub fn new(identities: HashMap<String, String>) -> Self {
        Self { identities }
    }
}

#[async_trait]
impl IdentityResolver for StaticIdentityResolver {
    async fn normalize_signing_key(
        &self,
        _namespace: &str,
        key: &str,
    ) -> Result<Option<String>, IdentityError> {
        Ok(self.identities.get(key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_fs_storage_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir").keep();
        let storage = FsStorage::new(dir.join("blobs")).unwrap();

        let payload_ref = storage.publish(b"hello blobs").await.unwrap();
        let mut reader = storage.retrieve(&payload_ref).await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello blobs");

        assert!(matches!(
            storage.retrieve("00ff00ff").await,
            Err(SharedStorageError::NotFound(_))
        ));
        assert!(matches!(
            storage.retrieve("../escape").await,
            Err(SharedStorageError::NotFound(_))
        ));
    }
}
