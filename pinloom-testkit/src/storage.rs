//! In-memory content-addressed storage fake

use async_trait::async_trait;
use pinloom_model::{Hash, SharedStorage, SharedStorageError};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Mutex;
use tokio::io::AsyncRead;

/// HashMap-backed shared storage. References are the hex digest of the
/// published bytes. `fail_next` injects transient retrieval failures.
pub struct MemStorage {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    failures: Mutex<u32>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self { blobs: Mutex::new(HashMap::new()), failures: Mutex::new(0) }
    }

    /// Make the next `n` retrievals fail with a transient error.
    pub fn fail_next(&self, n: u32) {
        *self.failures.lock().unwrap() = n;
    }

    /// Store bytes under an arbitrary reference, for payloads that should
    /// not round-trip through `publish`.
    pub fn put(&self, payload_ref: &str, bytes: Vec<u8>) {
        self.blobs.lock().unwrap().insert(payload_ref.to_string(), bytes);
    }
}

impl Default for MemStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedStorage for MemStorage {
    async fn retrieve(
        &self,
        payload_ref: &str,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, SharedStorageError> {
        {
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(SharedStorageError::Unavailable("injected failure".into()));
            }
        }
        let blobs = self.blobs.lock().unwrap();
        match blobs.get(payload_ref) {
            Some(bytes) => Ok(Box::new(Cursor::new(bytes.clone()))),
            None => Err(SharedStorageError::NotFound(payload_ref.to_string())),
        }
    }

    async fn publish(&self, data: &[u8]) -> Result<String, SharedStorageError> {
        let payload_ref = Hash::of(data).to_string();
        self.blobs.lock().unwrap().insert(payload_ref.clone(), data.to_vec());
        Ok(payload_ref)
    }
}
