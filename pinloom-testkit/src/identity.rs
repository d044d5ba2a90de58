//! Scripted identity resolver fake

use async_trait::async_trait;
use pinloom_model::{IdentityError, IdentityResolver};
use std::collections::HashMap;
use std::sync::Mutex;

/// Maps signing keys to authors. Unregistered keys resolve to nothing
/// (a terminal rejection); `fail_next` injects transient errors.
pub struct MemIdentityResolver {
    keys: Mutex<HashMap<String, String>>,
    failures: Mutex<u32>,
}

impl MemIdentityResolver {
    pub fn new() -> Self {
        Self { keys: Mutex::new(HashMap::new()), failures: Mutex::new(0) }
    }

    pub fn register(&self, key: &str, author: &str) {
        self.keys.lock().unwrap().insert(key.to_string(), author.to_string());
    }

    pub fn unregister(&self, key: &str) {
        self.keys.lock().unwrap().remove(key);
    }

    /// Make the next `n` resolutions fail with a transient error.
    pub fn fail_next(&self, n: u32) {
        *self.failures.lock().unwrap() = n;
    }
}

impl Default for MemIdentityResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdentityResolver for MemIdentityResolver {
    async fn normalize_signing_key(
        &self,
        _namespace: &str,
        key: &str,
    ) -> Result<Option<String>, IdentityError> {
        {
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(IdentityError::Unavailable("injected failure".into()));
            }
        }
        Ok(self.keys.lock().unwrap().get(key).cloned())
    }
}
