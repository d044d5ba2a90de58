//! Shared caches between the persistor and the dispatcher

use pinloom_model::{Data, IdentityError, IdentityResolver, Message};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// Resolved signing keys, keyed by (namespace, key). Read-mostly; the
/// whole namespace is invalidated when its identities change.
pub struct IdentityCache {
    entries: RwLock<HashMap<(String, String), String>>,
}

impl IdentityCache {
    pub fn new() -> Self {
        Self { entries: RwLock::new(HashMap::new()) }
    }

    pub fn get(&self, namespace: &str, key: &str) -> Option<String> {
        let entries = self.entries.read().ok()?;
        entries.get(&(namespace.to_string(), key.to_string())).cloned()
    }

    pub fn put(&self, namespace: &str, key: &str, author: &str) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert((namespace.to_string(), key.to_string()), author.to_string());
        }
    }

    /// Drop every cached resolution for a namespace.
    pub fn invalidate_namespace(&self, namespace: &str) {
        if let Ok(mut entries) = self.entries.write() {
            entries.retain(|(ns, _), _| ns != namespace);
        }
    }
}

impl Default for IdentityCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Cached front of the identity resolver, shared by the persistor and the
/// dispatcher so both see the same resolutions.
#[derive(Clone)]
pub struct KeyResolver {
    cache: Arc<IdentityCache>,
    resolver: Arc<dyn IdentityResolver>,
}

impl KeyResolver {
    pub fn new(cache: Arc<IdentityCache>, resolver: Arc<dyn IdentityResolver>) -> Self {
        Self { cache, resolver }
    }

    pub fn cache(&self) -> &IdentityCache {
        &self.cache
    }

    /// Resolve through the cache; `Ok(None)` (no identity) is never
    /// cached, since the identity may be registered later.
    pub async fn resolve(
        &self,
        namespace: &str,
        key: &str,
    ) -> Result<Option<String>, IdentityError> {
        if let Some(author) = self.cache.get(namespace, key) {
            return Ok(Some(author));
        }
        match self.resolver.normalize_signing_key(namespace, key).await? {
            Some(author) => {
                self.cache.put(namespace, key, &author);
                Ok(Some(author))
            }
            None => Ok(None),
        }
    }
}

#[derive(Clone)]
pub struct CachedMessage {
    pub message: Arc<Message>,
    pub data: Arc<Vec<Data>>,
}

/// Write-through cache of persisted messages and their data, filled by the
/// persistor and read by dispatch readiness checks. Bounded FIFO: entries
/// are evicted in insertion order once the cache is full, and the store
/// remains the source of truth on a miss.
pub struct MessageDataCache {
    capacity: usize,
    inner: RwLock<MessageDataCacheInner>,
}

struct MessageDataCacheInner {
    entries: HashMap<Uuid, CachedMessage>,
    order: VecDeque<Uuid>,
}

impl MessageDataCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: RwLock::new(MessageDataCacheInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<CachedMessage> {
        let inner = self.inner.read().ok()?;
        inner.entries.get(id).cloned()
    }

    pub fn insert(&self, message: Message, data: Vec<Data>) {
        let id = message.header.id;
        let Ok(mut inner) = self.inner.write() else { return };
        if inner.entries.insert(id, CachedMessage { message: Arc::new(message), data: Arc::new(data) }).is_none() {
            inner.order.push_back(id);
        }
        while inner.entries.len() > self.capacity {
            match inner.order.pop_front() {
                Some(old) => {
                    inner.entries.remove(&old);
                }
                None => break,
            }
        }
    }
}
