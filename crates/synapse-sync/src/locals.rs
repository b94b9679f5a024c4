//! # Locals Cache
//!
//! Per-entity scratch values that belong to the application, not the hub.
//! Locals are never sent over the socket.
//!
//! ```text
//!  first access to uid ──► RowStore::load_locals(uid) ──► cache[uid]
//!
//!  get(key)    cache[uid][key]  or  code default  or  None
//!  has(key)    cached           or  has a code default
//!  set(key,v)  v == cached ? skip : cache + RowStore::update_local
//!  delete(key) cache.remove + RowStore::delete_local
//!  reset()     cache[uid] = {} + RowStore::delete_locals_by_unique_id
//! ```
//!
//! Code defaults live only in the handle and are never written to storage.

use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, trace};

use synapse_db::RowStore;

use crate::error::SyncResult;

type Cache = HashMap<String, HashMap<String, Value>>;

/// Lazily loaded locals of every entity.
pub struct LocalsCache {
    store: Arc<dyn RowStore>,
    cache: Mutex<Cache>,
}

impl LocalsCache {
    pub fn new(store: Arc<dyn RowStore>) -> Self {
        Self {
            store,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Locks the cache with `unique_id` loaded.
    ///
    /// The lock is held across the storage read so a concurrent first
    /// access cannot load twice.
    async fn loaded(&self, unique_id: &str) -> SyncResult<MutexGuard<'_, Cache>> {
        let mut cache = self.cache.lock().await;
        if !cache.contains_key(unique_id) {
            let locals = self.store.load_locals(unique_id).await?;
            debug!(unique_id = %unique_id, count = locals.len(), "Loaded locals");
            cache.insert(unique_id.to_string(), locals);
        }
        Ok(cache)
    }

    pub async fn is_loaded(&self, unique_id: &str) -> bool {
        self.cache.lock().await.contains_key(unique_id)
    }

    /// Stored value of `key`, without defaults.
    pub async fn get(&self, unique_id: &str, key: &str) -> SyncResult<Option<Value>> {
        let cache = self.loaded(unique_id).await?;
        Ok(cache.get(unique_id).and_then(|locals| locals.get(key)).cloned())
    }

    /// Writes `key`. Returns false when the cached value was already equal
    /// and nothing was written.
    pub async fn set(&self, unique_id: &str, key: &str, value: Value) -> SyncResult<bool> {
        let mut cache = self.loaded(unique_id).await?;
        let locals = cache.entry(unique_id.to_string()).or_default();

        if locals.get(key) == Some(&value) {
            trace!(unique_id = %unique_id, key = %key, "Local unchanged, skipping write");
            return Ok(false);
        }

        self.store.update_local(unique_id, key, &value).await?;
        locals.insert(key.to_string(), value);
        Ok(true)
    }

    /// Removes `key` from cache and storage. Returns false if it was not
    /// stored.
    pub async fn delete(&self, unique_id: &str, key: &str) -> SyncResult<bool> {
        let mut cache = self.loaded(unique_id).await?;
        let present = cache
            .get(unique_id)
            .is_some_and(|locals| locals.contains_key(key));
        if !present {
            return Ok(false);
        }

        self.store.delete_local(unique_id, key).await?;
        if let Some(locals) = cache.get_mut(unique_id) {
            locals.remove(key);
        }
        Ok(true)
    }

    /// Stored keys of `unique_id`.
    pub async fn stored_keys(&self, unique_id: &str) -> SyncResult<Vec<String>> {
        let cache = self.loaded(unique_id).await?;
        Ok(cache
            .get(unique_id)
            .map(|locals| locals.keys().cloned().collect())
            .unwrap_or_default())
    }

    /// Drops every stored local of `unique_id`. Returns how many rows went.
    pub async fn reset(&self, unique_id: &str) -> SyncResult<u64> {
        let mut cache = self.cache.lock().await;
        let removed = self.store.delete_locals_by_unique_id(unique_id).await?;
        cache.insert(unique_id.to_string(), HashMap::new());
        debug!(unique_id = %unique_id, removed, "Locals reset");
        Ok(removed)
    }
}

// =============================================================================
// Locals Handle
// =============================================================================

/// Locals of one entity plus their code defaults.
#[derive(Clone)]
pub struct LocalsHandle {
    cache: Arc<LocalsCache>,
    unique_id: String,
    defaults: Arc<Map<String, Value>>,
}

impl LocalsHandle {
    pub fn new(cache: Arc<LocalsCache>, unique_id: impl Into<String>, defaults: Map<String, Value>) -> Self {
        Self {
            cache,
            unique_id: unique_id.into(),
            defaults: Arc::new(defaults),
        }
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    /// Stored value, falling back to the code default.
    pub async fn get(&self, key: &str) -> SyncResult<Option<Value>> {
        Ok(self
            .cache
            .get(&self.unique_id, key)
            .await?
            .or_else(|| self.defaults.get(key).cloned()))
    }

    pub async fn has(&self, key: &str) -> SyncResult<bool> {
        if self.defaults.contains_key(key) {
            return Ok(true);
        }
        Ok(self.cache.get(&self.unique_id, key).await?.is_some())
    }

    pub async fn set(&self, key: &str, value: impl Into<Value>) -> SyncResult<bool> {
        self.cache.set(&self.unique_id, key, value.into()).await
    }

    pub async fn delete(&self, key: &str) -> SyncResult<bool> {
        self.cache.delete(&self.unique_id, key).await
    }

    /// Stored keys plus keys with a default, sorted.
    pub async fn keys(&self) -> SyncResult<Vec<String>> {
        let mut keys: BTreeSet<String> = self.defaults.keys().cloned().collect();
        keys.extend(self.cache.stored_keys(&self.unique_id).await?);
        Ok(keys.into_iter().collect())
    }

    pub async fn reset(&self) -> SyncResult<u64> {
        self.cache.reset(&self.unique_id).await
    }
}

impl std::fmt::Debug for LocalsHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalsHandle")
            .field("unique_id", &self.unique_id)
            .field("defaults", &self.defaults)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use synapse_core::HubRegistration;
    use synapse_db::MemoryRowStore;

    fn handle(store: Arc<MemoryRowStore>) -> LocalsHandle {
        let mut defaults = Map::new();
        defaults.insert("threshold".into(), json!(10));
        LocalsHandle::new(Arc::new(LocalsCache::new(store)), "sw1", defaults)
    }

    #[tokio::test]
    async fn test_defaults_are_visible_but_not_stored() {
        let store = Arc::new(MemoryRowStore::new("home", HubRegistration::new()));
        let locals = handle(store.clone());

        assert!(locals.has("threshold").await.unwrap());
        assert_eq!(locals.get("threshold").await.unwrap(), Some(json!(10)));
        assert!(!locals.has("missing").await.unwrap());
        assert!(store.load_locals("sw1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_set_skips_unchanged_value() {
        let store = Arc::new(MemoryRowStore::new("home", HubRegistration::new()));
        let locals = handle(store.clone());

        assert!(locals.set("count", 1).await.unwrap());
        assert!(!locals.set("count", 1).await.unwrap());
        assert!(locals.set("count", 2).await.unwrap());

        assert_eq!(store.load_locals("sw1").await.unwrap()["count"], json!(2));
    }

    #[tokio::test]
    async fn test_delete_falls_back_to_default() {
        let store = Arc::new(MemoryRowStore::new("home", HubRegistration::new()));
        let locals = handle(store.clone());

        locals.set("threshold", 42).await.unwrap();
        assert_eq!(locals.get("threshold").await.unwrap(), Some(json!(42)));

        assert!(locals.delete("threshold").await.unwrap());
        assert!(!locals.delete("threshold").await.unwrap());
        assert_eq!(locals.get("threshold").await.unwrap(), Some(json!(10)));
        assert!(!store.load_locals("sw1").await.unwrap().contains_key("threshold"));
    }

    #[tokio::test]
    async fn test_lazy_load_reads_existing_rows() {
        let store = Arc::new(MemoryRowStore::new("home", HubRegistration::new()));
        store.update_local("sw1", "note", &json!("hello")).await.unwrap();

        let cache = Arc::new(LocalsCache::new(store.clone()));
        assert!(!cache.is_loaded("sw1").await);

        let locals = LocalsHandle::new(cache.clone(), "sw1", Map::new());
        assert_eq!(locals.get("note").await.unwrap(), Some(json!("hello")));
        assert!(cache.is_loaded("sw1").await);
        assert_eq!(locals.keys().await.unwrap(), vec!["note".to_string()]);
    }

    #[tokio::test]
    async fn test_reset() {
        let store = Arc::new(MemoryRowStore::new("home", HubRegistration::new()));
        let locals = handle(store.clone());

        locals.set("a", 1).await.unwrap();
        locals.set("b", 2).await.unwrap();
        assert_eq!(locals.reset().await.unwrap(), 2);
        assert_eq!(locals.keys().await.unwrap(), vec!["threshold".to_string()]);
    }
}
