//! Namespaced key-value store consumed by the distributed checkpointer
//!
//! [`BackingStore`] is the contract an external service has to satisfy to host
//! checkpoints shared between worker processes. Records are grouped into
//! namespaces; the checkpointer uses `[thread_id, "checkpoints"]` for
//! checkpoint records and `[thread_id, "lease"]` for the thread lease.
//!
//! Besides plain put/get/delete/list the contract includes
//! [`compare_and_swap`](BackingStore::compare_and_swap). Implementations must
//! make it atomic (Redis `WATCH`/`MULTI`, a conditional SQL `UPDATE`, an etcd
//! transaction, ...): it is what turns two racing writers into one winner and
//! one `VersionConflict`.
//!
//! [`InMemoryStore`] is the reference implementation. It is shared by cloning,
//! so several checkpointers in one process can simulate separate workers
//! talking to the same service.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

/// Hierarchical namespace, e.g. `["thread-1", "checkpoints"]`
pub type Namespace = Vec<String>;

/// Build a namespace from string parts
pub fn namespace<I, S>(parts: I) -> Namespace
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    parts.into_iter().map(Into::into).collect()
}

/// Error type for store operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The service could not be reached or timed out; safe to retry
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Other error
    #[error("Store error: {0}")]
    Other(String),
}

impl StoreError {
    /// Whether the failure is transient
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Namespaced key-value storage
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Store a value, overwriting any previous one
    async fn put(&self, namespace: &[String], key: &str, value: Value) -> StoreResult<()>;

    /// Get a value, `None` if absent
    async fn get(&self, namespace: &[String], key: &str) -> StoreResult<Option<Value>>;

    /// Delete a value; returns whether it existed
    async fn delete(&self, namespace: &[String], key: &str) -> StoreResult<bool>;

    /// List the keys of a namespace in ascending order
    async fn list(&self, namespace: &[String]) -> StoreResult<Vec<String>>;

    /// Remove every key of a namespace; returns how many were removed
    async fn clear(&self, namespace: &[String]) -> StoreResult<usize>;

    /// Values of a namespace whose top-level fields equal every filter entry
    async fn search(
        &self,
        namespace: &[String],
        filter: &HashMap<String, Value>,
    ) -> StoreResult<Vec<Value>>;

    /// Atomically replace `expected` with `new`
    ///
    /// `expected == None` requires the key to be absent; `new == None`
    /// deletes it. Returns `false` without writing when the current value
    /// differs from `expected`.
    async fn compare_and_swap(
        &self,
        namespace: &[String],
        key: &str,
        expected: Option<&Value>,
        new: Option<Value>,
    ) -> StoreResult<bool>;
}

type Records = HashMap<Namespace, BTreeMap<String, Value>>;

/// In-memory implementation of [`BackingStore`]
///
/// Thread-safe and cheap to clone; clones share the same data.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    data: Arc<RwLock<Records>>,
}

impl InMemoryStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of keys across namespaces
    pub fn len(&self) -> usize {
        self.read().values().map(BTreeMap::len).sum()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Records> {
        // A poisoned lock only means a writer panicked; the map itself is intact.
        self.data.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Records> {
        self.data.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn matches_filter(value: &Value, filter: &HashMap<String, Value>) -> bool {
    filter
        .iter()
        .all(|(field, expected)| value.get(field) == Some(expected))
}

#[async_trait]
impl BackingStore for InMemoryStore {
    async fn put(&self, namespace: &[String], key: &str, value: Value) -> StoreResult<()> {
        self.write()
            .entry(namespace.to_vec())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, namespace: &[String], key: &str) -> StoreResult<Option<Value>> {
        Ok(self
            .read()
            .get(namespace)
            .and_then(|records| records.get(key))
            .cloned())
    }

    async fn delete(&self, namespace: &[String], key: &str) -> StoreResult<bool> {
        let mut data = self.write();
        let Some(records) = data.get_mut(namespace) else {
            return Ok(false);
        };
        let existed = records.remove(key).is_some();
        if records.is_empty() {
            data.remove(namespace);
        }
        Ok(existed)
    }

    async fn list(&self, namespace: &[String]) -> StoreResult<Vec<String>> {
        Ok(self
            .read()
            .get(namespace)
            .map(|records| records.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn clear(&self, namespace: &[String]) -> StoreResult<usize> {
        Ok(self
            .write()
            .remove(namespace)
            .map(|records| records.len())
            .unwrap_or(0))
    }

    async fn search(
        &self,
        namespace: &[String],
        filter: &HashMap<String, Value>,
    ) -> StoreResult<Vec<Value>> {
        Ok(self
            .read()
            .get(namespace)
            .map(|records| {
                records
                    .values()
                    .filter(|value| matches_filter(value, filter))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn compare_and_swap(
        &self,
        namespace: &[String],
        key: &str,
        expected: Option<&Value>,
        new: Option<Value>,
    ) -> StoreResult<bool> {
        let mut data = self.write();
        let records = data.entry(namespace.to_vec()).or_default();

        if records.get(key) != expected {
            return Ok(false);
        }

        match new {
            Some(value) => {
                records.insert(key.to_string(), value);
            }
            None => {
                records.remove(key);
            }
        }
        if records.is_empty() {
            data.remove(namespace);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ns(thread: &str) -> Namespace {
        namespace([thread, "checkpoints"])
    }

    #[tokio::test]
    async fn test_store_put_get() {
        let store = InMemoryStore::new();

        store.put(&ns("t1"), "a", json!({"value": 42})).await.unwrap();

        let result = store.get(&ns("t1"), "a").await.unwrap();
        assert_eq!(result, Some(json!({"value": 42})));

        // Namespaces are isolated
        assert_eq!(store.get(&ns("t2"), "a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_store_delete() {
        let store = InMemoryStore::new();

        store.put(&ns("t1"), "a", json!(1)).await.unwrap();
        assert_eq!(store.len(), 1);

        assert!(store.delete(&ns("t1"), "a").await.unwrap());
        assert!(store.is_empty());
        assert!(!store.delete(&ns("t1"), "a").await.unwrap());
    }

    #[tokio::test]
    async fn test_store_list_is_sorted() {
        let store = InMemoryStore::new();

        store.put(&ns("t1"), "00000000000000000002", json!(2)).await.unwrap();
        store.put(&ns("t1"), "00000000000000000000", json!(0)).await.unwrap();
        store.put(&ns("t1"), "00000000000000000001", json!(1)).await.unwrap();

        let keys = store.list(&ns("t1")).await.unwrap();
        assert_eq!(
            keys,
            vec![
                "00000000000000000000",
                "00000000000000000001",
                "00000000000000000002"
            ]
        );
    }

    #[tokio::test]
    async fn test_store_clear_namespace_only() {
        let store = InMemoryStore::new();

        store.put(&ns("t1"), "a", json!(1)).await.unwrap();
        store.put(&ns("t1"), "b", json!(2)).await.unwrap();
        store.put(&ns("t2"), "a", json!(3)).await.unwrap();

        assert_eq!(store.clear(&ns("t1")).await.unwrap(), 2);
        assert_eq!(store.len(), 1);
        assert_eq!(store.clear(&ns("t1")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_store_search() {
        let store = InMemoryStore::new();

        store.put(&ns("t1"), "a", json!({"kind": "loop", "n": 1})).await.unwrap();
        store.put(&ns("t1"), "b", json!({"kind": "interrupt", "n": 2})).await.unwrap();
        store.put(&ns("t1"), "c", json!({"kind": "loop", "n": 3})).await.unwrap();

        let mut filter = HashMap::new();
        filter.insert("kind".to_string(), json!("loop"));

        let found = store.search(&ns("t1"), &filter).await.unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|v| v["kind"] == "loop"));

        let everything = store.search(&ns("t1"), &HashMap::new()).await.unwrap();
        assert_eq!(everything.len(), 3);
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let store = InMemoryStore::new();

        // Create only if absent
        assert!(store.compare_and_swap(&ns("t1"), "k", None, Some(json!(1))).await.unwrap());
        assert!(!store.compare_and_swap(&ns("t1"), "k", None, Some(json!(2))).await.unwrap());
        assert_eq!(store.get(&ns("t1"), "k").await.unwrap(), Some(json!(1)));

        // Swap from the observed value
        assert!(store
            .compare_and_swap(&ns("t1"), "k", Some(&json!(1)), Some(json!(3)))
            .await
            .unwrap());
        assert!(!store
            .compare_and_swap(&ns("t1"), "k", Some(&json!(1)), Some(json!(4)))
            .await
            .unwrap());

        // Conditional delete
        assert!(store
            .compare_and_swap(&ns("t1"), "k", Some(&json!(3)), None)
            .await
            .unwrap());
        assert!(store.is_empty());
    }
}
