//! Working memory of a run
//!
//! [`State`] is a thread-safe map from string keys to JSON values. One
//! `parking_lot::RwLock` guards the whole container: reads take shared
//! access, every mutation (including [`State::update`]) takes exclusive
//! access, so no caller ever observes a half-applied write and concurrent
//! updates never lose each other's effects.
//!
//! `State` is a cheap handle. Cloning it shares the container; use
//! [`State::clone_state`] for an independent copy.
//!
//! # Snapshots
//!
//! [`State::snapshot`] copies the map under one lock acquisition. Values are
//! stored behind `Arc`, so a snapshot shares every value with the live state
//! and costs one pointer copy per key. Stored values are never mutated in
//! place; `set` and `update` replace the `Arc`, which is what keeps earlier
//! snapshots stable.
//!
//! ```rust
//! use waypoint_core::State;
//! use serde_json::json;
//!
//! let state = State::new();
//! state.set("count", json!(2));
//!
//! let before = state.snapshot();
//! state.update("count", |v| json!(v.and_then(|v| v.as_i64()).unwrap_or(0) + 3));
//!
//! assert_eq!(state.get_i64("count").unwrap(), 5);
//! assert_eq!(before.get("count"), Some(&json!(2)));
//! ```
//!
//! # Typed access
//!
//! Typed getters never panic. A missing key is [`RuntimeError::NotFound`];
//! a value of the wrong type is [`RuntimeError::TypeMismatch`].

use crate::error::{Result, RuntimeError};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use waypoint_checkpoint::StateValues;

type Entries = BTreeMap<String, Arc<Value>>;

/// JSON type name of a value, used in type mismatch errors
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn mismatch(key: &str, expected: &str, value: &Value) -> RuntimeError {
    RuntimeError::TypeMismatch {
        key: key.to_string(),
        expected: expected.to_string(),
        actual: type_name(value).to_string(),
    }
}

fn missing(key: &str) -> RuntimeError {
    RuntimeError::NotFound(format!("state key '{}'", key))
}

/// Concurrent key/value working memory for one run
#[derive(Clone, Default)]
pub struct State {
    inner: Arc<RwLock<Entries>>,
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.inner.read().iter()).finish()
    }
}

impl State {
    /// Create an empty state
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a state from plain values
    pub fn from_values(values: StateValues) -> Self {
        let entries = values
            .into_iter()
            .map(|(key, value)| (key, Arc::new(value)))
            .collect();
        Self {
            inner: Arc::new(RwLock::new(entries)),
        }
    }

    /// Create a state seeded from a snapshot
    pub fn from_snapshot(snapshot: &StateSnapshot) -> Self {
        Self {
            inner: Arc::new(RwLock::new(snapshot.entries.clone())),
        }
    }

    /// Create a state from a JSON object
    ///
    /// # Errors
    ///
    /// [`RuntimeError::Validation`] if `value` is not an object.
    pub fn from_json(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self::from_values(map.into_iter().collect())),
            other => Err(RuntimeError::validation(format!(
                "state must be a JSON object, got {}",
                type_name(&other)
            ))),
        }
    }

    /// Get a value
    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.read().get(key).map(|v| v.as_ref().clone())
    }

    /// Check whether a key is present
    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.read().contains_key(key)
    }

    /// Set a value, returning the previous one
    pub fn set(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.inner
            .write()
            .insert(key.into(), Arc::new(value))
            .map(|old| old.as_ref().clone())
    }

    /// Atomically read-modify-write one key
    ///
    /// `f` receives the current value (`None` when absent) and returns the
    /// new one. The whole operation runs under one exclusive acquisition.
    /// Returns the stored value.
    pub fn update<F>(&self, key: &str, f: F) -> Value
    where
        F: FnOnce(Option<&Value>) -> Value,
    {
        let mut entries = self.inner.write();
        let updated = f(entries.get(key).map(Arc::as_ref));
        entries.insert(key.to_string(), Arc::new(updated.clone()));
        updated
    }

    /// Like [`update`](Self::update), but `f` may fail and leave the value untouched
    pub fn try_update<F>(&self, key: &str, f: F) -> Result<Value>
    where
        F: FnOnce(Option<&Value>) -> Result<Value>,
    {
        let mut entries = self.inner.write();
        let updated = f(entries.get(key).map(Arc::as_ref))?;
        entries.insert(key.to_string(), Arc::new(updated.clone()));
        Ok(updated)
    }

    /// Apply several writes under one exclusive acquisition
    pub fn merge<I, K>(&self, values: I)
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let mut entries = self.inner.write();
        for (key, value) in values {
            entries.insert(key.into(), Arc::new(value));
        }
    }

    /// Remove a key, returning its value
    pub fn delete(&self, key: &str) -> Option<Value> {
        self.inner
            .write()
            .remove(key)
            .map(|old| old.as_ref().clone())
    }

    /// Remove every key
    pub fn clear(&self) {
        self.inner.write().clear();
    }

    /// Keys in ascending order
    pub fn keys(&self) -> Vec<String> {
        self.inner.read().keys().cloned().collect()
    }

    /// Number of keys
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Whether the state holds no keys
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Immutable point-in-time copy of every key
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            entries: self.inner.read().clone(),
        }
    }

    /// Replace the whole content with a snapshot
    pub fn restore(&self, snapshot: &StateSnapshot) {
        *self.inner.write() = snapshot.entries.clone();
    }

    /// Independent mutable copy
    pub fn clone_state(&self) -> State {
        State::from_snapshot(&self.snapshot())
    }

    /// Plain values, for persistence
    pub fn to_values(&self) -> StateValues {
        self.snapshot().to_values()
    }

    /// The state as a JSON object
    pub fn to_json(&self) -> Value {
        self.snapshot().to_json()
    }

    fn require(&self, key: &str) -> Result<Arc<Value>> {
        self.inner.read().get(key).cloned().ok_or_else(|| missing(key))
    }

    /// Get a string value
    pub fn get_string(&self, key: &str) -> Result<String> {
        let value = self.require(key)?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| mismatch(key, "string", &value))
    }

    /// Get an integer value
    pub fn get_i64(&self, key: &str) -> Result<i64> {
        let value = self.require(key)?;
        value.as_i64().ok_or_else(|| mismatch(key, "integer", &value))
    }

    /// Get a floating point value; integers are widened
    pub fn get_f64(&self, key: &str) -> Result<f64> {
        let value = self.require(key)?;
        value.as_f64().ok_or_else(|| mismatch(key, "number", &value))
    }

    /// Get a boolean value
    pub fn get_bool(&self, key: &str) -> Result<bool> {
        let value = self.require(key)?;
        value.as_bool().ok_or_else(|| mismatch(key, "bool", &value))
    }

    /// Get an array value
    pub fn get_array(&self, key: &str) -> Result<Vec<Value>> {
        let value = self.require(key)?;
        value
            .as_array()
            .cloned()
            .ok_or_else(|| mismatch(key, "array", &value))
    }

    /// Get an object value
    pub fn get_object(&self, key: &str) -> Result<Map<String, Value>> {
        let value = self.require(key)?;
        value
            .as_object()
            .cloned()
            .ok_or_else(|| mismatch(key, "object", &value))
    }

    /// Deserialize a value into `T`
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self.require(key)?;
        let expected = std::any::type_name::<T>();
        T::deserialize(value.as_ref()).map_err(|_| mismatch(key, expected, &value))
    }
}

impl From<StateValues> for State {
    fn from(values: StateValues) -> Self {
        Self::from_values(values)
    }
}

/// Immutable point-in-time view of a [`State`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateSnapshot {
    entries: Entries,
}

impl StateSnapshot {
    /// Get a value
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key).map(Arc::as_ref)
    }

    /// Check whether a key is present
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Get a string value, if present and a string
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Get an integer value, if present and an integer
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_i64)
    }

    /// Get a boolean value, if present and a boolean
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    /// Keys in ascending order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Iterate over entries in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_ref()))
    }

    /// Number of keys
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the snapshot holds no keys
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Plain values
    pub fn to_values(&self) -> StateValues {
        self.entries
            .iter()
            .map(|(k, v)| (k.clone(), v.as_ref().clone()))
            .collect()
    }

    /// The snapshot as a JSON object
    pub fn to_json(&self) -> Value {
        Value::Object(self.to_values().into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[test]
    fn test_update_and_snapshot_isolation() {
        let state = State::new();
        state.set("count", json!(2));

        let before = state.snapshot();
        let stored = state.update("count", |v| {
            json!(v.and_then(Value::as_i64).unwrap_or(0) + 3)
        });

        assert_eq!(stored, json!(5));
        assert_eq!(state.get("count"), Some(json!(5)));
        assert_eq!(before.get_i64("count"), Some(2));
    }

    #[test]
    fn test_update_missing_key() {
        let state = State::new();
        state.update("hits", |v| {
            assert!(v.is_none());
            json!(1)
        });
        assert_eq!(state.get_i64("hits").unwrap(), 1);
    }

    #[test]
    fn test_try_update_failure_leaves_value() {
        let state = State::new();
        state.set("n", json!(1));

        let result = state.try_update("n", |_| Err(RuntimeError::validation("nope")));

        assert!(result.is_err());
        assert_eq!(state.get("n"), Some(json!(1)));
    }

    #[test]
    fn test_concurrent_updates_do_not_lose_writes() {
        let state = State::new();
        state.set("count", json!(0));

        std::thread::scope(|scope| {
            for _ in 0..8 {
                let state = state.clone();
                scope.spawn(move || {
                    for _ in 0..250 {
                        state.update("count", |v| {
                            json!(v.and_then(Value::as_i64).unwrap_or(0) + 1)
                        });
                    }
                });
            }
        });

        assert_eq!(state.get_i64("count").unwrap(), 2000);
    }

    #[test]
    fn test_typed_getters() {
        let state = State::new();
        state.merge([
            ("name", json!("order-7")),
            ("count", json!(3)),
            ("ratio", json!(0.5)),
            ("done", json!(false)),
            ("items", json!([1, 2])),
            ("meta", json!({"a": 1})),
        ]);

        assert_eq!(state.get_string("name").unwrap(), "order-7");
        assert_eq!(state.get_i64("count").unwrap(), 3);
        assert_eq!(state.get_f64("count").unwrap(), 3.0);
        assert_eq!(state.get_f64("ratio").unwrap(), 0.5);
        assert!(!state.get_bool("done").unwrap());
        assert_eq!(state.get_array("items").unwrap().len(), 2);
        assert_eq!(state.get_object("meta").unwrap()["a"], json!(1));
    }

    #[test]
    fn test_type_mismatch_and_missing() {
        let state = State::new();
        state.set("name", json!("order-7"));

        match state.get_i64("name") {
            Err(RuntimeError::TypeMismatch {
                key,
                expected,
                actual,
            }) => {
                assert_eq!(key, "name");
                assert_eq!(expected, "integer");
                assert_eq!(actual, "string");
            }
            other => panic!("unexpected: {other:?}"),
        }

        assert!(matches!(
            state.get_string("absent"),
            Err(RuntimeError::NotFound(_))
        ));
    }

    #[test]
    fn test_get_as() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Order {
            id: u32,
            total: f64,
        }

        let state = State::new();
        state.set("order", json!({"id": 7, "total": 12.5}));
        state.set("bad", json!("nope"));

        assert_eq!(
            state.get_as::<Order>("order").unwrap(),
            Order { id: 7, total: 12.5 }
        );
        assert!(matches!(
            state.get_as::<Order>("bad"),
            Err(RuntimeError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_clone_state_is_independent() {
        let state = State::new();
        state.set("a", json!(1));

        let shared = state.clone();
        let copy = state.clone_state();
        state.set("a", json!(2));

        assert_eq!(shared.get("a"), Some(json!(2)));
        assert_eq!(copy.get("a"), Some(json!(1)));
    }

    #[test]
    fn test_restore_rolls_back() {
        let state = State::new();
        state.set("a", json!(1));
        let checkpoint = state.snapshot();

        state.set("a", json!(2));
        state.set("b", json!(true));
        state.restore(&checkpoint);

        assert_eq!(state.keys(), vec!["a".to_string()]);
        assert_eq!(state.get("a"), Some(json!(1)));
    }

    #[test]
    fn test_delete_clear_and_json() {
        let state = State::from_json(json!({"a": 1, "b": 2})).unwrap();
        assert_eq!(state.len(), 2);

        assert_eq!(state.delete("a"), Some(json!(1)));
        assert_eq!(state.to_json(), json!({"b": 2}));

        state.clear();
        assert!(state.is_empty());
        assert!(State::from_json(json!([1])).is_err());
    }
}
