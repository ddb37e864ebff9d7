//! Response caching with single-flight deduplication
//!
//! [`CacheMiddleware`] keys every request by a deterministic fingerprint of
//! its target and input (SHA-256 of the key-sorted JSON). Three things can
//! happen:
//!
//! 1. **Hit**: a stored, unexpired response is returned without calling
//!    `next`; `cache_hit` is set in the metadata.
//! 2. **Leader**: nobody is computing this fingerprint, so this request runs
//!    `next`. A successful response is stored.
//! 3. **Follower**: an identical request is already running. The follower
//!    waits for the leader and receives the same response with `shared` set.
//!
//! ```text
//!  req A ─┐                         ┌─► response (leader)
//!         ├─► fingerprint f ─► next ┤
//!  req B ─┘   (B waits on f)        └─► same response (shared)
//! ```
//!
//! Only successes are cached; errors are handed to the waiting followers
//! but the next request after them executes again. If the leader is dropped
//! before finishing (its caller was cancelled), waiting followers execute
//! the request themselves.
//!
//! # Configuration
//!
//! ```rust
//! use std::time::Duration;
//! use waypoint_core::middleware::{CacheConfig, CacheMiddleware};
//!
//! let cache = CacheMiddleware::new(
//!     CacheConfig::default()
//!         .with_ttl(Duration::from_secs(60))
//!         .with_max_entries(500),
//! );
//! ```

use super::{Middleware, Next, Request, Response};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::debug;

/// Custom fingerprint function
pub type KeyFn = Arc<dyn Fn(&Request) -> String + Send + Sync>;

/// Recursively sort object keys so equal values serialize identically
fn normalize_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), normalize_json(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(normalize_json).collect()),
        other => other.clone(),
    }
}

/// Deterministic fingerprint of a request's target and input
///
/// Context and attempt number are not part of the fingerprint. The result
/// is the lowercase hex SHA-256 digest, identical across processes and
/// toolchain versions, so it can also key a shared cache.
pub fn fingerprint(request: &Request) -> String {
    let stable = normalize_json(&json!({
        "target": request.target,
        "input": request.input,
    }))
    .to_string();

    let mut hasher = Sha256::new();
    hasher.update(stable.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Cache configuration
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Maximum number of stored responses
    pub max_entries: usize,

    /// Time-to-live of stored responses; `None` keeps them until evicted
    pub ttl: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            ttl: Some(Duration::from_secs(3600)), // 1 hour
        }
    }
}

impl CacheConfig {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn without_ttl(mut self) -> Self {
        self.ttl = None;
        self
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }
}

/// Cache metrics
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMetrics {
    /// Requests answered from the cache
    pub hits: usize,

    /// Requests that executed as leader
    pub misses: usize,

    /// Requests that shared a leader's execution
    pub shared: usize,

    /// Entries removed to make room
    pub evictions: usize,

    /// Current number of entries
    pub entries: usize,
}

impl CacheMetrics {
    /// Fraction of requests that did not execute
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses + self.shared;
        if total == 0 {
            0.0
        } else {
            (self.hits + self.shared) as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    response: Response,
    created_at: Instant,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn new(response: Response, ttl: Option<Duration>) -> Self {
        let now = Instant::now();
        Self {
            response,
            created_at: now,
            expires_at: ttl.map(|ttl| now + ttl),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|expiry| Instant::now() > expiry)
    }
}

struct Flight {
    id: u64,
    receiver: watch::Receiver<Option<Response>>,
}

#[derive(Default)]
struct Inflight {
    next_id: u64,
    flights: HashMap<String, Flight>,
}

enum Role {
    Leader(u64, watch::Sender<Option<Response>>),
    Follower(watch::Receiver<Option<Response>>),
}

/// Removes the leader's in-flight record however the leader ends
struct FlightGuard<'a> {
    inflight: &'a Mutex<Inflight>,
    key: &'a str,
    id: u64,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        let mut inflight = self.inflight.lock();
        if inflight.flights.get(self.key).is_some_and(|f| f.id == self.id) {
            inflight.flights.remove(self.key);
        }
    }
}

/// Caches successful responses and deduplicates concurrent identical requests
pub struct CacheMiddleware {
    config: CacheConfig,
    entries: Mutex<HashMap<String, CacheEntry>>,
    inflight: Mutex<Inflight>,
    metrics: Mutex<CacheMetrics>,
    key_fn: Option<KeyFn>,
}

impl std::fmt::Debug for CacheMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheMiddleware")
            .field("config", &self.config)
            .field("metrics", &self.metrics())
            .finish()
    }
}

impl Default for CacheMiddleware {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl CacheMiddleware {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
            inflight: Mutex::new(Inflight::default()),
            metrics: Mutex::new(CacheMetrics::default()),
            key_fn: None,
        }
    }

    /// Replace the default [`fingerprint`] with a custom key function
    pub fn with_key_fn<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&Request) -> String + Send + Sync + 'static,
    {
        self.key_fn = Some(Arc::new(key_fn));
        self
    }

    /// Current metrics
    pub fn metrics(&self) -> CacheMetrics {
        let mut metrics = self.metrics.lock().clone();
        metrics.entries = self.entries.lock().len();
        metrics
    }

    /// Number of stored responses, including expired ones not yet purged
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop the stored response for a key
    pub fn invalidate(&self, key: &str) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    /// Drop every stored response
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    fn key_for(&self, request: &Request) -> String {
        match &self.key_fn {
            Some(key_fn) => key_fn(request),
            None => fingerprint(request),
        }
    }

    fn lookup(&self, key: &str) -> Option<Response> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_expired() => {
                entries.remove(key);
                None
            }
            Some(entry) => Some(entry.response.clone()),
            None => None,
        }
    }

    fn store(&self, key: String, response: Response) {
        let mut entries = self.entries.lock();
        if !entries.contains_key(&key) && entries.len() >= self.config.max_entries {
            entries.retain(|_, entry| !entry.is_expired());
            let mut evicted = 0;
            while entries.len() >= self.config.max_entries {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.created_at)
                    .map(|(key, _)| key.clone());
                match oldest {
                    Some(oldest) => {
                        entries.remove(&oldest);
                        evicted += 1;
                    }
                    None => break,
                }
            }
            self.metrics.lock().evictions += evicted;
        }
        if self.config.max_entries > 0 {
            entries.insert(key, CacheEntry::new(response, self.config.ttl));
        }
    }

    fn hit(&self, mut response: Response) -> Response {
        self.metrics.lock().hits += 1;
        response.metadata.cache_hit = true;
        response.metadata.retry_count = 0;
        response
    }

    fn claim(&self, key: &str) -> std::result::Result<Role, Response> {
        let mut inflight = self.inflight.lock();
        // A leader may have stored its result between our first lookup and now.
        if let Some(response) = self.lookup(key) {
            return Err(response);
        }
        if let Some(flight) = inflight.flights.get(key) {
            return Ok(Role::Follower(flight.receiver.clone()));
        }
        inflight.next_id += 1;
        let id = inflight.next_id;
        let (sender, receiver) = watch::channel(None);
        inflight
            .flights
            .insert(key.to_string(), Flight { id, receiver });
        Ok(Role::Leader(id, sender))
    }
}

#[async_trait]
impl Middleware for CacheMiddleware {
    fn name(&self) -> &str {
        "cache"
    }

    async fn handle(&self, request: Request, next: Next<'_>) -> Response {
        let key = self.key_for(&request);

        if let Some(response) = self.lookup(&key) {
            debug!(request = %request.target, key = %key, "Cache hit");
            return self.hit(response);
        }

        let role = match self.claim(&key) {
            Ok(role) => role,
            Err(response) => return self.hit(response),
        };

        match role {
            Role::Leader(id, sender) => {
                let _guard = FlightGuard {
                    inflight: &self.inflight,
                    key: &key,
                    id,
                };
                self.metrics.lock().misses += 1;

                let response = next.run(request).await;
                if response.is_ok() {
                    self.store(key.clone(), response.clone());
                }
                sender.send_replace(Some(response.clone()));
                response
            }
            Role::Follower(mut receiver) => {
                debug!(request = %request.target, key = %key, "Joining in-flight request");
                loop {
                    let current = receiver.borrow_and_update().clone();
                    if let Some(mut response) = current {
                        self.metrics.lock().shared += 1;
                        response.metadata.shared = true;
                        return response;
                    }
                    if receiver.changed().await.is_err() {
                        break;
                    }
                }
                debug!(request = %request.target, key = %key, "Leader dropped, executing");
                next.run(request).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{handler_fn, MiddlewareChain};
    use crate::RuntimeError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_handler(
        calls: Arc<AtomicUsize>,
        delay: Duration,
    ) -> impl crate::middleware::Handler {
        handler_fn(move |req: Request| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                Ok(json!({"echo": req.input}))
            }
        })
    }

    #[test]
    fn test_fingerprint_ignores_key_order_and_context() {
        let a = Request::new("step", json!({"b": 1, "a": {"y": 2, "x": 1}}));
        let b = Request::new("step", json!({"a": {"x": 1, "y": 2}, "b": 1}))
            .with_context("trace", json!("abc"));
        let c = Request::new("other", json!({"b": 1, "a": {"y": 2, "x": 1}}));

        assert_eq!(fingerprint(&a), fingerprint(&b));
        assert_ne!(fingerprint(&a), fingerprint(&c));
    }

    #[test]
    fn test_fingerprint_is_stable_sha256() {
        let request = Request::new("pricing.lookup", json!({"sku": "X1"}));
        // sha256(r#"{"input":{"sku":"X1"},"target":"pricing.lookup"}"#)
        assert_eq!(
            fingerprint(&request),
            "7be90ad17994e1330c22f0ceec44320190fc2fed3258398b8541295799400987"
        );
    }

    #[tokio::test]
    async fn test_distinct_inputs_never_share_entries() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = counting_handler(calls.clone(), Duration::ZERO);
        let cache = Arc::new(CacheMiddleware::new(
            CacheConfig::default().with_max_entries(10_000),
        ));
        let mut chain = MiddlewareChain::new();
        chain.push(cache.clone());

        // Inputs that differ only in type or nesting still get their own entry
        let inputs = [
            json!(1),
            json!("1"),
            json!([1]),
            json!({"n": 1}),
            json!({"n": "1"}),
            json!(null),
            json!(false),
        ];
        for input in inputs.iter().cloned().chain((0..500).map(|n| json!({"n": n}))) {
            let response = chain.execute(Request::new("s", input.clone()), &handler).await;
            assert_eq!(response.result, Ok(json!({"echo": input})));
        }

        // {"n": 1} appears twice, so exactly one hit
        assert_eq!(cache.metrics().hits, 1);
        assert_eq!(calls.load(Ordering::SeqCst), inputs.len() + 499);
    }

    #[tokio::test]
    async fn test_hit_skips_execution() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = counting_handler(calls.clone(), Duration::ZERO);
        let cache = Arc::new(CacheMiddleware::default());
        let mut chain = MiddlewareChain::new();
        chain.push(cache.clone());

        let first = chain.execute(Request::new("s", json!(1)), &handler).await;
        let second = chain.execute(Request::new("s", json!(1)), &handler).await;

        assert_eq!(first.result, second.result);
        assert!(!first.metadata.cache_hit);
        assert!(second.metadata.cache_hit);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.metrics().hits, 1);
        assert_eq!(cache.metrics().misses, 1);
    }

    #[tokio::test]
    async fn test_concurrent_identical_requests_single_flight() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = counting_handler(calls.clone(), Duration::from_millis(50));
        let cache = Arc::new(CacheMiddleware::default());
        let mut chain = MiddlewareChain::new();
        chain.push(cache.clone());

        let (a, b) = tokio::join!(
            chain.execute(Request::new("s", json!({"q": 1})), &handler),
            chain.execute(Request::new("s", json!({"q": 1})), &handler),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.result, b.result);
        assert!(a.metadata.shared || b.metadata.shared);
        assert_eq!(cache.metrics().shared, 1);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = counting_handler(calls.clone(), Duration::ZERO);
        let chain = MiddlewareChain::new().with(CacheMiddleware::new(
            CacheConfig::default().with_ttl(Duration::from_millis(20)),
        ));

        chain.execute(Request::new("s", json!(1)), &handler).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        chain.execute(Request::new("s", json!(1)), &handler).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_errors_not_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handler = handler_fn(move |_req: Request| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<Value, _>(RuntimeError::step("s", "boom"))
            }
        });
        let chain = MiddlewareChain::new().with(CacheMiddleware::default());

        chain.execute(Request::new("s", json!(1)), &handler).await;
        chain.execute(Request::new("s", json!(1)), &handler).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_eviction_oldest_first() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = counting_handler(calls.clone(), Duration::ZERO);
        let cache = Arc::new(CacheMiddleware::new(
            CacheConfig::default().with_max_entries(2),
        ));
        let mut chain = MiddlewareChain::new();
        chain.push(cache.clone());

        for input in [1, 2, 3] {
            chain.execute(Request::new("s", json!(input)), &handler).await;
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.metrics().evictions, 1);

        // 1 was evicted, 3 is still cached
        chain.execute(Request::new("s", json!(3)), &handler).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        chain.execute(Request::new("s", json!(1)), &handler).await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_custom_key_fn() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = counting_handler(calls.clone(), Duration::ZERO);
        let chain = MiddlewareChain::new()
            .with(CacheMiddleware::default().with_key_fn(|req: &Request| req.target.clone()));

        chain.execute(Request::new("s", json!(1)), &handler).await;
        let second = chain.execute(Request::new("s", json!(2)), &handler).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(second.metadata.cache_hit);
    }
}
