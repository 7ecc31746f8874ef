//! Read-through entity cache with request coalescing.
//!
//! ```text
//!   get(key)
//!     ├─ valid entry ──────────────────► resolved synchronously
//!     └─ miss / expired ─► join waiter list for the key
//!          └─ first waiter only ─► spawn fetch ─► decode ─► resolve all,
//!                                                           arrival order
//! ```
//!
//! At most one backend fetch is in flight per key. Every caller that arrives
//! while a fetch is pending joins its waiter list and shares the outcome.
//! Entries expire on a fixed TTL and are evicted lazily on the next lookup.
//!
//! The waiter map is the serialization point: membership changes under one
//! lock, so a caller either sees a finished entry or lands in the list that
//! the fetch will drain. Waiters never resolve while the lock is held.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::oneshot;

use crate::barrier::Barrier;
use crate::entity::{Entity, EntityKey};
use crate::remote::{join_path, RemoteError, RemoteStore};

// ───────────────────────────────────────────────────────────────────
// Configuration and errors
// ───────────────────────────────────────────────────────────────────

/// Tuning knobs for an [`EntityCache`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// How long a fetched entity stays valid.
    pub ttl: Duration,
    /// Upper bound on a single backend fetch. `None` waits indefinitely.
    pub fetch_timeout: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(15 * 60),
            fetch_timeout: Some(Duration::from_secs(10)),
        }
    }
}

impl CacheConfig {
    /// Set the entry TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set or clear the per-fetch timeout.
    pub fn with_fetch_timeout(mut self, limit: Option<Duration>) -> Self {
        self.fetch_timeout = limit;
        self
    }
}

/// Why a lookup failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    /// The backend holds nothing at this key. Definitive, but not cached:
    /// a later lookup asks again.
    #[error("no entity at `{0}`")]
    NotFound(EntityKey),
    /// The backend returned data the entity type rejected.
    #[error("invalid payload for `{0}`")]
    Invalid(EntityKey),
    /// The fetch exceeded the configured deadline.
    #[error("fetch of `{0}` timed out")]
    Timeout(EntityKey),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    /// The cache was dropped before the fetch resolved.
    #[error("cache closed before the fetch resolved")]
    Closed,
}

impl CacheError {
    /// True when the same lookup may succeed if repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CacheError::Invalid(_) | CacheError::Timeout(_) | CacheError::Remote(_)
        )
    }
}

// ───────────────────────────────────────────────────────────────────
// Stats
// ───────────────────────────────────────────────────────────────────

/// Counters for monitoring cache behavior.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub fetches: u64,
    pub joined_waiters: u64,
    pub expirations: u64,
    pub not_found: u64,
    pub invalid_payloads: u64,
    pub timeouts: u64,
    pub invalidations: u64,
    pub entries: usize,
}

struct AtomicCacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    fetches: AtomicU64,
    joined_waiters: AtomicU64,
    expirations: AtomicU64,
    not_found: AtomicU64,
    invalid_payloads: AtomicU64,
    timeouts: AtomicU64,
    invalidations: AtomicU64,
}

impl AtomicCacheStats {
    fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            fetches: AtomicU64::new(0),
            joined_waiters: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            not_found: AtomicU64::new(0),
            invalid_payloads: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Cache
// ───────────────────────────────────────────────────────────────────

struct CacheEntry<T> {
    value: T,
    expires_at: Instant,
}

impl<T> CacheEntry<T> {
    fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_valid(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

struct CacheState<T: Entity> {
    entries: HashMap<EntityKey, CacheEntry<T>>,
    waiters: HashMap<EntityKey, Vec<oneshot::Sender<Result<T, CacheError>>>>,
}

struct CacheInner<T: Entity> {
    remote: Arc<dyn RemoteStore>,
    root: String,
    config: CacheConfig,
    state: Mutex<CacheState<T>>,
    stats: AtomicCacheStats,
}

/// Keyed read-through cache over a [`RemoteStore`] subtree.
///
/// Cloning is cheap and every clone shares entries, waiters and stats.
pub struct EntityCache<T: Entity> {
    inner: Arc<CacheInner<T>>,
}

impl<T: Entity> Clone for EntityCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Entity> EntityCache<T> {
    /// Create a cache over `root` with the given configuration.
    pub fn new(remote: Arc<dyn RemoteStore>, root: impl Into<String>, config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                remote,
                root: root.into(),
                config,
                state: Mutex::new(CacheState {
                    entries: HashMap::new(),
                    waiters: HashMap::new(),
                }),
                stats: AtomicCacheStats::new(),
            }),
        }
    }

    /// Look up one entity, fetching from the backend on a miss.
    ///
    /// A valid entry resolves without touching the backend or yielding.
    /// Concurrent callers for the same key share one fetch and resolve in
    /// arrival order.
    pub async fn get(&self, key: &str) -> Result<T, CacheError> {
        let (rx, first) = {
            let mut state = self.inner.state.lock().unwrap();
            if let Some(entry) = state.entries.get(key) {
                if entry.is_valid() {
                    self.inner.stats.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(entry.value.clone());
                }
            }
            if state.entries.remove(key).is_some() {
                self.inner.stats.expirations.fetch_add(1, Ordering::Relaxed);
            }
            self.inner.stats.misses.fetch_add(1, Ordering::Relaxed);

            let (tx, rx) = oneshot::channel();
            let waiters = state.waiters.entry(key.to_string()).or_default();
            let first = waiters.is_empty();
            if !first {
                self.inner.stats.joined_waiters.fetch_add(1, Ordering::Relaxed);
            }
            waiters.push(tx);
            (rx, first)
        };

        if first {
            self.spawn_fetch(key.to_string());
        }
        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(CacheError::Closed),
        }
    }

    /// Look up a batch of entities concurrently.
    ///
    /// Returns present values in the order of the requested keys. Keys the
    /// backend reports as missing are omitted; any other failure fails the
    /// whole batch. An empty key list resolves immediately.
    pub async fn get_many(&self, keys: &[EntityKey]) -> Result<Vec<T>, CacheError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let barrier = Barrier::new(keys.len());
        let slots: Arc<Mutex<Vec<Option<Result<T, CacheError>>>>> =
            Arc::new(Mutex::new((0..keys.len()).map(|_| None).collect()));

        for (index, key) in keys.iter().cloned().enumerate() {
            let cache = self.clone();
            let barrier = barrier.clone();
            let slots = slots.clone();
            tokio::spawn(async move {
                let outcome = cache.get(&key).await;
                slots.lock().unwrap()[index] = Some(outcome);
                barrier.decrement();
            });
        }
        barrier.wait().await;

        let mut slots = slots.lock().unwrap();
        let mut values = Vec::with_capacity(slots.len());
        for slot in slots.drain(..) {
            match slot {
                Some(Ok(value)) => values.push(value),
                Some(Err(CacheError::NotFound(_))) => {}
                Some(Err(err)) => return Err(err),
                None => return Err(CacheError::Closed),
            }
        }
        Ok(values)
    }

    /// Return the cached value without fetching or evicting.
    pub fn peek(&self, key: &str) -> Option<T> {
        let state = self.inner.state.lock().unwrap();
        state
            .entries
            .get(key)
            .filter(|entry| entry.is_valid())
            .map(|entry| entry.value.clone())
    }

    /// Drop the entry for `key` so the next lookup refetches.
    pub fn invalidate(&self, key: &str) {
        let mut state = self.inner.state.lock().unwrap();
        if state.entries.remove(key).is_some() {
            self.inner.stats.invalidations.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Number of cached entries, valid or expired.
    pub fn entry_count(&self) -> usize {
        self.inner.state.lock().unwrap().entries.len()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> CacheStats {
        let entries = self.entry_count();
        let stats = &self.inner.stats;
        CacheStats {
            hits: stats.hits.load(Ordering::Relaxed),
            misses: stats.misses.load(Ordering::Relaxed),
            fetches: stats.fetches.load(Ordering::Relaxed),
            joined_waiters: stats.joined_waiters.load(Ordering::Relaxed),
            expirations: stats.expirations.load(Ordering::Relaxed),
            not_found: stats.not_found.load(Ordering::Relaxed),
            invalid_payloads: stats.invalid_payloads.load(Ordering::Relaxed),
            timeouts: stats.timeouts.load(Ordering::Relaxed),
            invalidations: stats.invalidations.load(Ordering::Relaxed),
            entries,
        }
    }

    fn spawn_fetch(&self, key: EntityKey) {
        self.inner.stats.fetches.fetch_add(1, Ordering::Relaxed);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let path = join_path(&inner.root, &key);
            let fetched = match inner.config.fetch_timeout {
                Some(limit) => {
                    match tokio::time::timeout(limit, inner.remote.fetch_once(&path)).await {
                        Ok(result) => result,
                        Err(_) => {
                            inner.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                            log::warn!("fetch of {} timed out after {:?}", path, limit);
                            resolve(&inner, &key, Err(CacheError::Timeout(key.clone())));
                            return;
                        }
                    }
                }
                None => inner.remote.fetch_once(&path).await,
            };

            let outcome = match fetched {
                Err(err) => Err(CacheError::Remote(err)),
                Ok(None) => {
                    inner.stats.not_found.fetch_add(1, Ordering::Relaxed);
                    Err(CacheError::NotFound(key.clone()))
                }
                Ok(Some(raw)) => match T::decode(&key, &raw) {
                    Ok(value) => Ok(value),
                    Err(err) => {
                        inner.stats.invalid_payloads.fetch_add(1, Ordering::Relaxed);
                        log::warn!("dropping invalid payload at {}: {}", path, err);
                        Err(CacheError::Invalid(key.clone()))
                    }
                },
            };
            resolve(&inner, &key, outcome);
        });
    }
}

/// Record the outcome (successes become entries) and drain the key's
/// waiter list. Senders fire outside the lock, in the order callers joined.
fn resolve<T: Entity>(inner: &CacheInner<T>, key: &str, outcome: Result<T, CacheError>) {
    let waiters = {
        let mut state = inner.state.lock().unwrap();
        if let Ok(value) = &outcome {
            state
                .entries
                .insert(key.to_string(), CacheEntry::new(value.clone(), inner.config.ttl));
        }
        state.waiters.remove(key).unwrap_or_default()
    };
    for waiter in waiters {
        let _ = waiter.send(outcome.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRemote;
    use crate::testutil::{user_json, TestUser};
    use futures_util::FutureExt;
    use serde_json::json;

    async fn seeded_remote() -> Arc<MemoryRemote> {
        let remote = Arc::new(MemoryRemote::new());
        remote
            .write("users/u1", Some(user_json("Ada", 10)))
            .await
            .unwrap();
        remote
            .write("users/u2", Some(user_json("Bo", 20)))
            .await
            .unwrap();
        remote
            .write("users/u3", Some(user_json("Cleo", 30)))
            .await
            .unwrap();
        remote
    }

    fn cache_over(remote: Arc<MemoryRemote>, config: CacheConfig) -> EntityCache<TestUser> {
        EntityCache::new(remote, "users", config)
    }

    #[tokio::test]
    async fn test_miss_fetches_then_hit_resolves_synchronously() {
        let remote = seeded_remote().await;
        let cache = cache_over(remote.clone(), CacheConfig::default());

        let user = cache.get("u1").await.unwrap();
        assert_eq!(user.name, "Ada");
        assert_eq!(remote.stats().fetches, 1);

        // Warm entry resolves without reaching an await point.
        let warm = cache.get("u1").now_or_never().unwrap().unwrap();
        assert_eq!(warm.name, "Ada");
        assert_eq!(remote.stats().fetches, 1);

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn test_concurrent_gets_share_one_fetch() {
        let remote = Arc::new(MemoryRemote::with_latency(Duration::from_millis(20)));
        remote
            .write("users/u1", Some(user_json("Ada", 10)))
            .await
            .unwrap();
        let cache = cache_over(remote.clone(), CacheConfig::default());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.get("u1").await }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().name, "Ada");
        }

        assert_eq!(remote.stats().fetches, 1);
        let stats = cache.stats();
        assert_eq!(stats.misses, 8);
        assert_eq!(stats.joined_waiters, 7);
        assert_eq!(stats.fetches, 1);
    }

    #[tokio::test]
    async fn test_waiters_resolve_in_arrival_order() {
        let remote = Arc::new(MemoryRemote::with_latency(Duration::from_millis(30)));
        remote
            .write("users/u1", Some(user_json("Ada", 10)))
            .await
            .unwrap();
        let cache = cache_over(remote, CacheConfig::default());

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for index in 0..5 {
            let cache = cache.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _ = cache.get("u1").await.unwrap();
                order.lock().unwrap().push(index);
            }));
            // Park each caller on the waiter list before the next arrives.
            tokio::task::yield_now().await;
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_expired_entry_refetches() {
        let remote = seeded_remote().await;
        let config = CacheConfig::default().with_ttl(Duration::from_millis(40));
        let cache = cache_over(remote.clone(), config);

        cache.get("u1").await.unwrap();
        cache.get("u1").await.unwrap();
        assert_eq!(remote.stats().fetches, 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        cache.get("u1").await.unwrap();
        assert_eq!(remote.stats().fetches, 2);
        assert_eq!(cache.stats().expirations, 1);
    }

    #[tokio::test]
    async fn test_missing_key_is_not_found_and_not_cached() {
        let remote = seeded_remote().await;
        let cache = cache_over(remote.clone(), CacheConfig::default());

        let err = cache.get("ghost").await.unwrap_err();
        assert_eq!(err, CacheError::NotFound("ghost".to_string()));
        assert!(!err.is_retryable());
        assert_eq!(cache.entry_count(), 0);

        // The entity appearing later is picked up by the next lookup.
        remote
            .write("users/ghost", Some(user_json("Ghost", 0)))
            .await
            .unwrap();
        assert_eq!(cache.get("ghost").await.unwrap().name, "Ghost");
    }

    #[tokio::test]
    async fn test_invalid_payload_resolves_error_and_leaves_no_entry() {
        let remote = Arc::new(MemoryRemote::new());
        remote
            .write("users/u1", Some(json!({"wrong": true})))
            .await
            .unwrap();
        let cache = cache_over(remote.clone(), CacheConfig::default());

        let err = cache.get("u1").await.unwrap_err();
        assert_eq!(err, CacheError::Invalid("u1".to_string()));
        assert!(err.is_retryable());
        assert_eq!(cache.entry_count(), 0);
        assert_eq!(cache.stats().invalid_payloads, 1);

        // A corrected payload succeeds on retry.
        remote
            .write("users/u1", Some(user_json("Ada", 10)))
            .await
            .unwrap();
        assert_eq!(cache.get("u1").await.unwrap().name, "Ada");
        assert_eq!(remote.stats().fetches, 2);
    }

    #[tokio::test]
    async fn test_slow_fetch_times_out() {
        let remote = Arc::new(MemoryRemote::with_latency(Duration::from_millis(500)));
        remote
            .write("users/u1", Some(user_json("Ada", 10)))
            .await
            .unwrap();
        let config = CacheConfig::default().with_fetch_timeout(Some(Duration::from_millis(50)));
        let cache = cache_over(remote, config);

        let err = cache.get("u1").await.unwrap_err();
        assert_eq!(err, CacheError::Timeout("u1".to_string()));
        assert!(err.is_retryable());
        assert_eq!(cache.stats().timeouts, 1);
        assert_eq!(cache.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_get_many_empty_resolves_immediately() {
        let remote = seeded_remote().await;
        let cache = cache_over(remote, CacheConfig::default());

        let values = cache.get_many(&[]).now_or_never().unwrap().unwrap();
        assert!(values.is_empty());
    }

    #[tokio::test]
    async fn test_get_many_preserves_request_order() {
        let remote = Arc::new(MemoryRemote::with_latency(Duration::from_millis(10)));
        remote
            .write("users/u1", Some(user_json("Ada", 10)))
            .await
            .unwrap();
        remote
            .write("users/u2", Some(user_json("Bo", 20)))
            .await
            .unwrap();
        remote
            .write("users/u3", Some(user_json("Cleo", 30)))
            .await
            .unwrap();
        let cache = cache_over(remote, CacheConfig::default());

        let keys = vec!["u3".to_string(), "u1".to_string(), "u2".to_string()];
        let values = cache.get_many(&keys).await.unwrap();
        let uids: Vec<&str> = values.iter().map(|u| u.uid.as_str()).collect();
        assert_eq!(uids, vec!["u3", "u1", "u2"]);
    }

    #[tokio::test]
    async fn test_get_many_omits_missing_keys() {
        let remote = seeded_remote().await;
        let cache = cache_over(remote, CacheConfig::default());

        let keys = vec!["u1".to_string(), "ghost".to_string(), "u2".to_string()];
        let values = cache.get_many(&keys).await.unwrap();
        let uids: Vec<&str> = values.iter().map(|u| u.uid.as_str()).collect();
        assert_eq!(uids, vec!["u1", "u2"]);
    }

    #[tokio::test]
    async fn test_get_many_fails_on_hard_error() {
        let remote = Arc::new(MemoryRemote::with_latency(Duration::from_millis(200)));
        remote
            .write("users/u1", Some(user_json("Ada", 10)))
            .await
            .unwrap();
        let config = CacheConfig::default().with_fetch_timeout(Some(Duration::from_millis(30)));
        let cache = cache_over(remote, config);

        let keys = vec!["u1".to_string(), "u2".to_string()];
        let err = cache.get_many(&keys).await.unwrap_err();
        assert!(matches!(err, CacheError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_invalidate_forces_refetch() {
        let remote = seeded_remote().await;
        let cache = cache_over(remote.clone(), CacheConfig::default());

        cache.get("u1").await.unwrap();
        remote
            .write("users/u1", Some(user_json("Ada Lovelace", 11)))
            .await
            .unwrap();
        assert_eq!(cache.get("u1").await.unwrap().name, "Ada");

        cache.invalidate("u1");
        assert_eq!(cache.get("u1").await.unwrap().name, "Ada Lovelace");
        assert_eq!(remote.stats().fetches, 2);
        assert_eq!(cache.stats().invalidations, 1);
    }

    #[tokio::test]
    async fn test_peek_does_not_fetch() {
        let remote = seeded_remote().await;
        let cache = cache_over(remote.clone(), CacheConfig::default());

        assert!(cache.peek("u1").is_none());
        cache.get("u1").await.unwrap();
        assert_eq!(cache.peek("u1").unwrap().name, "Ada");
        assert_eq!(remote.stats().fetches, 1);
    }
}
