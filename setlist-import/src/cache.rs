//! In-process TTL cache with request de-duplication
//!
//! Values are stored as opaque JSON keyed by
//! `<provider>:<operation>:<external id>:<locale>`. Expiry is passive:
//! stale entries are ignored on read and dropped on eviction.
//!
//! `get_or_fetch` collapses concurrent misses for the same key onto one
//! upstream fetch. The fetch result is shared with every waiter; errors are
//! shared but never stored.

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::{ImportError, ImportResult};

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Build a cache key from its parts
pub fn cache_key(provider: &str, operation: &str, external_id: &str, locale: &str) -> String {
    format!("{provider}:{operation}:{external_id}:{locale}")
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: Value,
    pub expires_at: Instant,
}

impl CacheEntry {
    fn is_fresh(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

type InflightFetch = Shared<BoxFuture<'static, ImportResult<Value>>>;

struct LockState {
    token: u64,
    expires_at: Instant,
}

struct Inner {
    entries: Mutex<HashMap<String, CacheEntry>>,
    inflight: Mutex<HashMap<String, InflightFetch>>,
    locks: Mutex<HashMap<String, LockState>>,
    max_entries: usize,
    next_token: AtomicU64,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Inner {
    fn store(&self, key: String, value: Value, ttl: Duration) {
        let now = Instant::now();
        let mut entries = guard(&self.entries);

        if entries.len() >= self.max_entries && !entries.contains_key(&key) {
            entries.retain(|_, entry| entry.is_fresh(now));
            while entries.len() >= self.max_entries {
                let victim = entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.expires_at)
                    .map(|(k, _)| k.clone());
                match victim {
                    Some(k) => {
                        entries.remove(&k);
                    }
                    None => break,
                }
            }
        }

        entries.insert(
            key,
            CacheEntry {
                value,
                expires_at: now + ttl,
            },
        );
    }

    fn fresh(&self, key: &str) -> Option<Value> {
        let entries = guard(&self.entries);
        entries
            .get(key)
            .filter(|entry| entry.is_fresh(Instant::now()))
            .map(|entry| entry.value.clone())
    }
}

/// Shared TTL cache, cheap to clone
#[derive(Clone)]
pub struct TtlCache {
    inner: Arc<Inner>,
}

impl TtlCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                inflight: Mutex::new(HashMap::new()),
                locks: Mutex::new(HashMap::new()),
                max_entries: max_entries.max(1),
                next_token: AtomicU64::new(1),
            }),
        }
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.inner.fresh(key)?;
        serde_json::from_value(value).ok()
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> ImportResult<()> {
        let value = serde_json::to_value(value)?;
        self.inner.store(key.to_string(), value, ttl);
        Ok(())
    }

    pub fn invalidate(&self, key: &str) {
        guard(&self.inner.entries).remove(key);
    }

    /// Number of stored entries, including expired ones not yet evicted
    pub fn len(&self) -> usize {
        guard(&self.inner.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cached value if fresh, otherwise one shared fetch for all callers
    pub async fn get_or_fetch<T, F, Fut>(&self, key: &str, ttl: Duration, fetch: F) -> ImportResult<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = ImportResult<T>> + Send + 'static,
    {
        let shared = {
            let mut inflight = guard(&self.inner.inflight);

            // Checked under the in-flight lock: a finished fetch stores its
            // value before it deregisters.
            if let Some(value) = self.inner.fresh(key) {
                return decode(key, value);
            }

            match inflight.get(key) {
                Some(existing) => {
                    debug!(key, "Joining in-flight fetch");
                    existing.clone()
                }
                None => {
                    let inner = Arc::clone(&self.inner);
                    let owned_key = key.to_string();
                    let upstream = fetch();
                    let fut: BoxFuture<'static, ImportResult<Value>> = async move {
                        let result = match upstream.await {
                            Ok(v) => serde_json::to_value(v).map_err(ImportError::from),
                            Err(e) => Err(e),
                        };
                        if let Ok(value) = &result {
                            inner.store(owned_key.clone(), value.clone(), ttl);
                        }
                        guard(&inner.inflight).remove(&owned_key);
                        result
                    }
                    .boxed();
                    let shared = fut.shared();
                    inflight.insert(key.to_string(), shared.clone());
                    shared
                }
            }
        };

        let value = shared.await?;
        decode(key, value)
    }

    /// Acquire a short-lived named lock
    ///
    /// The lock expires after `ttl` even if the guard is leaked, and waiting
    /// gives up after `wait`.
    pub async fn acquire_lock(&self, key: &str, ttl: Duration, wait: Duration) -> ImportResult<CacheLock> {
        let deadline = Instant::now() + wait;
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);

        loop {
            {
                let now = Instant::now();
                let mut locks = guard(&self.inner.locks);
                let free = locks.get(key).map_or(true, |held| held.expires_at <= now);
                if free {
                    locks.insert(
                        key.to_string(),
                        LockState {
                            token,
                            expires_at: now + ttl,
                        },
                    );
                    return Ok(CacheLock {
                        inner: Arc::clone(&self.inner),
                        key: key.to_string(),
                        token,
                    });
                }
            }

            if Instant::now() >= deadline {
                return Err(ImportError::LockBusy(key.to_string()));
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        }
    }
}

fn decode<T: DeserializeOwned>(key: &str, value: Value) -> ImportResult<T> {
    serde_json::from_value(value)
        .map_err(|e| ImportError::Validation(format!("cached value {key} has unexpected shape: {e}")))
}

/// Held lock; released on drop
pub struct CacheLock {
    inner: Arc<Inner>,
    key: String,
    token: u64,
}

impl CacheLock {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let mut locks = guard(&self.inner.locks);
        // Only release our own acquisition; after expiry someone else may hold it
        if locks.get(&self.key).map(|held| held.token) == Some(self.token) {
            locks.remove(&self.key);
        }
    }
}
