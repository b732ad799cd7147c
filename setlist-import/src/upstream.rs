//! Guarded upstream calls
//!
//! Every adapter call made by the orchestrator goes through `Upstream`,
//! which layers, outermost first:
//!
//! 1. response cache with in-flight de-duplication (`cached` only)
//! 2. fast fail while the dependency's circuit is open
//! 3. per-dependency token bucket with bounded wait
//! 4. circuit breaker accounting
//! 5. per-call timeout (a timeout is a transient failure)

use setlist_common::config::{ImportConfig, UpstreamLimit};
use setlist_common::events::EventBus;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::adapters::Dependency;
use crate::breaker::{BreakerRegistry, CircuitState};
use crate::cache::TtlCache;
use crate::error::{ImportError, ImportResult};
use crate::rate_limit::TokenBucket;

struct Limit {
    bucket: TokenBucket,
    max_wait: Duration,
}

impl Limit {
    fn from_config(limit: &UpstreamLimit) -> ImportResult<Self> {
        Ok(Self {
            bucket: TokenBucket::new(limit.max, Duration::from_millis(limit.duration_ms))?,
            max_wait: Duration::from_millis(limit.max_wait_ms),
        })
    }
}

#[derive(Clone)]
pub struct Upstream {
    breakers: BreakerRegistry,
    limits: Arc<HashMap<Dependency, Limit>>,
    cache: TtlCache,
    response_ttl: Duration,
}

impl Upstream {
    pub fn new(config: &ImportConfig, cache: TtlCache, events: Option<EventBus>) -> ImportResult<Self> {
        let mut limits = HashMap::new();
        limits.insert(
            Dependency::Ticketing,
            Limit::from_config(&config.rate_limits.ticketing)?,
        );
        limits.insert(
            Dependency::Catalog,
            Limit::from_config(&config.rate_limits.catalog)?,
        );
        limits.insert(
            Dependency::Archive,
            Limit::from_config(&config.rate_limits.archive)?,
        );

        Ok(Self {
            breakers: BreakerRegistry::new(&config.breaker, events),
            limits: Arc::new(limits),
            cache,
            response_ttl: Duration::from_secs(config.cache.response_ttl_secs),
        })
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub fn cache(&self) -> &TtlCache {
        &self.cache
    }

    /// How long cached responses stay fresh
    pub fn response_ttl(&self) -> Duration {
        self.response_ttl
    }

    /// Whether calls to `dependency` currently fail fast
    pub fn is_open(&self, dependency: Dependency) -> bool {
        self.breakers.get(dependency).state() == CircuitState::Open
    }

    /// One guarded upstream call, uncached
    pub async fn call<T, F, Fut>(
        &self,
        dependency: Dependency,
        call_timeout: Duration,
        f: F,
    ) -> ImportResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ImportResult<T>>,
    {
        let breaker = self.breakers.get(dependency);

        // Do not spend a token on a call the breaker would refuse
        if breaker.state() == CircuitState::Open {
            return Err(ImportError::CircuitOpen { dependency });
        }

        if let Some(limit) = self.limits.get(&dependency) {
            if !limit.bucket.acquire_within(limit.max_wait).await {
                debug!(dependency = %dependency, "Rate limit wait exceeded");
                return Err(ImportError::RateLimited { dependency });
            }
        }

        breaker
            .call(|| async move {
                match tokio::time::timeout(call_timeout, f()).await {
                    Ok(result) => result,
                    Err(_) => Err(ImportError::transient(
                        dependency,
                        format!("timed out after {}ms", call_timeout.as_millis()),
                    )),
                }
            })
            .await
    }

    /// Guarded call whose result is cached under `key` for the sync window
    pub async fn cached<T, F, Fut>(
        &self,
        dependency: Dependency,
        key: String,
        call_timeout: Duration,
        f: F,
    ) -> ImportResult<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ImportResult<T>> + Send + 'static,
    {
        let this = self.clone();
        self.cache
            .get_or_fetch(&key, self.response_ttl, move || async move {
                this.call(dependency, call_timeout, f).await
            })
            .await
    }
}
