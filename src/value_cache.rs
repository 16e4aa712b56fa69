//! Entity blobs and scalar counters in the shared cache store.
//!
//! Reads are cache-aside: a miss loads from the durable store through the coalescer and populates the entry with a
//! jittered TTL. Cached counters are never overwritten, only moved by atomic deltas.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::instrument;
use tracing::trace;
use tracing::warn;

use crate::coalesce::Coalescer;
use crate::config::EngineConfig;
use crate::db::Repository;
use crate::error::Error;
use crate::error::Result;
use crate::store::CacheStore;
use crate::types::Counter;

/// Base TTL plus a uniform random addition, so entries populated together don't expire together.
#[derive(Debug, Clone, Copy)]
pub struct TtlPolicy {
    base:   Duration,
    jitter: Duration,
}

impl TtlPolicy {
    pub fn new(base: Duration, jitter: Duration) -> Self {
        Self { base, jitter }
    }

    pub fn next(&self) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.base;
        }
        self.base + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }
}

/// Bounded retries of transient read failures.
#[derive(Debug, Clone, Copy)]
pub struct ReadRetry {
    retries: u32,
    backoff: Duration,
}

impl ReadRetry {
    pub fn new(retries: u32, backoff: Duration) -> Self {
        Self { retries, backoff }
    }

    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => {
                    if attempts > self.retries {
                        return Err(Error::Busy {
                            attempts,
                            source: Box::new(err),
                        });
                    }
                    warn!("reading {what} failed (attempt {attempts}): {err}");
                    tokio::time::sleep(self.backoff * attempts).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[derive(Debug)]
pub struct ValueCache {
    store:    Arc<dyn CacheStore>,
    repo:     Arc<Repository>,
    blobs:    Coalescer<String, Option<Vec<u8>>>,
    counters: Coalescer<String, i64>,
    ttl:      TtlPolicy,
    retry:    ReadRetry,
}

impl ValueCache {
    pub fn new(store: Arc<dyn CacheStore>, repo: Arc<Repository>, config: &EngineConfig) -> Self {
        Self {
            store,
            repo,
            blobs: Coalescer::new(config.coalesce_grace()),
            counters: Coalescer::new(config.coalesce_grace()),
            ttl: TtlPolicy::new(config.base_ttl(), config.ttl_jitter()),
            retry: ReadRetry::new(config.read_retries(), config.retry_backoff()),
        }
    }

    /// Read a blob, loading it with `loader` on a miss. `Ok(None)` if the durable store doesn't have it either; absent
    /// values are not cached.
    #[instrument(level = "trace", skip(self, loader))]
    pub async fn get_or_load<T, F, Fut>(&self, key: &str, loader: F) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Option<T>>> + Send + 'static,
    {
        let loader = &loader;
        let bytes = self
            .retry
            .run(key, || async move {
                if let Some(bytes) = self.store.get(key).await? {
                    return Ok(Some(bytes));
                }

                trace!("blob {key} is cold");
                let store = self.store.clone();
                let ttl = self.ttl.next();
                let cache_key = key.to_owned();
                let load = loader();
                self.blobs
                    .load(key.to_owned(), move || async move {
                        let Some(value) = load.await?
                        else {
                            return Ok(None);
                        };
                        let bytes = serde_json::to_vec(&value)?;
                        store.set(&cache_key, bytes.clone(), ttl).await?;
                        Ok(Some(bytes))
                    })
                    .await
            })
            .await?;

        Ok(bytes.map(|bytes| serde_json::from_slice(&bytes)).transpose()?)
    }

    /// Drop a cached entry. A load finished within the coalescer's grace window is forgotten too, so the next read
    /// goes to the durable store.
    pub async fn invalidate(&self, key: &str) -> Result<()> {
        self.store.delete(key).await?;
        let key = key.to_owned();
        self.blobs.forget(&key);
        self.counters.forget(&key);
        Ok(())
    }

    #[instrument(level = "trace", skip(self))]
    pub async fn get_counter(&self, counter: Counter, key: i64) -> Result<i64> {
        let cache_key = counter.cache_key(key);
        let cache_key = cache_key.as_str();
        self.retry
            .run(cache_key, || async move {
                match self.store.get_counter(cache_key).await? {
                    Some(value) => Ok(value),
                    None => self.load_counter(counter, key, cache_key).await,
                }
            })
            .await
    }

    // Populate a cold counter from the durable store. Returns the cached value, which may already carry deltas if
    // another writer populated it first.
    async fn load_counter(&self, counter: Counter, key: i64, cache_key: &str) -> Result<i64> {
        let store = self.store.clone();
        let repo = self.repo.clone();
        let ttl = self.ttl.next();
        let owned_key = cache_key.to_owned();
        self.counters
            .load(cache_key.to_owned(), move || async move {
                let base = repo.count(counter, key).await?;
                store.set_counter_if_absent(&owned_key, base, ttl).await
            })
            .await
    }

    /// Apply `delta` to a counter. A cold counter is first loaded from the durable store; the delta is then added
    /// atomically, so concurrent adjustments commute and none is lost.
    #[instrument(level = "trace", skip(self))]
    pub async fn adjust_counter(&self, counter: Counter, key: i64, delta: i64) -> Result<i64> {
        let cache_key = counter.cache_key(key);
        if let Some(value) = self.store.incr_by_if_exists(&cache_key, delta).await? {
            return Ok(value);
        }

        let base = self.load_counter(counter, key, &cache_key).await?;
        self.store
            .incr_by_or_init(&cache_key, base, delta, self.ttl.next())
            .await
    }

    /// Apply `delta` only if the counter is cached. A cold counter will be loaded from the durable store which
    /// already reflects the change.
    pub async fn adjust_cached_counter(&self, counter: Counter, key: i64, delta: i64) -> Result<Option<i64>> {
        self.store.incr_by_if_exists(&counter.cache_key(key), delta).await
    }

    pub async fn invalidate_counter(&self, counter: Counter, key: i64) -> Result<()> {
        self.invalidate(&counter.cache_key(key)).await
    }
}
