//! Bounded stale-while-revalidate cache for key and override metadata.
//!
//! Entries younger than `fresh_for` are served as is. Older entries are still
//! served, but trigger one background reload; entries older than `stale_for`
//! are evicted by the underlying moka cache and must be loaded synchronously.
//! Concurrent cold loads of the same key are coalesced.

use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use moka::future::Cache;
use tracing::{trace, warn};

use crate::clock::Clock;
use crate::store::StoreError;

/// Sizing and freshness of a [`SwrCache`].
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    pub max_entries: u64,
    pub fresh_for: Duration,
    pub stale_for: Duration,
}

struct Entry<V> {
    value: V,
    loaded_at_ms: u64,
}

pub struct SwrCache<K, V> {
    name: &'static str,
    entries: Cache<K, Arc<Entry<V>>>,
    fresh_for_ms: u64,
    clock: Arc<dyn Clock>,
    refreshing: Arc<DashMap<K, ()>>,
    /// Bumped on every invalidation so in-flight refreshes don't resurrect
    /// invalidated values
    generation: Arc<AtomicU64>,
}

impl<K, V> Clone for SwrCache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            entries: self.entries.clone(),
            fresh_for_ms: self.fresh_for_ms,
            clock: self.clock.clone(),
            refreshing: self.refreshing.clone(),
            generation: self.generation.clone(),
        }
    }
}

impl<K, V> SwrCache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + std::fmt::Debug + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(name: &'static str, config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        let entries = Cache::builder()
            .max_capacity(config.max_entries)
            .time_to_live(config.stale_for.max(config.fresh_for))
            .build();
        Self {
            name,
            entries,
            fresh_for_ms: config.fresh_for.as_millis() as u64,
            clock,
            refreshing: Arc::new(DashMap::new()),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Return the cached value for `key`, loading it with `load` on a miss and
    /// revalidating it in the background when stale.
    pub async fn get_or_load<F, Fut>(&self, key: K, load: F) -> Result<V, StoreError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, StoreError>> + Send + 'static,
    {
        if let Some(entry) = self.entries.get(&key).await {
            let age = self.clock.now_ms().saturating_sub(entry.loaded_at_ms);
            if age >= self.fresh_for_ms {
                self.spawn_refresh(key, load);
            }
            return Ok(entry.value.clone());
        }

        trace!(cache = self.name, key = ?key, "Cache miss");
        let clock = self.clock.clone();
        let entry = self
            .entries
            .try_get_with(key, async move {
                let value = load().await?;
                Ok::<_, StoreError>(Arc::new(Entry {
                    value,
                    loaded_at_ms: clock.now_ms(),
                }))
            })
            .await
            .map_err(|err| (*err).clone())?;
        Ok(entry.value.clone())
    }

    fn spawn_refresh<F, Fut>(&self, key: K, load: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, StoreError>> + Send + 'static,
    {
        if self.refreshing.insert(key.clone(), ()).is_some() {
            return;
        }

        let cache = self.clone();
        let generation = self.generation.load(Ordering::SeqCst);
        tokio::spawn(async move {
            match load().await {
                Ok(value) => {
                    if cache.generation.load(Ordering::SeqCst) == generation {
                        let entry = Arc::new(Entry {
                            value,
                            loaded_at_ms: cache.clock.now_ms(),
                        });
                        cache.entries.insert(key.clone(), entry).await;
                        trace!(cache = cache.name, key = ?key, "Revalidated stale entry");
                    }
                }
                Err(err) => {
                    warn!(cache = cache.name, key = ?key, error = %err, "Background revalidation failed, serving stale entry");
                }
            }
            cache.refreshing.remove(&key);
        });
    }

    /// Drop one entry.
    pub async fn invalidate(&self, key: &K) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.entries.invalidate(key).await;
    }

    /// Drop every entry.
    pub fn invalidate_all(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.entries.invalidate_all();
    }

    /// Whether `key` currently has an entry, fresh or stale.
    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }
}
