//! Per-region orchestration of key verification.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::verdict::{
    NamespaceRatelimitRequest, NamespaceRatelimitResult, NamespaceRef, RatelimitState,
    VerificationCode, VerificationResult, VerifyRequest,
};
use crate::cache::SwrCache;
use crate::clock::Clock;
use crate::config::EdgeConfig;
use crate::error::{KeygateError, Result};
use crate::keys::{Key, KeyStore, QuotaLedger};
use crate::mesh::{Cluster, InvalidationKind};
use crate::ratelimit::{
    AsyncLimiter, ConsistencyMode, Decision, LimitConfig, OverrideSet, OverrideStore,
    OverrideUpsert, RateLimiter, RatelimitNamespace, RatelimitOverride, RatelimitRequest, Scope,
    SyncLimiter,
};
use crate::store::{LedgerStore, StoreError, WindowStore};

const REFILL_CONCURRENCY: usize = 16;

/// The authoritative stores a coordinator reads through.
#[derive(Clone)]
pub struct Stores {
    pub keys: Arc<dyn KeyStore>,
    pub overrides: Arc<dyn OverrideStore>,
    pub windows: Arc<dyn WindowStore>,
    pub ledger: Arc<dyn LedgerStore>,
}

/// A key together with its authoritative usage budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInfo {
    pub key: Key,
    pub remaining: Option<u64>,
}

/// The limit in effect for one request.
#[derive(Debug, Clone)]
struct ResolvedLimit {
    scope: Scope,
    config: LimitConfig,
    override_id: Option<String>,
}

pub struct EdgeCoordinator {
    region: String,
    keys: Arc<dyn KeyStore>,
    overrides: Arc<dyn OverrideStore>,
    ledger: QuotaLedger,
    limiter: RateLimiter,
    clock: Arc<dyn Clock>,
    store_timeout: Duration,
    /// key hash -> key
    key_cache: SwrCache<String, Option<Key>>,
    /// (workspace id, namespace name) -> namespace
    namespace_cache: SwrCache<(String, String), Option<RatelimitNamespace>>,
    /// namespace id -> compiled overrides
    override_cache: SwrCache<String, Arc<OverrideSet>>,
    cluster: Option<Arc<Cluster>>,
}

impl EdgeCoordinator {
    pub fn new(stores: Stores, config: &EdgeConfig, clock: Arc<dyn Clock>) -> Self {
        let sync = SyncLimiter::new(stores.windows.clone(), clock.clone());
        let buffered = Arc::new(AsyncLimiter::new(
            stores.windows.clone(),
            clock.clone(),
            config.async_limiter(),
        ));

        Self {
            region: config.region.clone(),
            keys: stores.keys,
            overrides: stores.overrides,
            ledger: QuotaLedger::new(stores.ledger),
            limiter: RateLimiter::new(sync, buffered),
            store_timeout: config.store_timeout(),
            key_cache: SwrCache::new("keys", config.key_cache.to_cache_config(), clock.clone()),
            namespace_cache: SwrCache::new(
                "namespaces",
                config.override_cache.to_cache_config(),
                clock.clone(),
            ),
            override_cache: SwrCache::new(
                "overrides",
                config.override_cache.to_cache_config(),
                clock.clone(),
            ),
            clock,
            cluster: None,
        }
    }

    /// Broadcast invalidations to peers through `cluster`.
    pub fn with_cluster(mut self, cluster: Arc<Cluster>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn ledger(&self) -> &QuotaLedger {
        &self.ledger
    }

    pub fn async_limiter(&self) -> &Arc<AsyncLimiter> {
        self.limiter.buffered()
    }

    /// Run a store call under the coordinator's deadline.
    async fn bounded<T, E, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, E>>,
        E: Into<KeygateError>,
    {
        match tokio::time::timeout(self.store_timeout, fut).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => {
                warn!(operation, timeout = ?self.store_timeout, "Store call timed out");
                Err(KeygateError::Timeout(self.store_timeout))
            }
        }
    }

    async fn lookup_key(&self, key_hash: &str) -> Result<Option<Key>> {
        let store = self.keys.clone();
        let hash = key_hash.to_string();
        let load = move || {
            let store = store.clone();
            let hash = hash.clone();
            async move { store.find_by_hash(&hash).await }
        };
        self.bounded("keys.find_by_hash", self.key_cache.get_or_load(key_hash.to_string(), load))
            .await
    }

    async fn lookup_namespace(&self, workspace_id: &str, name: &str) -> Result<Option<RatelimitNamespace>> {
        let store = self.overrides.clone();
        let (ws, ns) = (workspace_id.to_string(), name.to_string());
        let load = move || {
            let store = store.clone();
            let (ws, ns) = (ws.clone(), ns.clone());
            async move { store.find_namespace(&ws, &ns).await }
        };
        self.bounded(
            "namespaces.find",
            self.namespace_cache
                .get_or_load((workspace_id.to_string(), name.to_string()), load),
        )
        .await
    }

    async fn override_set(&self, namespace_id: &str) -> Result<Arc<OverrideSet>> {
        let store = self.overrides.clone();
        let id = namespace_id.to_string();
        let load = move || {
            let store = store.clone();
            let id = id.clone();
            async move {
                let overrides = store.list_overrides(&id).await?;
                Ok::<_, StoreError>(Arc::new(OverrideSet::new(overrides)))
            }
        };
        self.bounded(
            "overrides.list",
            self.override_cache.get_or_load(namespace_id.to_string(), load),
        )
        .await
    }

    async fn resolve_namespace_limit(
        &self,
        namespace: &RatelimitNamespace,
        identifier: &str,
        fallback: Option<LimitConfig>,
    ) -> Result<Option<ResolvedLimit>> {
        let overrides = self.override_set(&namespace.id).await?;
        let scope = Scope::namespace(&namespace.id, identifier);

        Ok(match overrides.resolve(identifier) {
            Some(rule) => Some(ResolvedLimit {
                scope,
                config: rule.limit_config(),
                override_id: Some(rule.id.clone()),
            }),
            None => fallback.map(|config| ResolvedLimit {
                scope,
                config,
                override_id: None,
            }),
        })
    }

    /// Evaluate `limit`. Sync mode fails closed on store errors; async mode
    /// serves from local state and never fails.
    async fn evaluate(&self, limit: &ResolvedLimit, cost: u64) -> Result<Decision> {
        let request = RatelimitRequest {
            scope: limit.scope.clone(),
            limit: limit.config.limit,
            duration_ms: limit.config.duration_ms,
            cost,
        };

        match limit.config.mode {
            ConsistencyMode::Sync => {
                self.bounded(
                    "ratelimit.sync",
                    self.limiter.limit(ConsistencyMode::Sync, &request),
                )
                .await
            }
            ConsistencyMode::Async => self
                .limiter
                .limit(ConsistencyMode::Async, &request)
                .await
                .map_err(Into::into),
        }
    }

    /// Verify a key: validity, then rate limit, then usage budget.
    #[instrument(skip_all, fields(region = %self.region, cost = request.cost))]
    pub async fn verify(&self, request: &VerifyRequest) -> Result<VerificationResult> {
        let now = self.clock.now_ms();

        let Some(key) = self.lookup_key(&request.key_hash).await? else {
            debug!("Key not found");
            return Ok(VerificationResult::denied(VerificationCode::NotFound, None));
        };
        if !key.enabled {
            debug!(key_id = %key.id, "Key disabled");
            return Ok(VerificationResult::denied(VerificationCode::Disabled, Some(&key.id)));
        }
        if key.is_expired(now) {
            debug!(key_id = %key.id, "Key expired");
            return Ok(VerificationResult::denied(VerificationCode::Expired, Some(&key.id)));
        }

        let limit = match &request.namespace {
            Some(NamespaceRef { name, identifier }) => {
                let Some(namespace) = self.lookup_namespace(&key.workspace_id, name).await? else {
                    debug!(key_id = %key.id, namespace = %name, "Namespace not found");
                    return Ok(VerificationResult::denied(VerificationCode::NotFound, Some(&key.id)));
                };
                let fallback = key
                    .ratelimit
                    .as_ref()
                    .and_then(|ratelimit| ratelimit.limit_config())
                    .or_else(|| namespace.default_config());
                self.resolve_namespace_limit(&namespace, identifier, fallback)
                    .await?
            }
            None => key
                .ratelimit
                .as_ref()
                .and_then(|ratelimit| ratelimit.limit_config())
                .map(|config| ResolvedLimit {
                    scope: Scope::key(&key.id),
                    config,
                    override_id: None,
                }),
        };

        let mut ratelimit = None;
        if let Some(limit) = &limit {
            let decision = self.evaluate(limit, request.cost).await?;
            ratelimit = Some(RatelimitState::from(decision));
            if !decision.allowed {
                debug!(key_id = %key.id, scope = %limit.scope, reset = decision.reset, "Key rate limited");
                return Ok(VerificationResult {
                    ratelimit,
                    ..VerificationResult::denied(VerificationCode::RateLimited, Some(&key.id))
                });
            }
        }

        let async_mode = limit
            .as_ref()
            .is_some_and(|limit| limit.config.mode == ConsistencyMode::Async);
        let mut remaining = None;
        if key.remaining.is_some() {
            let consumed = match self
                .bounded("ledger.consume", self.ledger.consume(&key.id, request.cost))
                .await
            {
                Ok(consumed) => consumed,
                // Async-mode keys fail open on ledger outages
                Err(err) if async_mode && err.is_retryable() => {
                    warn!(key_id = %key.id, error = %err, "Ledger unreachable, admitting async-mode key without usage accounting");
                    None
                }
                Err(err) => return Err(err),
            };
            if let Some(outcome) = consumed {
                remaining = Some(outcome.remaining);
                if !outcome.ok {
                    return Ok(VerificationResult {
                        remaining,
                        ratelimit,
                        ..VerificationResult::denied(VerificationCode::UsageExceeded, Some(&key.id))
                    });
                }
            }
        }

        Ok(VerificationResult {
            valid: true,
            code: VerificationCode::Valid,
            key_id: Some(key.id),
            remaining,
            ratelimit,
        })
    }

    /// Rate limit an identifier within a namespace, honoring overrides.
    #[instrument(skip_all, fields(region = %self.region, namespace = %request.namespace))]
    pub async fn ratelimit(&self, request: &NamespaceRatelimitRequest) -> Result<NamespaceRatelimitResult> {
        if request.identifier.is_empty() {
            return Err(KeygateError::InvalidArgument("identifier is required".to_string()));
        }

        let namespace = self
            .lookup_namespace(&request.workspace_id, &request.namespace)
            .await?
            .ok_or_else(|| KeygateError::NotFound(format!("namespace {}", request.namespace)))?;

        let fallback = LimitConfig {
            limit: request.limit,
            duration_ms: request.duration,
            mode: ConsistencyMode::from_async_flag(request.async_mode),
        };
        let limit = self
            .resolve_namespace_limit(&namespace, &request.identifier, Some(fallback))
            .await?
            .ok_or_else(|| KeygateError::Config("no limit resolved".to_string()))?;

        let decision = self.evaluate(&limit, request.cost).await?;
        Ok(NamespaceRatelimitResult {
            success: decision.allowed,
            limit: decision.limit,
            remaining: decision.remaining,
            reset: decision.reset,
            override_id: limit.override_id,
        })
    }

    /// A key and its current usage budget from the ledger.
    pub async fn get_key(&self, key_id: &str) -> Result<KeyInfo> {
        let key = self
            .bounded("keys.get", self.keys.get(key_id))
            .await?
            .ok_or_else(|| KeygateError::NotFound(format!("key {}", key_id)))?;
        let remaining = self
            .bounded("ledger.get", self.ledger.remaining(key_id))
            .await?;
        Ok(KeyInfo { key, remaining })
    }

    pub async fn get_override(&self, namespace_id: &str, identifier: &str) -> Result<RatelimitOverride> {
        self.bounded(
            "overrides.get",
            self.overrides.get_override(namespace_id, identifier),
        )
        .await?
        .ok_or_else(|| {
            KeygateError::NotFound(format!("override {} in namespace {}", identifier, namespace_id))
        })
    }

    pub async fn upsert_override(&self, upsert: OverrideUpsert) -> Result<RatelimitOverride> {
        if upsert.namespace_id.is_empty() || upsert.identifier.is_empty() {
            return Err(KeygateError::InvalidArgument(
                "namespace_id and identifier are required".to_string(),
            ));
        }
        if upsert.duration == 0 {
            return Err(KeygateError::InvalidArgument("duration must be positive".to_string()));
        }

        let rule = self
            .bounded("overrides.upsert", self.overrides.upsert_override(upsert))
            .await?;
        info!(override_id = %rule.id, namespace_id = %rule.namespace_id, identifier = %rule.identifier, "Override written");
        self.invalidate_namespace(&rule.namespace_id).await;
        Ok(rule)
    }

    pub async fn delete_override(&self, id: &str) -> Result<RatelimitOverride> {
        let rule = self
            .bounded("overrides.delete", self.overrides.delete_override(id))
            .await?
            .ok_or_else(|| KeygateError::NotFound(format!("override {}", id)))?;
        info!(override_id = %rule.id, namespace_id = %rule.namespace_id, "Override deleted");
        self.invalidate_namespace(&rule.namespace_id).await;
        Ok(rule)
    }

    /// Drop the cached overrides of a namespace here and on every peer.
    pub async fn invalidate_namespace(&self, namespace_id: &str) {
        self.override_cache.invalidate(&namespace_id.to_string()).await;
        self.broadcast(InvalidationKind::Overrides).await;
    }

    /// Drop a cached key here and on every peer.
    pub async fn invalidate_key(&self, key_hash: &str) {
        self.key_cache.invalidate(&key_hash.to_string()).await;
        self.broadcast(InvalidationKind::Keys).await;
    }

    async fn broadcast(&self, kind: InvalidationKind) {
        if let Some(cluster) = &self.cluster {
            cluster.publish_invalidation(kind).await;
        }
    }

    /// Apply an invalidation published by a peer.
    pub fn apply_invalidation(&self, kind: InvalidationKind) {
        match kind {
            InvalidationKind::Keys => self.key_cache.invalidate_all(),
            InvalidationKind::Overrides => {
                self.override_cache.invalidate_all();
                self.namespace_cache.invalidate_all();
            }
        }
    }

    /// Apply every usage refill due at `now_ms`; returns how many were applied.
    pub async fn run_refills(&self, now_ms: u64) -> Result<usize> {
        let keys = self
            .bounded("keys.list_refillable", self.keys.list_refillable())
            .await?;

        let results: Vec<_> = stream::iter(keys.iter().cloned())
            .map(|key| async move {
                let result = self
                    .bounded("ledger.refill", self.ledger.refill_if_due(&key, now_ms))
                    .await;
                (key, result)
            })
            .buffer_unordered(REFILL_CONCURRENCY)
            .collect()
            .await;

        let mut applied = 0;
        for (key, result) in results {
            match result {
                Ok(Some(outcome)) if outcome.applied => applied += 1,
                Ok(_) => {}
                Err(err) => warn!(key_id = %key.id, error = %err, "Refill failed, will retry"),
            }
        }
        if applied > 0 {
            info!(applied, checked = keys.len(), "Usage refills applied");
        }
        Ok(applied)
    }

    /// Start the async flusher, the refill loop and, with a cluster, the
    /// invalidation watcher. All stop when `shutdown` flips to true.
    pub fn spawn_background(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
        refill_interval: Duration,
        invalidation_poll: Duration,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = vec![tokio::spawn(
            self.async_limiter().clone().run_flusher(shutdown.clone()),
        )];

        let coordinator = self.clone();
        let mut refill_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(refill_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = refill_shutdown.changed() => {
                        if changed.is_err() || *refill_shutdown.borrow() {
                            break;
                        }
                    }
                }
                let now = coordinator.clock.now_ms();
                if let Err(err) = coordinator.run_refills(now).await {
                    warn!(error = %err, "Refill pass failed");
                }
            }
        }));

        if let Some(cluster) = &self.cluster {
            let coordinator = self.clone();
            handles.push(tokio::spawn(cluster.clone().watch_invalidations(
                invalidation_poll,
                shutdown,
                move |kind| coordinator.apply_invalidation(kind),
            )));
        }

        handles
    }
}
