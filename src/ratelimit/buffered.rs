//! Eventually consistent limiter that counts locally and flushes in batches.
//!
//! Each live window is seeded once from the window store and from then on
//! decided from local state. A background loop hands the accumulated
//! increments to the store every flush interval, or sooner once a window
//! buffers `flush_threshold` increments, and adopts the global count the
//! store returns. Store outages never fail a request in this mode: seeding
//! falls back to zero and failed or timed out flushes are retried on the
//! next tick.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, info, trace, warn};

use super::counter::LocalWindow;
use super::strategy::{RatelimitRequest, RatelimitStrategy};
use super::window::{Decision, Window};
use crate::clock::Clock;
use crate::store::{StoreError, WindowStore};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct WindowKey {
    scope: String,
    start: u64,
}

/// Outcome of one flush pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    /// Windows reconciled with the store
    pub synced: usize,
    /// Windows whose flush failed and stay buffered
    pub failed: usize,
    /// Expired windows dropped from memory
    pub evicted: usize,
}

/// Tuning for [`AsyncLimiter`].
#[derive(Debug, Clone, Copy)]
pub struct AsyncLimiterConfig {
    pub flush_interval: Duration,
    pub flush_threshold: u64,
    /// Upper bound on the seeding read of a cold window.
    pub seed_timeout: Duration,
    /// Upper bound on each store call of a flush.
    pub store_timeout: Duration,
}

impl Default for AsyncLimiterConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(250),
            flush_threshold: 100,
            seed_timeout: Duration::from_millis(50),
            store_timeout: Duration::from_millis(50),
        }
    }
}

/// Increments taken out of a window for a flush. Dropping it before
/// [`InFlight::settle`] puts them back, so a cancelled flush loses nothing.
struct InFlight<'a> {
    local: &'a LocalWindow,
    taken: u64,
    settled: bool,
}

impl<'a> InFlight<'a> {
    fn begin(local: &'a LocalWindow) -> Self {
        Self {
            taken: local.begin_flush(),
            local,
            settled: false,
        }
    }

    fn settle(mut self, global: u64) {
        self.local.complete_flush(global);
        self.settled = true;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.local.abort_flush(self.taken);
        }
    }
}

pub struct AsyncLimiter {
    store: Arc<dyn WindowStore>,
    clock: Arc<dyn Clock>,
    config: AsyncLimiterConfig,
    windows: DashMap<WindowKey, Arc<LocalWindow>>,
    flush_wanted: Notify,
    flush_lock: Mutex<()>,
}

impl AsyncLimiter {
    pub fn new(store: Arc<dyn WindowStore>, clock: Arc<dyn Clock>, config: AsyncLimiterConfig) -> Self {
        Self {
            store,
            clock,
            config,
            windows: DashMap::new(),
            flush_wanted: Notify::new(),
            flush_lock: Mutex::new(()),
        }
    }

    /// Number of windows held in memory.
    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    /// Total increments not yet handed to the store.
    pub fn pending(&self) -> u64 {
        self.windows.iter().map(|entry| entry.value().pending()).sum()
    }

    async fn local_window(&self, key: WindowKey, window: Window) -> Arc<LocalWindow> {
        if let Some(local) = self.windows.get(&key) {
            return local.clone();
        }

        let seed = match tokio::time::timeout(
            self.config.seed_timeout,
            self.store.read(&key.scope, key.start),
        )
        .await
        {
            Ok(Ok(count)) => count,
            Ok(Err(err)) => {
                warn!(scope = %key.scope, error = %err, "Window store unavailable, seeding async window from zero");
                0
            }
            Err(_) => {
                warn!(scope = %key.scope, timeout = ?self.config.seed_timeout, "Window store read timed out, seeding async window from zero");
                0
            }
        };

        let local = self
            .windows
            .entry(key)
            .or_insert_with(|| Arc::new(LocalWindow::new(window, seed)))
            .clone();
        local.observe(seed);
        local
    }

    /// Reconcile every buffered window with the store.
    ///
    /// Each store call is bounded by `store_timeout`. A timeout ends the pass
    /// early and leaves the remaining windows buffered for the next one.
    pub async fn flush(&self) -> FlushReport {
        let _guard = self.flush_lock.lock().await;
        let now = self.clock.now_ms();
        let mut report = FlushReport::default();

        let snapshot: Vec<(WindowKey, Arc<LocalWindow>)> = self
            .windows
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        for (key, local) in snapshot {
            let window = local.window();
            let in_flight = InFlight::begin(&local);
            let taken = in_flight.taken;
            let call = async {
                if taken > 0 {
                    self.store
                        .increment(&key.scope, key.start, window.duration, taken)
                        .await
                } else {
                    self.store.read(&key.scope, key.start).await
                }
            };

            match tokio::time::timeout(self.config.store_timeout, call).await {
                Ok(Ok(global)) => {
                    in_flight.settle(global);
                    report.synced += 1;
                    trace!(scope = %key.scope, flushed = taken, global, "Flushed async window");
                }
                Ok(Err(err)) => {
                    drop(in_flight);
                    report.failed += 1;
                    warn!(scope = %key.scope, pending = taken, error = %err, "Async window flush failed, keeping increments buffered");
                    continue;
                }
                Err(_) => {
                    drop(in_flight);
                    report.failed += 1;
                    warn!(scope = %key.scope, pending = taken, timeout = ?self.config.store_timeout, "Async window flush timed out, deferring the rest of the pass");
                    break;
                }
            }

            if window.is_expired(now)
                && self
                    .windows
                    .remove_if(&key, |_, local| local.pending() == 0)
                    .is_some()
            {
                report.evicted += 1;
            }
        }

        if report.synced + report.failed > 0 {
            debug!(
                synced = report.synced,
                failed = report.failed,
                evicted = report.evicted,
                "Async flush complete"
            );
        }
        report
    }

    /// Flush on every interval tick or early threshold signal until
    /// `shutdown` flips, then flush one last time. A flush in progress when
    /// shutdown arrives is abandoned with its increments kept.
    pub async fn run_flusher(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval = ?self.config.flush_interval, threshold = self.config.flush_threshold, "Async flusher started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.flush_wanted.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
            tokio::select! {
                _ = self.flush() => {}
                _ = shutdown.wait_for(|stop| *stop) => break,
            }
        }

        let report = self.flush().await;
        info!(failed = report.failed, "Async flusher stopped");
    }
}

#[async_trait]
impl RatelimitStrategy for AsyncLimiter {
    async fn limit(&self, request: &RatelimitRequest) -> Result<Decision, StoreError> {
        let window = Window::containing(self.clock.now_ms(), request.duration_ms);
        let key = WindowKey {
            scope: request.scope.to_string_key(),
            start: window.start,
        };
        let local = self.local_window(key, window).await;

        let count = if request.cost == 0 {
            local.count()
        } else {
            local.increment(request.cost)
        };
        if local.pending() >= self.config.flush_threshold {
            self.flush_wanted.notify_one();
        }

        Ok(Decision::evaluate(request.limit, window, count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::Scope;
    use crate::store::MemoryWindowStore;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Memory store that can be switched off.
    struct Switchable {
        inner: MemoryWindowStore,
        down: AtomicBool,
    }

    impl Switchable {
        fn check(&self) -> Result<(), StoreError> {
            if self.down.load(Ordering::SeqCst) {
                Err(StoreError::Unavailable("switched off".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl WindowStore for Switchable {
        async fn increment(&self, scope: &str, start: u64, duration: u64, amount: u64) -> Result<u64, StoreError> {
            self.check()?;
            self.inner.increment(scope, start, duration, amount).await
        }

        async fn read(&self, scope: &str, start: u64) -> Result<u64, StoreError> {
            self.check()?;
            self.inner.read(scope, start).await
        }
    }

    struct Fixture {
        clock: ManualClock,
        store: Arc<Switchable>,
    }

    impl Fixture {
        fn new() -> Self {
            let clock = ManualClock::new(60_000);
            let store = Arc::new(Switchable {
                inner: MemoryWindowStore::with_clock(Arc::new(clock.clone())),
                down: AtomicBool::new(false),
            });
            Self { clock, store }
        }

        fn limiter(&self) -> AsyncLimiter {
            AsyncLimiter::new(
                self.store.clone(),
                Arc::new(self.clock.clone()),
                AsyncLimiterConfig {
                    flush_threshold: 1_000,
                    ..Default::default()
                },
            )
        }
    }

    fn request(limit: u64, cost: u64) -> RatelimitRequest {
        RatelimitRequest {
            scope: Scope::namespace("ns_async", "user_1"),
            limit,
            duration_ms: 10_000,
            cost,
        }
    }

    #[tokio::test]
    async fn test_local_counting_denies_over_limit() {
        let fixture = Fixture::new();
        let limiter = fixture.limiter();

        for _ in 0..3 {
            assert!(limiter.limit(&request(3, 1)).await.unwrap().allowed);
        }
        assert!(!limiter.limit(&request(3, 1)).await.unwrap().allowed);

        // Nothing reached the store yet
        assert_eq!(fixture.store.inner.read("ns|ns_async|user_1", 60_000).await.unwrap(), 0);
        assert_eq!(limiter.pending(), 4);
    }

    #[tokio::test]
    async fn test_flush_reconciles_with_store() {
        let fixture = Fixture::new();
        let limiter = fixture.limiter();

        limiter.limit(&request(10, 2)).await.unwrap();
        let report = limiter.flush().await;
        assert_eq!(report.synced, 1);
        assert_eq!(fixture.store.inner.read("ns|ns_async|user_1", 60_000).await.unwrap(), 2);
        assert_eq!(limiter.pending(), 0);
    }

    #[tokio::test]
    async fn test_two_regions_converge_after_flush() {
        let fixture = Fixture::new();
        let region_a = fixture.limiter();
        let region_b = fixture.limiter();

        for _ in 0..4 {
            region_a.limit(&request(10, 1)).await.unwrap();
        }
        for _ in 0..3 {
            region_b.limit(&request(10, 1)).await.unwrap();
        }

        // Local views only know their own traffic, so they never overstate it
        assert_eq!(region_a.limit(&request(10, 0)).await.unwrap().count, 4);
        assert_eq!(region_b.limit(&request(10, 0)).await.unwrap().count, 3);

        region_a.flush().await;
        region_b.flush().await;
        region_a.flush().await;

        let a = region_a.limit(&request(10, 0)).await.unwrap();
        let b = region_b.limit(&request(10, 0)).await.unwrap();
        assert_eq!(a.count, 7);
        assert_eq!(b.count, 7);
        assert_eq!(a.remaining, 3);
        assert_eq!(b.remaining, 3);
    }

    #[tokio::test]
    async fn test_cold_window_is_seeded_from_store() {
        let fixture = Fixture::new();
        fixture
            .store
            .inner
            .increment("ns|ns_async|user_1", 60_000, 10_000, 9)
            .await
            .unwrap();
        let limiter = fixture.limiter();

        let decision = limiter.limit(&request(10, 1)).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.count, 10);
        assert!(!limiter.limit(&request(10, 1)).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_store_outage_keeps_serving_and_recovers() {
        let fixture = Fixture::new();
        let limiter = fixture.limiter();
        fixture.store.down.store(true, Ordering::SeqCst);

        assert!(limiter.limit(&request(5, 1)).await.unwrap().allowed);
        assert!(limiter.limit(&request(5, 1)).await.unwrap().allowed);

        let report = limiter.flush().await;
        assert_eq!(report.failed, 1);
        assert_eq!(limiter.pending(), 2);

        fixture.store.down.store(false, Ordering::SeqCst);
        let report = limiter.flush().await;
        assert_eq!(report.synced, 1);
        assert_eq!(fixture.store.inner.read("ns|ns_async|user_1", 60_000).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_expired_windows_are_evicted_after_flush() {
        let fixture = Fixture::new();
        let limiter = fixture.limiter();

        limiter.limit(&request(5, 1)).await.unwrap();
        fixture.clock.advance(10_000);

        let report = limiter.flush().await;
        assert_eq!(report.evicted, 1);
        assert_eq!(limiter.window_count(), 0);
    }

    #[tokio::test]
    async fn test_flusher_stops_on_shutdown() {
        let fixture = Fixture::new();
        let limiter = Arc::new(fixture.limiter());
        let (tx, rx) = watch::channel(false);

        limiter.limit(&request(5, 1)).await.unwrap();
        let handle = tokio::spawn(limiter.clone().run_flusher(rx));
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(limiter.pending(), 0);
        assert_eq!(fixture.store.inner.read("ns|ns_async|user_1", 60_000).await.unwrap(), 1);
    }

    /// A window store whose calls never complete.
    struct HangingStore;

    #[async_trait]
    impl WindowStore for HangingStore {
        async fn increment(&self, _: &str, _: u64, _: u64, _: u64) -> Result<u64, StoreError> {
            std::future::pending().await
        }

        async fn read(&self, _: &str, _: u64) -> Result<u64, StoreError> {
            std::future::pending().await
        }
    }

    fn hanging_limiter() -> AsyncLimiter {
        AsyncLimiter::new(
            Arc::new(HangingStore),
            Arc::new(ManualClock::new(60_000)),
            AsyncLimiterConfig {
                flush_interval: Duration::from_millis(10),
                seed_timeout: Duration::from_millis(10),
                store_timeout: Duration::from_millis(20),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_flush_times_out_on_hanging_store() {
        let limiter = hanging_limiter();
        assert!(limiter.limit(&request(5, 1)).await.unwrap().allowed);
        let other = RatelimitRequest {
            scope: Scope::namespace("ns_async", "user_2"),
            ..request(5, 1)
        };
        assert!(limiter.limit(&other).await.unwrap().allowed);

        let report = tokio::time::timeout(Duration::from_secs(1), limiter.flush())
            .await
            .unwrap();
        // The pass stops at the first timeout
        assert_eq!(report.failed, 1);
        assert_eq!(report.synced, 0);
        assert_eq!(limiter.pending(), 2);
        assert_eq!(limiter.limit(&request(5, 0)).await.unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_flusher_stops_on_shutdown_when_store_hangs() {
        let limiter = Arc::new(hanging_limiter());
        let (tx, rx) = watch::channel(false);

        limiter.limit(&request(5, 1)).await.unwrap();
        let handle = tokio::spawn(limiter.clone().run_flusher(rx));
        tokio::time::sleep(Duration::from_millis(15)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        // Increments that never reached the store stay buffered
        assert_eq!(limiter.pending(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_flush_keeps_increments() {
        let limiter = AsyncLimiter::new(
            Arc::new(HangingStore),
            Arc::new(ManualClock::new(60_000)),
            AsyncLimiterConfig {
                seed_timeout: Duration::from_millis(10),
                store_timeout: Duration::from_secs(60),
                ..Default::default()
            },
        );
        limiter.limit(&request(5, 3)).await.unwrap();

        assert!(tokio::time::timeout(Duration::from_millis(20), limiter.flush())
            .await
            .is_err());
        assert_eq!(limiter.pending(), 3);
        assert_eq!(limiter.limit(&request(5, 0)).await.unwrap().count, 3);
    }
}
