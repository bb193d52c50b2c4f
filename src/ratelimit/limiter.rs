//! Strongly consistent limiter and the mode-dispatching facade.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace};

use super::buffered::AsyncLimiter;
use super::strategy::{RatelimitRequest, RatelimitStrategy};
use super::window::{ConsistencyMode, Decision, Window};
use crate::clock::Clock;
use crate::store::{StoreError, WindowStore};

/// Round-trips to the window store on every request.
pub struct SyncLimiter {
    store: Arc<dyn WindowStore>,
    clock: Arc<dyn Clock>,
}

impl SyncLimiter {
    pub fn new(store: Arc<dyn WindowStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }
}

#[async_trait]
impl RatelimitStrategy for SyncLimiter {
    async fn limit(&self, request: &RatelimitRequest) -> Result<Decision, StoreError> {
        let window = Window::containing(self.clock.now_ms(), request.duration_ms);
        let scope = request.scope.to_string_key();

        trace!(
            scope = %scope,
            window = window.start,
            cost = request.cost,
            "Checking sync rate limit"
        );

        let count = if request.cost == 0 {
            self.store.read(&scope, window.start).await?
        } else {
            self.store
                .increment(&scope, window.start, window.duration, request.cost)
                .await?
        };

        let decision = Decision::evaluate(request.limit, window, count);
        if !decision.allowed {
            debug!(
                scope = %scope,
                count,
                limit = request.limit,
                "Rate limit exceeded"
            );
        }
        Ok(decision)
    }
}

/// Routes each request to the sync or async strategy.
pub struct RateLimiter {
    sync: SyncLimiter,
    buffered: Arc<AsyncLimiter>,
}

impl RateLimiter {
    pub fn new(sync: SyncLimiter, buffered: Arc<AsyncLimiter>) -> Self {
        Self { sync, buffered }
    }

    /// The async strategy, for driving its flush loop.
    pub fn buffered(&self) -> &Arc<AsyncLimiter> {
        &self.buffered
    }

    pub async fn limit(
        &self,
        mode: ConsistencyMode,
        request: &RatelimitRequest,
    ) -> Result<Decision, StoreError> {
        match mode {
            ConsistencyMode::Sync => self.sync.limit(request).await,
            ConsistencyMode::Async => self.buffered.limit(request).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::Scope;
    use crate::store::MemoryWindowStore;

    fn request(identifier: &str, limit: u64, duration_ms: u64) -> RatelimitRequest {
        RatelimitRequest {
            scope: Scope::namespace("ns_test", identifier),
            limit,
            duration_ms,
            cost: 1,
        }
    }

    fn limiter(clock: &ManualClock) -> SyncLimiter {
        let clock: Arc<dyn Clock> = Arc::new(clock.clone());
        SyncLimiter::new(Arc::new(MemoryWindowStore::with_clock(clock.clone())), clock)
    }

    #[tokio::test]
    async fn test_fixed_window_boundary() {
        let clock = ManualClock::new(1_000_000);
        let limiter = limiter(&clock);
        let req = request("user_1", 5, 10_000);

        for i in 1..=5 {
            let decision = limiter.limit(&req).await.unwrap();
            assert!(decision.allowed, "request {} should be allowed", i);
            assert_eq!(decision.remaining, 5 - i);
            assert_eq!(decision.reset, 1_010_000);
        }

        let denied = limiter.limit(&req).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);

        // The next window starts a fresh count
        clock.set(1_010_000);
        let fresh = limiter.limit(&req).await.unwrap();
        assert!(fresh.allowed);
        assert_eq!(fresh.count, 1);
        assert_eq!(fresh.reset, 1_020_000);
    }

    #[tokio::test]
    async fn test_cost_is_counted() {
        let clock = ManualClock::new(0);
        let limiter = limiter(&clock);
        let mut req = request("user_1", 10, 1000);
        req.cost = 7;

        assert!(limiter.limit(&req).await.unwrap().allowed);
        let second = limiter.limit(&req).await.unwrap();
        assert!(!second.allowed);
        assert_eq!(second.count, 14);
    }

    #[tokio::test]
    async fn test_zero_cost_reads_without_consuming() {
        let clock = ManualClock::new(0);
        let limiter = limiter(&clock);
        let mut req = request("user_1", 3, 1000);

        limiter.limit(&req).await.unwrap();
        req.cost = 0;
        let peek = limiter.limit(&req).await.unwrap();
        assert_eq!(peek.count, 1);
        assert_eq!(limiter.limit(&req).await.unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_scopes_have_separate_counters() {
        let clock = ManualClock::new(0);
        let limiter = limiter(&clock);

        limiter.limit(&request("a", 1, 1000)).await.unwrap();
        let other = limiter.limit(&request("b", 1, 1000)).await.unwrap();
        assert!(other.allowed);
    }
}
