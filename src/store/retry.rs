//! Bounded retry with exponential backoff for store backends.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{ConsumeOutcome, LedgerStore, RefillMode, RefillOutcome, StoreError, WindowStore};

/// How many times, and how patiently, a store call is retried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound on any single delay in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    5
}

fn default_max_delay_ms() -> u64 {
    50
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based), with up to 50% jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay_ms
            .saturating_mul(1u64 << attempt.saturating_sub(1).min(16));
        let capped = exp.min(self.max_delay_ms);
        let jitter = if capped > 1 {
            rand::thread_rng().gen_range(0..=capped / 2)
        } else {
            0
        };
        Duration::from_millis(capped.saturating_sub(jitter))
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts are exhausted.
    pub async fn run<T, F, Fut>(&self, what: &'static str, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < attempts => {
                    let delay = self.delay_for(attempt);
                    debug!(operation = what, attempt, ?delay, error = %err, "Retrying store operation");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_retryable() {
                        warn!(operation = what, attempts, error = %err, "Store operation failed after retries");
                    }
                    return Err(err);
                }
            }
        }
    }
}

/// Wraps a store so every call goes through a [`RetryPolicy`].
pub struct Retrying<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S> Retrying<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: WindowStore> WindowStore for Retrying<S> {
    async fn increment(
        &self,
        scope: &str,
        window_start: u64,
        duration_ms: u64,
        amount: u64,
    ) -> Result<u64, StoreError> {
        self.policy
            .run("window.increment", || {
                self.inner.increment(scope, window_start, duration_ms, amount)
            })
            .await
    }

    async fn read(&self, scope: &str, window_start: u64) -> Result<u64, StoreError> {
        self.policy
            .run("window.read", || self.inner.read(scope, window_start))
            .await
    }
}

#[async_trait]
impl<S: LedgerStore> LedgerStore for Retrying<S> {
    async fn consume(&self, key_id: &str, cost: u64) -> Result<Option<ConsumeOutcome>, StoreError> {
        self.policy
            .run("ledger.consume", || self.inner.consume(key_id, cost))
            .await
    }

    async fn refill(
        &self,
        key_id: &str,
        amount: u64,
        mode: RefillMode,
        period: &str,
    ) -> Result<Option<RefillOutcome>, StoreError> {
        self.policy
            .run("ledger.refill", || self.inner.refill(key_id, amount, mode, period))
            .await
    }

    async fn get(&self, key_id: &str) -> Result<Option<u64>, StoreError> {
        self.policy.run("ledger.get", || self.inner.get(key_id)).await
    }

    async fn set(&self, key_id: &str, remaining: Option<u64>) -> Result<(), StoreError> {
        self.policy
            .run("ledger.set", || self.inner.set(key_id, remaining))
            .await
    }

    async fn provision_if_absent(
        &self,
        key_id: &str,
        remaining: u64,
        period: Option<&str>,
    ) -> Result<bool, StoreError> {
        self.policy
            .run("ledger.provision", || {
                self.inner.provision_if_absent(key_id, remaining, period)
            })
            .await
    }
}
