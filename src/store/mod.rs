//! Authoritative storage for rate limit windows and key usage budgets.
//!
//! Both stores expose only atomic primitives: callers never read a value and
//! write it back. The in-memory implementations serialize through dashmap
//! shard locks; the Redis implementations run each primitive as a single
//! command or Lua script.

mod memory;
#[cfg(feature = "redis")]
mod redis;
mod retry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::{MemoryLedgerStore, MemoryWindowStore};
#[cfg(feature = "redis")]
pub use self::redis::{RedisLedgerStore, RedisWindowStore};
pub use retry::{RetryPolicy, Retrying};

/// Errors raised by a store backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The backend could not be reached. Retryable.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The backend returned data that could not be interpreted.
    #[error("corrupt store value: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Durable fixed-window counters keyed by scope and window start.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Atomically add `amount` to the counter of `(scope, window_start)` and
    /// return the new total. A missing counter is created with a time to
    /// live of `duration_ms`.
    async fn increment(
        &self,
        scope: &str,
        window_start: u64,
        duration_ms: u64,
        amount: u64,
    ) -> Result<u64, StoreError>;

    /// Current total of `(scope, window_start)`, zero when absent or expired.
    async fn read(&self, scope: &str, window_start: u64) -> Result<u64, StoreError>;
}

/// Outcome of a [`LedgerStore::consume`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeOutcome {
    /// Whether the budget covered the cost and was decremented.
    pub ok: bool,
    /// Budget after the call. Unchanged when `ok` is false.
    pub remaining: u64,
}

/// How a refill changes the remaining budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefillMode {
    /// Replace the budget with the refill amount.
    Set,
    /// Add the refill amount to the budget.
    Add,
}

impl RefillMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefillMode::Set => "set",
            RefillMode::Add => "add",
        }
    }
}

/// Outcome of a [`LedgerStore::refill`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefillOutcome {
    /// False when the period had already been applied.
    pub applied: bool,
    pub remaining: u64,
}

/// Lifetime usage budgets of keys with a finite `remaining`.
///
/// Keys with unlimited usage have no ledger entry.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Decrement the budget by `cost` if it covers it. `None` when the key has
    /// no ledger entry.
    async fn consume(&self, key_id: &str, cost: u64) -> Result<Option<ConsumeOutcome>, StoreError>;

    /// Apply a refill tagged with `period`. Applying the same period twice is
    /// a no-op. `None` when the key has no ledger entry.
    async fn refill(
        &self,
        key_id: &str,
        amount: u64,
        mode: RefillMode,
        period: &str,
    ) -> Result<Option<RefillOutcome>, StoreError>;

    /// Current budget, `None` when unlimited.
    async fn get(&self, key_id: &str) -> Result<Option<u64>, StoreError>;

    /// Replace the budget. `None` removes the entry, making the key unlimited.
    async fn set(&self, key_id: &str, remaining: Option<u64>) -> Result<(), StoreError>;

    /// Create the budget unless the key already has one. `period`, when
    /// given, is recorded as the last refill applied. Returns whether an entry
    /// was created; an existing budget is never touched.
    async fn provision_if_absent(
        &self,
        key_id: &str,
        remaining: u64,
        period: Option<&str>,
    ) -> Result<bool, StoreError>;
}
