//! In-process store backends.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::trace;

use super::{ConsumeOutcome, LedgerStore, RefillMode, RefillOutcome, StoreError, WindowStore};
use crate::clock::{Clock, SystemClock};

/// Expired windows are swept after this many increments.
const SWEEP_EVERY: u64 = 4096;

#[derive(Debug, Clone, Copy)]
struct WindowCell {
    count: u64,
    expires_at: u64,
}

/// Window counters held in a sharded concurrent map.
///
/// Each increment holds the shard lock of its entry for the whole
/// read-modify-write, which gives a total order per `(scope, window)`.
pub struct MemoryWindowStore {
    windows: DashMap<(String, u64), WindowCell>,
    clock: Arc<dyn Clock>,
    ops: AtomicU64,
}

impl MemoryWindowStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: DashMap::new(),
            clock,
            ops: AtomicU64::new(0),
        }
    }

    /// Number of stored windows, live or not yet swept.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Drop every expired window.
    pub fn sweep(&self) {
        let now = self.clock.now_ms();
        let before = self.windows.len();
        self.windows.retain(|_, cell| cell.expires_at > now);
        trace!(removed = before.saturating_sub(self.windows.len()), "Swept expired windows");
    }
}

impl Default for MemoryWindowStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WindowStore for MemoryWindowStore {
    async fn increment(
        &self,
        scope: &str,
        window_start: u64,
        duration_ms: u64,
        amount: u64,
    ) -> Result<u64, StoreError> {
        let now = self.clock.now_ms();
        let count = {
            let mut cell = self
                .windows
                .entry((scope.to_string(), window_start))
                .or_insert(WindowCell {
                    count: 0,
                    expires_at: now.saturating_add(duration_ms),
                });
            if cell.expires_at <= now {
                *cell = WindowCell {
                    count: 0,
                    expires_at: now.saturating_add(duration_ms),
                };
            }
            cell.count = cell.count.saturating_add(amount);
            cell.count
        };

        if self.ops.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.sweep();
        }
        Ok(count)
    }

    async fn read(&self, scope: &str, window_start: u64) -> Result<u64, StoreError> {
        let now = self.clock.now_ms();
        Ok(self
            .windows
            .get(&(scope.to_string(), window_start))
            .filter(|cell| cell.expires_at > now)
            .map(|cell| cell.count)
            .unwrap_or(0))
    }
}

#[derive(Debug, Clone)]
struct LedgerCell {
    remaining: u64,
    last_period: Option<String>,
}

/// Key budgets held in a sharded concurrent map.
#[derive(Default)]
pub struct MemoryLedgerStore {
    budgets: DashMap<String, LedgerCell>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn consume(&self, key_id: &str, cost: u64) -> Result<Option<ConsumeOutcome>, StoreError> {
        let Some(mut cell) = self.budgets.get_mut(key_id) else {
            return Ok(None);
        };
        if cell.remaining < cost {
            return Ok(Some(ConsumeOutcome {
                ok: false,
                remaining: cell.remaining,
            }));
        }
        cell.remaining -= cost;
        Ok(Some(ConsumeOutcome {
            ok: true,
            remaining: cell.remaining,
        }))
    }

    async fn refill(
        &self,
        key_id: &str,
        amount: u64,
        mode: RefillMode,
        period: &str,
    ) -> Result<Option<RefillOutcome>, StoreError> {
        let Some(mut cell) = self.budgets.get_mut(key_id) else {
            return Ok(None);
        };
        if cell.last_period.as_deref() == Some(period) {
            return Ok(Some(RefillOutcome {
                applied: false,
                remaining: cell.remaining,
            }));
        }
        cell.remaining = match mode {
            RefillMode::Set => amount,
            RefillMode::Add => cell.remaining.saturating_add(amount),
        };
        cell.last_period = Some(period.to_string());
        Ok(Some(RefillOutcome {
            applied: true,
            remaining: cell.remaining,
        }))
    }

    async fn get(&self, key_id: &str) -> Result<Option<u64>, StoreError> {
        Ok(self.budgets.get(key_id).map(|cell| cell.remaining))
    }

    async fn set(&self, key_id: &str, remaining: Option<u64>) -> Result<(), StoreError> {
        match remaining {
            Some(remaining) => {
                self.budgets
                    .entry(key_id.to_string())
                    .and_modify(|cell| cell.remaining = remaining)
                    .or_insert(LedgerCell {
                        remaining,
                        last_period: None,
                    });
            }
            None => {
                self.budgets.remove(key_id);
            }
        }
        Ok(())
    }

    async fn provision_if_absent(
        &self,
        key_id: &str,
        remaining: u64,
        period: Option<&str>,
    ) -> Result<bool, StoreError> {
        match self.budgets.entry(key_id.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(vacant) => {
                vacant.insert(LedgerCell {
                    remaining,
                    last_period: period.map(str::to_string),
                });
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[tokio::test]
    async fn test_window_increment_accumulates() {
        let store = MemoryWindowStore::new();

        assert_eq!(store.increment("ns:a", 0, 1000, 1).await.unwrap(), 1);
        assert_eq!(store.increment("ns:a", 0, 1000, 4).await.unwrap(), 5);
        assert_eq!(store.read("ns:a", 0).await.unwrap(), 5);

        // Different windows and scopes are independent
        assert_eq!(store.read("ns:a", 1000).await.unwrap(), 0);
        assert_eq!(store.read("ns:b", 0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_window_expires_after_duration() {
        let clock = ManualClock::new(10_000);
        let store = MemoryWindowStore::with_clock(Arc::new(clock.clone()));

        store.increment("s", 10_000, 1000, 3).await.unwrap();
        clock.advance(999);
        assert_eq!(store.read("s", 10_000).await.unwrap(), 3);

        clock.advance(1);
        assert_eq!(store.read("s", 10_000).await.unwrap(), 0);
        assert_eq!(store.increment("s", 10_000, 1000, 1).await.unwrap(), 1);

        clock.advance(5_000);
        store.sweep();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_window_concurrent_increments() {
        let store = Arc::new(MemoryWindowStore::new());
        let mut handles = Vec::new();
        for _ in 0..50 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.increment("hot", 0, 60_000, 1).await.unwrap()
            }));
        }

        let mut seen: Vec<u64> = Vec::new();
        for handle in handles {
            seen.push(handle.await.unwrap());
        }
        seen.sort_unstable();

        assert_eq!(seen, (1..=50).collect::<Vec<u64>>());
        assert_eq!(store.read("hot", 0).await.unwrap(), 50);
    }

    #[tokio::test]
    async fn test_ledger_consume_all_or_nothing() {
        let ledger = MemoryLedgerStore::new();
        ledger.set("key_1", Some(5)).await.unwrap();

        let outcome = ledger.consume("key_1", 10).await.unwrap().unwrap();
        assert!(!outcome.ok);
        assert_eq!(outcome.remaining, 5);

        let outcome = ledger.consume("key_1", 5).await.unwrap().unwrap();
        assert!(outcome.ok);
        assert_eq!(outcome.remaining, 0);

        assert!(ledger.consume("missing", 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ledger_refill_is_idempotent_per_period() {
        let ledger = MemoryLedgerStore::new();
        ledger.set("key_1", Some(2)).await.unwrap();

        let first = ledger.refill("key_1", 10, RefillMode::Add, "2026-10-19").await.unwrap().unwrap();
        assert!(first.applied);
        assert_eq!(first.remaining, 12);

        let again = ledger.refill("key_1", 10, RefillMode::Add, "2026-10-19").await.unwrap().unwrap();
        assert!(!again.applied);
        assert_eq!(again.remaining, 12);

        let next = ledger.refill("key_1", 100, RefillMode::Set, "2026-10-20").await.unwrap().unwrap();
        assert!(next.applied);
        assert_eq!(next.remaining, 100);
    }

    #[tokio::test]
    async fn test_ledger_provision_if_absent_keeps_existing_budget() {
        let ledger = MemoryLedgerStore::new();
        assert!(ledger.provision_if_absent("key_1", 10, Some("2026-10-19")).await.unwrap());
        ledger.consume("key_1", 10).await.unwrap();

        assert!(!ledger.provision_if_absent("key_1", 10, None).await.unwrap());
        assert_eq!(ledger.get("key_1").await.unwrap(), Some(0));

        // The provisioning period counts as already refilled
        let same_day = ledger.refill("key_1", 50, RefillMode::Set, "2026-10-19").await.unwrap().unwrap();
        assert!(!same_day.applied);
        assert_eq!(same_day.remaining, 0);
    }

    #[tokio::test]
    async fn test_ledger_set_none_removes_budget() {
        let ledger = MemoryLedgerStore::new();
        ledger.set("key_1", Some(1)).await.unwrap();
        ledger.set("key_1", None).await.unwrap();
        assert_eq!(ledger.get("key_1").await.unwrap(), None);
    }
}
