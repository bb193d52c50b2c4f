//! Lifetime usage budgets and their periodic refill.

use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use tracing::{debug, info};

use super::{Key, RefillConfig, RefillInterval};
use crate::store::{ConsumeOutcome, LedgerStore, RefillOutcome, StoreError};

/// The refill period tag due at `now_ms`, if a refill is due.
///
/// Daily refills are due every UTC day and tagged `YYYY-MM-DD`. Monthly
/// refills are due from their day of the month onward and tagged `YYYY-MM`.
/// Because the ledger applies each tag at most once, asking repeatedly within
/// a period is harmless.
pub fn refill_period(refill: &RefillConfig, now_ms: u64) -> Option<String> {
    let now = DateTime::<Utc>::from_timestamp_millis(i64::try_from(now_ms).ok()?)?;
    let today = now.date_naive();

    match refill.interval {
        RefillInterval::Daily => Some(today.format("%Y-%m-%d").to_string()),
        RefillInterval::Monthly => {
            let wanted = refill.day_of_month.unwrap_or(1).max(1);
            let day = wanted.min(days_in_month(today.year(), today.month())?);
            (today.day() >= day).then(|| today.format("%Y-%m").to_string())
        }
    }
}

fn days_in_month(year: i32, month: u32) -> Option<u32> {
    let first_of_next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    Some(first_of_next.pred_opt()?.day())
}

/// Atomic consumption and refill of key budgets.
///
/// Both operations go through the ledger store's per-key atomic primitive,
/// so a refill can never interleave destructively with a consume.
#[derive(Clone)]
pub struct QuotaLedger {
    store: Arc<dyn LedgerStore>,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Decrement the key's budget by `cost` if it covers it. Insufficient
    /// budgets are rejected without mutation. `None` when the key is unlimited.
    pub async fn consume(&self, key_id: &str, cost: u64) -> Result<Option<ConsumeOutcome>, StoreError> {
        let outcome = self.store.consume(key_id, cost).await?;
        if let Some(outcome) = outcome {
            if !outcome.ok {
                debug!(key_id, cost, remaining = outcome.remaining, "Usage budget exhausted");
            }
        }
        Ok(outcome)
    }

    pub async fn remaining(&self, key_id: &str) -> Result<Option<u64>, StoreError> {
        self.store.get(key_id).await
    }

    /// Create the key's budget from its record unless the ledger already
    /// holds one. The refill period current at `now_ms` is recorded as
    /// applied, so the first refill happens in the next period.
    pub async fn provision(&self, key: &Key, now_ms: u64) -> Result<bool, StoreError> {
        let Some(remaining) = key.remaining else {
            return Ok(false);
        };
        let period = key
            .refill
            .as_ref()
            .and_then(|refill| refill_period(refill, now_ms));

        let created = self
            .store
            .provision_if_absent(&key.id, remaining, period.as_deref())
            .await?;
        if created {
            debug!(key_id = %key.id, remaining, period = ?period, "Provisioned usage budget");
        } else {
            debug!(key_id = %key.id, "Usage budget already provisioned, keeping it");
        }
        Ok(created)
    }

    /// Apply the key's refill if one is due at `now_ms`.
    pub async fn refill_if_due(&self, key: &Key, now_ms: u64) -> Result<Option<RefillOutcome>, StoreError> {
        let Some(refill) = &key.refill else {
            return Ok(None);
        };
        let Some(period) = refill_period(refill, now_ms) else {
            return Ok(None);
        };

        let outcome = self
            .store
            .refill(&key.id, refill.amount, refill.mode, &period)
            .await?;
        if let Some(outcome) = outcome.filter(|o| o.applied) {
            info!(key_id = %key.id, period = %period, remaining = outcome.remaining, "Refilled usage budget");
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryLedgerStore, RefillMode};

    // 2026-10-19T12:00:00Z
    const OCT_19: u64 = 1_792_411_200_000;
    const DAY_MS: u64 = 86_400_000;

    fn refill(interval: RefillInterval, day_of_month: Option<u32>) -> RefillConfig {
        RefillConfig {
            amount: 100,
            interval,
            day_of_month,
            mode: RefillMode::Set,
        }
    }

    fn key_with_budget(remaining: u64) -> Key {
        Key {
            id: "key_1".to_string(),
            hash: "h".to_string(),
            workspace_id: "ws_1".to_string(),
            enabled: true,
            expires: None,
            remaining: Some(remaining),
            refill: Some(refill(RefillInterval::Daily, None)),
            ratelimit: None,
        }
    }

    fn ledger() -> QuotaLedger {
        QuotaLedger::new(Arc::new(MemoryLedgerStore::new()))
    }

    #[test]
    fn test_daily_period_is_the_utc_date() {
        let daily = refill(RefillInterval::Daily, None);
        assert_eq!(refill_period(&daily, OCT_19).as_deref(), Some("2026-10-19"));
        assert_eq!(refill_period(&daily, OCT_19 + DAY_MS).as_deref(), Some("2026-10-20"));
    }

    #[test]
    fn test_monthly_period_waits_for_its_day() {
        let on_20th = refill(RefillInterval::Monthly, Some(20));
        assert_eq!(refill_period(&on_20th, OCT_19), None);
        assert_eq!(refill_period(&on_20th, OCT_19 + DAY_MS).as_deref(), Some("2026-10"));
    }

    #[test]
    fn test_monthly_day_is_clamped_to_month_end() {
        assert_eq!(days_in_month(2026, 2), Some(28));
        assert_eq!(days_in_month(2028, 2), Some(29));
        assert_eq!(days_in_month(2026, 12), Some(31));

        // 2026-11-30T12:00:00Z, November has no 31st
        let nov_30 = OCT_19 + 42 * DAY_MS;
        let on_31st = refill(RefillInterval::Monthly, Some(31));
        assert_eq!(refill_period(&on_31st, nov_30).as_deref(), Some("2026-11"));
    }

    #[tokio::test]
    async fn test_monotonic_depletion() {
        let ledger = ledger();
        ledger.provision(&key_with_budget(100), OCT_19).await.unwrap();

        for expected in (0..100).rev() {
            let outcome = ledger.consume("key_1", 1).await.unwrap().unwrap();
            assert!(outcome.ok);
            assert_eq!(outcome.remaining, expected);
        }

        let rejected = ledger.consume("key_1", 1).await.unwrap().unwrap();
        assert!(!rejected.ok);
        assert_eq!(rejected.remaining, 0);
        assert_eq!(ledger.remaining("key_1").await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_no_over_depletion_under_concurrency() {
        let ledger = ledger();
        ledger.provision(&key_with_budget(25), OCT_19).await.unwrap();

        let handles: Vec<_> = (0..100)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.consume("key_1", 1).await.unwrap().unwrap() })
            })
            .collect();

        let mut successes = 0;
        for handle in handles {
            let outcome = handle.await.unwrap();
            if outcome.ok {
                successes += 1;
            }
        }

        assert_eq!(successes, 25);
        assert_eq!(ledger.remaining("key_1").await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_partial_cost_is_rejected_outright() {
        let ledger = ledger();
        ledger.provision(&key_with_budget(5), OCT_19).await.unwrap();

        let outcome = ledger.consume("key_1", 10).await.unwrap().unwrap();
        assert!(!outcome.ok);
        assert_eq!(outcome.remaining, 5);
    }

    #[tokio::test]
    async fn test_unlimited_keys_have_no_ledger_entry() {
        let ledger = ledger();
        let mut key = key_with_budget(0);
        key.remaining = None;
        assert!(!ledger.provision(&key, OCT_19).await.unwrap());

        assert!(ledger.consume("key_1", 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_refill_if_due_applies_once_per_period() {
        let ledger = ledger();
        let key = key_with_budget(0);
        ledger.provision(&key, OCT_19 - DAY_MS).await.unwrap();

        let first = ledger.refill_if_due(&key, OCT_19).await.unwrap().unwrap();
        assert!(first.applied);
        assert_eq!(first.remaining, 100);

        ledger.consume("key_1", 30).await.unwrap();
        let again = ledger.refill_if_due(&key, OCT_19 + 1000).await.unwrap().unwrap();
        assert!(!again.applied);
        assert_eq!(again.remaining, 70);

        let next_day = ledger.refill_if_due(&key, OCT_19 + DAY_MS).await.unwrap().unwrap();
        assert!(next_day.applied);
        assert_eq!(next_day.remaining, 100);
    }

    #[tokio::test]
    async fn test_provisioning_day_is_not_refilled() {
        let ledger = ledger();
        let key = key_with_budget(5);
        ledger.provision(&key, OCT_19).await.unwrap();

        let same_day = ledger.refill_if_due(&key, OCT_19 + 1000).await.unwrap().unwrap();
        assert!(!same_day.applied);
        assert_eq!(ledger.remaining("key_1").await.unwrap(), Some(5));

        let next_day = ledger.refill_if_due(&key, OCT_19 + DAY_MS).await.unwrap().unwrap();
        assert!(next_day.applied);
        assert_eq!(next_day.remaining, 100);
    }

    #[tokio::test]
    async fn test_reprovisioning_keeps_depleted_budget() {
        let ledger = ledger();
        let key = key_with_budget(3);
        assert!(ledger.provision(&key, OCT_19).await.unwrap());
        ledger.consume("key_1", 3).await.unwrap();

        assert!(!ledger.provision(&key, OCT_19 + 1000).await.unwrap());
        assert_eq!(ledger.remaining("key_1").await.unwrap(), Some(0));
    }
}
