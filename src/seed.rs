//! Startup data for the in-memory metadata stores.
//!
//! A seed file lists namespaces, overrides and keys:
//!
//! ```yaml
//! namespaces:
//!   - id: ns_api
//!     workspace_id: ws_1
//!     name: api
//!     default_limit: 100
//!     default_duration: 60000
//! overrides:
//!   - id: ovr_vip
//!     namespace_id: ns_api
//!     identifier: "user:*"
//!     limit: 1000
//!     duration: 60000
//! keys:
//!   - id: key_1
//!     secret: sk_live_example
//!     workspace_id: ws_1
//!     remaining: 100
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{KeygateError, Result};
use crate::keys::{hash_secret, Key, KeyRatelimit, MemoryKeyStore, QuotaLedger, RefillConfig};
use crate::ratelimit::{MemoryOverrideStore, RatelimitNamespace, RatelimitOverride};

/// A key entry; either the plaintext `secret` or its `hash` must be given.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedKey {
    pub id: String,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub hash: Option<String>,
    pub workspace_id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub expires: Option<u64>,
    #[serde(default)]
    pub remaining: Option<u64>,
    #[serde(default)]
    pub refill: Option<RefillConfig>,
    #[serde(default)]
    pub ratelimit: Option<KeyRatelimit>,
}

fn default_enabled() -> bool {
    true
}

impl SeedKey {
    pub fn into_key(self) -> Result<Key> {
        let hash = match (self.hash, self.secret) {
            (Some(hash), _) => hash,
            (None, Some(secret)) => hash_secret(&secret),
            (None, None) => {
                return Err(KeygateError::Config(format!(
                    "seed key {} needs a secret or a hash",
                    self.id
                )))
            }
        };
        Ok(Key {
            id: self.id,
            hash,
            workspace_id: self.workspace_id,
            enabled: self.enabled,
            expires: self.expires,
            remaining: self.remaining,
            refill: self.refill,
            ratelimit: self.ratelimit,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedData {
    #[serde(default)]
    pub namespaces: Vec<RatelimitNamespace>,
    #[serde(default)]
    pub overrides: Vec<RatelimitOverride>,
    #[serde(default)]
    pub keys: Vec<SeedKey>,
}

/// Counts of what a seed loaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedSummary {
    pub namespaces: usize,
    pub overrides: usize,
    pub keys: usize,
}

impl SeedData {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading seed data");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| KeygateError::Config(format!("Failed to parse seed data: {}", e)))
    }

    /// Insert everything into the memory stores and provision key budgets.
    /// Budgets already present in the ledger are left as they are, so nodes
    /// sharing a ledger may apply the same seed on every start.
    pub async fn apply(
        self,
        keys: &MemoryKeyStore,
        overrides: &MemoryOverrideStore,
        ledger: &QuotaLedger,
        now_ms: u64,
    ) -> Result<SeedSummary> {
        let mut summary = SeedSummary::default();

        for namespace in self.namespaces {
            overrides.insert_namespace(namespace);
            summary.namespaces += 1;
        }
        for rule in self.overrides {
            if rule.duration == 0 {
                return Err(KeygateError::Config(format!(
                    "override {} has a zero duration",
                    rule.id
                )));
            }
            overrides.insert_override(rule);
            summary.overrides += 1;
        }
        for seed in self.keys {
            let key = seed.into_key()?;
            ledger.provision(&key, now_ms).await?;
            keys.insert(key);
            summary.keys += 1;
        }

        info!(
            namespaces = summary.namespaces,
            overrides = summary.overrides,
            keys = summary.keys,
            "Seed data loaded"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyStore;
    use crate::ratelimit::OverrideStore;
    use crate::store::MemoryLedgerStore;
    use std::sync::Arc;

    // 2026-10-19T12:00:00Z
    const NOW: u64 = 1_792_411_200_000;

    const SEED: &str = r#"
namespaces:
  - id: ns_api
    workspace_id: ws_1
    name: api
    default_limit: 100
    default_duration: 60000
overrides:
  - id: ovr_vip
    namespace_id: ns_api
    identifier: "user:*"
    limit: 1000
    duration: 60000
    async: true
keys:
  - id: key_1
    secret: sk_live_example
    workspace_id: ws_1
    remaining: 100
    refill:
      amount: 100
      interval: monthly
      day_of_month: 31
  - id: key_2
    hash: abc123
    workspace_id: ws_1
    enabled: false
"#;

    #[tokio::test]
    async fn test_apply_seed() {
        let keys = MemoryKeyStore::new();
        let overrides = MemoryOverrideStore::new();
        let ledger = QuotaLedger::new(Arc::new(MemoryLedgerStore::new()));

        let summary = SeedData::from_yaml(SEED)
            .unwrap()
            .apply(&keys, &overrides, &ledger, NOW)
            .await
            .unwrap();
        assert_eq!(
            summary,
            SeedSummary {
                namespaces: 1,
                overrides: 1,
                keys: 2
            }
        );

        let key = keys
            .find_by_hash(&hash_secret("sk_live_example"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(key.id, "key_1");
        assert_eq!(key.refill.unwrap().day_of_month, Some(31));
        assert_eq!(ledger.remaining("key_1").await.unwrap(), Some(100));
        assert_eq!(ledger.remaining("key_2").await.unwrap(), None);
        assert!(!keys.get("key_2").await.unwrap().unwrap().enabled);

        let rules = overrides.list_overrides("ns_api").await.unwrap();
        assert_eq!(rules.len(), 1);
        assert!(rules[0].async_mode);
        assert!(overrides.find_namespace("ws_1", "api").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reapplying_seed_keeps_shared_budgets() {
        let ledger = QuotaLedger::new(Arc::new(MemoryLedgerStore::new()));

        // First node boots and the key is used up
        SeedData::from_yaml(SEED)
            .unwrap()
            .apply(&MemoryKeyStore::new(), &MemoryOverrideStore::new(), &ledger, NOW)
            .await
            .unwrap();
        for _ in 0..100 {
            assert!(ledger.consume("key_1", 1).await.unwrap().unwrap().ok);
        }

        // A second node boots against the same ledger
        SeedData::from_yaml(SEED)
            .unwrap()
            .apply(&MemoryKeyStore::new(), &MemoryOverrideStore::new(), &ledger, NOW + 1000)
            .await
            .unwrap();
        assert_eq!(ledger.remaining("key_1").await.unwrap(), Some(0));
        assert!(!ledger.consume("key_1", 1).await.unwrap().unwrap().ok);
    }

    #[tokio::test]
    async fn test_key_without_secret_or_hash_is_rejected() {
        let yaml = r#"
keys:
  - id: key_bad
    workspace_id: ws_1
"#;
        let err = SeedData::from_yaml(yaml)
            .unwrap()
            .apply(
                &MemoryKeyStore::new(),
                &MemoryOverrideStore::new(),
                &QuotaLedger::new(Arc::new(MemoryLedgerStore::new())),
                NOW,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, KeygateError::Config(_)));
    }

    #[test]
    fn test_empty_seed() {
        let seed = SeedData::from_yaml("{}").unwrap();
        assert!(seed.keys.is_empty());
        assert!(seed.namespaces.is_empty());
    }
}
