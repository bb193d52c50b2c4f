//! API key records and their authoritative lookup.

mod ledger;

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ratelimit::{ConsistencyMode, LimitConfig};
use crate::store::{RefillMode, StoreError};

pub use ledger::{refill_period, QuotaLedger};

/// Hex-encoded SHA-256 of a key secret, the form keys are looked up by.
pub fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

/// How often a key's usage budget is topped up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefillInterval {
    Daily,
    Monthly,
}

/// Periodic credit top-up of a key's `remaining`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefillConfig {
    pub amount: u64,
    pub interval: RefillInterval,
    /// Day of the month monthly refills happen on; the last day of shorter
    /// months is used when it does not exist. Defaults to the 1st.
    #[serde(default)]
    pub day_of_month: Option<u32>,
    #[serde(default = "default_refill_mode")]
    pub mode: RefillMode,
}

fn default_refill_mode() -> RefillMode {
    RefillMode::Set
}

/// A key's own rate limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRatelimit {
    pub limit: u64,
    /// Window length in milliseconds
    #[serde(default)]
    pub duration: Option<u64>,
    /// Legacy bucket configs: used as the window length when `duration` is absent
    #[serde(default)]
    pub refill_interval: Option<u64>,
    #[serde(default)]
    pub refill_rate: Option<u64>,
    #[serde(default, rename = "async")]
    pub async_mode: bool,
}

impl KeyRatelimit {
    pub fn limit_config(&self) -> Option<LimitConfig> {
        Some(LimitConfig {
            limit: self.limit,
            duration_ms: self.duration.or(self.refill_interval)?,
            mode: ConsistencyMode::from_async_flag(self.async_mode),
        })
    }
}

/// An API key as the verifier sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    pub id: String,
    /// Hex SHA-256 of the secret
    pub hash: String,
    pub workspace_id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Epoch milliseconds after which the key is rejected
    #[serde(default)]
    pub expires: Option<u64>,
    /// Usage budget at provisioning time; `None` is unlimited
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

impl Key {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires.is_some_and(|expires| expires <= now_ms)
    }
}

/// Authoritative key records.
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn find_by_hash(&self, hash: &str) -> Result<Option<Key>, StoreError>;

    async fn get(&self, key_id: &str) -> Result<Option<Key>, StoreError>;

    /// Keys with a refill configuration.
    async fn list_refillable(&self) -> Result<Vec<Key>, StoreError>;
}

#[derive(Default)]
struct KeyTable {
    by_id: HashMap<String, Key>,
    /// hash -> id
    by_hash: HashMap<String, String>,
}

/// In-memory key table.
#[derive(Default)]
pub struct MemoryKeyStore {
    table: RwLock<KeyTable>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a key.
    pub fn insert(&self, key: Key) {
        let mut table = self.table.write();
        if let Some(previous) = table.by_id.get(&key.id).map(|k| k.hash.clone()) {
            table.by_hash.remove(&previous);
        }
        table.by_hash.insert(key.hash.clone(), key.id.clone());
        table.by_id.insert(key.id.clone(), key);
    }

    pub fn len(&self) -> usize {
        self.table.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn find_by_hash(&self, hash: &str) -> Result<Option<Key>, StoreError> {
        let table = self.table.read();
        Ok(table
            .by_hash
            .get(hash)
            .and_then(|id| table.by_id.get(id))
            .cloned())
    }

    async fn get(&self, key_id: &str) -> Result<Option<Key>, StoreError> {
        Ok(self.table.read().by_id.get(key_id).cloned())
    }

    async fn list_refillable(&self) -> Result<Vec<Key>, StoreError> {
        Ok(self
            .table
            .read()
            .by_id
            .values()
            .filter(|key| key.refill.is_some())
            .cloned()
            .collect())
    }
}
