//! Ratelimit namespaces and the override table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::overrides::RatelimitOverride;
use super::window::{ConsistencyMode, LimitConfig};
use crate::store::StoreError;

/// A named group of rate limits owned by a workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatelimitNamespace {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    /// Limit applied when no override matches and the caller supplies none
    #[serde(default)]
    pub default_limit: Option<u64>,
    #[serde(default)]
    pub default_duration: Option<u64>,
    #[serde(default, rename = "async")]
    pub async_mode: bool,
}

impl RatelimitNamespace {
    pub fn default_config(&self) -> Option<LimitConfig> {
        Some(LimitConfig {
            limit: self.default_limit?,
            duration_ms: self.default_duration?,
            mode: ConsistencyMode::from_async_flag(self.async_mode),
        })
    }
}

/// Fields of an override write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverrideUpsert {
    pub namespace_id: String,
    pub identifier: String,
    pub limit: u64,
    pub duration: u64,
    pub async_mode: bool,
}

/// Authoritative namespace and override records.
#[async_trait]
pub trait OverrideStore: Send + Sync {
    async fn find_namespace(
        &self,
        workspace_id: &str,
        name: &str,
    ) -> Result<Option<RatelimitNamespace>, StoreError>;

    /// All overrides of a namespace in creation order.
    async fn list_overrides(&self, namespace_id: &str) -> Result<Vec<RatelimitOverride>, StoreError>;

    async fn get_override(
        &self,
        namespace_id: &str,
        identifier: &str,
    ) -> Result<Option<RatelimitOverride>, StoreError>;

    /// Create the override for `(namespace_id, identifier)` or update it in
    /// place, keeping its id and creation order.
    async fn upsert_override(&self, upsert: OverrideUpsert) -> Result<RatelimitOverride, StoreError>;

    /// Delete by id, returning the removed override.
    async fn delete_override(&self, id: &str) -> Result<Option<RatelimitOverride>, StoreError>;
}

#[derive(Default)]
struct Tables {
    namespaces: HashMap<String, RatelimitNamespace>,
    /// namespace id -> overrides
    overrides: HashMap<String, Vec<RatelimitOverride>>,
}

/// In-memory override table.
#[derive(Default)]
pub struct MemoryOverrideStore {
    tables: RwLock<Tables>,
    next_seq: AtomicU64,
}

impl MemoryOverrideStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_namespace(&self, namespace: RatelimitNamespace) {
        self.tables
            .write()
            .namespaces
            .insert(namespace.id.clone(), namespace);
    }

    /// Insert a pre-built override, assigning a creation sequence if it has none.
    pub fn insert_override(&self, mut rule: RatelimitOverride) {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        if rule.created_seq == 0 {
            rule.created_seq = seq;
        } else {
            self.next_seq.fetch_max(rule.created_seq, Ordering::SeqCst);
        }
        self.tables
            .write()
            .overrides
            .entry(rule.namespace_id.clone())
            .or_default()
            .push(rule);
    }
}

#[async_trait]
impl OverrideStore for MemoryOverrideStore {
    async fn find_namespace(
        &self,
        workspace_id: &str,
        name: &str,
    ) -> Result<Option<RatelimitNamespace>, StoreError> {
        Ok(self
            .tables
            .read()
            .namespaces
            .values()
            .find(|ns| ns.workspace_id == workspace_id && ns.name == name)
            .cloned())
    }

    async fn list_overrides(&self, namespace_id: &str) -> Result<Vec<RatelimitOverride>, StoreError> {
        let mut overrides = self
            .tables
            .read()
            .overrides
            .get(namespace_id)
            .cloned()
            .unwrap_or_default();
        overrides.sort_by_key(|rule| rule.created_seq);
        Ok(overrides)
    }

    async fn get_override(
        &self,
        namespace_id: &str,
        identifier: &str,
    ) -> Result<Option<RatelimitOverride>, StoreError> {
        Ok(self
            .tables
            .read()
            .overrides
            .get(namespace_id)
            .and_then(|rules| rules.iter().find(|rule| rule.identifier == identifier))
            .cloned())
    }

    async fn upsert_override(&self, upsert: OverrideUpsert) -> Result<RatelimitOverride, StoreError> {
        let mut tables = self.tables.write();
        let rules = tables.overrides.entry(upsert.namespace_id.clone()).or_default();

        if let Some(existing) = rules.iter_mut().find(|rule| rule.identifier == upsert.identifier) {
            existing.limit = upsert.limit;
            existing.duration = upsert.duration;
            existing.async_mode = upsert.async_mode;
            return Ok(existing.clone());
        }

        let rule = RatelimitOverride {
            id: format!("rlor_{}", uuid::Uuid::new_v4().simple()),
            namespace_id: upsert.namespace_id,
            identifier: upsert.identifier,
            limit: upsert.limit,
            duration: upsert.duration,
            async_mode: upsert.async_mode,
            created_seq: self.next_seq.fetch_add(1, Ordering::SeqCst) + 1,
        };
        rules.push(rule.clone());
        Ok(rule)
    }

    async fn delete_override(&self, id: &str) -> Result<Option<RatelimitOverride>, StoreError> {
        let mut tables = self.tables.write();
        for rules in tables.overrides.values_mut() {
            if let Some(pos) = rules.iter().position(|rule| rule.id == id) {
                return Ok(Some(rules.remove(pos)));
            }
        }
        Ok(None)
    }
}
