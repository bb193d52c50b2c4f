//! Limiter strategy trait shared by the sync and async implementations.

use async_trait::async_trait;

use super::scope::Scope;
use super::window::Decision;
use crate::store::StoreError;

/// One rate limit evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatelimitRequest {
    pub scope: Scope,
    pub limit: u64,
    pub duration_ms: u64,
    /// Units consumed. Zero inspects the window without consuming.
    pub cost: u64,
}

/// Decides allow/deny for a scope under fixed-window semantics.
///
/// Implementations differ only in where the count lives; the window math is
/// shared through [`super::window::Decision::evaluate`].
#[async_trait]
pub trait RatelimitStrategy: Send + Sync {
    async fn limit(&self, request: &RatelimitRequest) -> Result<Decision, StoreError>;
}
