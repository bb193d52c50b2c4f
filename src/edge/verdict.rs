//! Verification requests and verdicts.

use serde::{Deserialize, Serialize};

use crate::ratelimit::Decision;

/// Outcome code of a verification, mirrored on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationCode {
    Valid,
    /// Transient; back off until the window resets
    RateLimited,
    /// Terminal until the next refill
    UsageExceeded,
    Disabled,
    Expired,
    NotFound,
}

impl VerificationCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationCode::Valid => "VALID",
            VerificationCode::RateLimited => "RATE_LIMITED",
            VerificationCode::UsageExceeded => "USAGE_EXCEEDED",
            VerificationCode::Disabled => "DISABLED",
            VerificationCode::Expired => "EXPIRED",
            VerificationCode::NotFound => "NOT_FOUND",
        }
    }
}

impl std::fmt::Display for VerificationCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rate limit metadata a client needs to back off correctly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatelimitState {
    pub limit: u64,
    pub remaining: u64,
    /// Epoch milliseconds at which the window resets
    pub reset: u64,
}

impl From<Decision> for RatelimitState {
    fn from(decision: Decision) -> Self {
        Self {
            limit: decision.limit,
            remaining: decision.remaining,
            reset: decision.reset,
        }
    }
}

/// Namespace rate limit to apply alongside key verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceRef {
    pub name: String,
    pub identifier: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyRequest {
    pub key_hash: String,
    #[serde(default)]
    pub namespace: Option<NamespaceRef>,
    #[serde(default = "default_cost")]
    pub cost: u64,
}

fn default_cost() -> u64 {
    1
}

impl VerifyRequest {
    pub fn new(key_hash: impl Into<String>) -> Self {
        Self {
            key_hash: key_hash.into(),
            namespace: None,
            cost: default_cost(),
        }
    }

    pub fn with_namespace(mut self, name: &str, identifier: &str) -> Self {
        self.namespace = Some(NamespaceRef {
            name: name.to_string(),
            identifier: identifier.to_string(),
        });
        self
    }

    pub fn with_cost(mut self, cost: u64) -> Self {
        self.cost = cost;
        self
    }
}

/// The combined verdict of a verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub valid: bool,
    pub code: VerificationCode,
    pub key_id: Option<String>,
    /// Usage budget left; `None` for unlimited keys
    pub remaining: Option<u64>,
    pub ratelimit: Option<RatelimitState>,
}

impl VerificationResult {
    pub fn denied(code: VerificationCode, key_id: Option<&str>) -> Self {
        Self {
            valid: false,
            code,
            key_id: key_id.map(str::to_string),
            remaining: None,
            ratelimit: None,
        }
    }
}

/// Standalone namespace rate limit call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceRatelimitRequest {
    pub workspace_id: String,
    pub namespace: String,
    pub identifier: String,
    /// Used when no override matches
    pub limit: u64,
    pub duration: u64,
    pub cost: u64,
    pub async_mode: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceRatelimitResult {
    pub success: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset: u64,
    /// The override that supplied the limit, if any
    pub override_id: Option<String>,
}
