//! Edge verification: the per-region coordinator and its request types.

mod coordinator;
mod verdict;

pub use coordinator::{EdgeCoordinator, KeyInfo, Stores};
pub use verdict::{
    NamespaceRatelimitRequest, NamespaceRatelimitResult, NamespaceRef, RatelimitState,
    VerificationCode, VerificationResult, VerifyRequest,
};
