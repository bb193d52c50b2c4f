//! Rate limiting logic and state management.

mod buffered;
mod counter;
mod limiter;
mod namespace;
mod overrides;
mod scope;
mod strategy;
mod window;

pub use buffered::{AsyncLimiter, AsyncLimiterConfig, FlushReport};
pub use counter::LocalWindow;
pub use limiter::{RateLimiter, SyncLimiter};
pub use namespace::{MemoryOverrideStore, OverrideStore, OverrideUpsert, RatelimitNamespace};
pub use overrides::{IdentifierPattern, OverrideSet, RatelimitOverride, Segment};
pub use scope::Scope;
pub use strategy::{RatelimitRequest, RatelimitStrategy};
pub use window::{ConsistencyMode, Decision, LimitConfig, Window};
