//! Fixed-window arithmetic shared by every limiter strategy.

use serde::{Deserialize, Serialize};

/// A fixed time slice `[start, start + duration)` in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Window {
    pub start: u64,
    pub duration: u64,
}

impl Window {
    /// The window of length `duration` that contains `now`.
    ///
    /// A zero duration is treated as one millisecond.
    pub fn containing(now: u64, duration: u64) -> Self {
        let duration = duration.max(1);
        Self {
            start: (now / duration) * duration,
            duration,
        }
    }

    /// When this window ends and a fresh count begins.
    pub fn reset(&self) -> u64 {
        self.start.saturating_add(self.duration)
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.reset() <= now
    }
}

/// Whether a limit is enforced against the store on every request or
/// counted locally and reconciled in the background.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsistencyMode {
    #[default]
    Sync,
    Async,
}

impl ConsistencyMode {
    pub fn from_async_flag(is_async: bool) -> Self {
        if is_async {
            ConsistencyMode::Async
        } else {
            ConsistencyMode::Sync
        }
    }
}

/// The effective limit applied to a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitConfig {
    /// Maximum units admitted per window
    pub limit: u64,
    /// Window length in milliseconds
    pub duration_ms: u64,
    pub mode: ConsistencyMode,
}

/// Result of evaluating a count against a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Epoch milliseconds at which the window resets.
    pub reset: u64,
    /// Count of the window including this request.
    pub count: u64,
}

impl Decision {
    /// Admit iff `count <= limit`.
    pub fn evaluate(limit: u64, window: Window, count: u64) -> Self {
        Self {
            allowed: count <= limit,
            limit,
            remaining: limit.saturating_sub(count),
            reset: window.reset(),
            count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_floors_to_duration() {
        let window = Window::containing(12_345, 1000);
        assert_eq!(window.start, 12_000);
        assert_eq!(window.reset(), 13_000);

        let window = Window::containing(13_000, 1000);
        assert_eq!(window.start, 13_000);
    }

    #[test]
    fn test_zero_duration_does_not_divide_by_zero() {
        let window = Window::containing(77, 0);
        assert_eq!(window.duration, 1);
        assert_eq!(window.start, 77);
    }

    #[test]
    fn test_window_expiry() {
        let window = Window::containing(5_500, 1000);
        assert!(!window.is_expired(5_999));
        assert!(window.is_expired(6_000));
    }

    #[test]
    fn test_decision_at_limit_boundary() {
        let window = Window::containing(0, 1000);

        let at_limit = Decision::evaluate(10, window, 10);
        assert!(at_limit.allowed);
        assert_eq!(at_limit.remaining, 0);

        let over = Decision::evaluate(10, window, 11);
        assert!(!over.allowed);
        assert_eq!(over.remaining, 0);
        assert_eq!(over.reset, 1000);
    }

    #[test]
    fn test_zero_limit_denies_everything() {
        let window = Window::containing(0, 1000);
        assert!(!Decision::evaluate(0, window, 1).allowed);
    }
}
