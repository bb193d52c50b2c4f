//! Locally buffered window counter used by async-mode limiting.

use std::sync::atomic::{AtomicU64, Ordering};

use super::window::Window;

/// A window counter split into the last value reconciled with the store and
/// the increments admitted locally since then.
///
/// `baseline + pending` never exceeds what the store will hold once the
/// pending increments are flushed, so a local denial is always a true one.
#[derive(Debug)]
pub struct LocalWindow {
    window: Window,
    /// Last count reported by the store, plus any increments in flight
    baseline: AtomicU64,
    /// Increments not yet handed to the store
    pending: AtomicU64,
}

impl LocalWindow {
    pub fn new(window: Window, seed: u64) -> Self {
        Self {
            window,
            baseline: AtomicU64::new(seed),
            pending: AtomicU64::new(0),
        }
    }

    pub fn window(&self) -> Window {
        self.window
    }

    /// Record `hits` and return the local count including them.
    pub fn increment(&self, hits: u64) -> u64 {
        let pending = self.pending.fetch_add(hits, Ordering::SeqCst) + hits;
        self.baseline.load(Ordering::SeqCst).saturating_add(pending)
    }

    /// Current local count.
    pub fn count(&self) -> u64 {
        self.baseline
            .load(Ordering::SeqCst)
            .saturating_add(self.pending.load(Ordering::SeqCst))
    }

    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::SeqCst)
    }

    /// Raise the baseline to at least `seen`.
    pub fn observe(&self, seen: u64) {
        self.baseline.fetch_max(seen, Ordering::SeqCst);
    }

    /// Move all pending increments into the baseline and return how many were
    /// moved. The local count is unchanged.
    pub fn begin_flush(&self) -> u64 {
        let taken = self.pending.swap(0, Ordering::SeqCst);
        self.baseline.fetch_add(taken, Ordering::SeqCst);
        taken
    }

    /// The store accepted the flush and reported `global`.
    pub fn complete_flush(&self, global: u64) {
        self.baseline.store(global, Ordering::SeqCst);
    }

    /// The store rejected the flush; put the increments back.
    pub fn abort_flush(&self, taken: u64) {
        self.baseline.fetch_sub(taken, Ordering::SeqCst);
        self.pending.fetch_add(taken, Ordering::SeqCst);
    }
}
