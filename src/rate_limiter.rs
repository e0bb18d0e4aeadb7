//! Process-wide upstream call budget.
//!
//! The Tiered Collector is the sole consumer of the upstream DEX price API
//! (§5 "Shared-resource policy"). The budget is a single token bucket sized
//! at `B` calls/minute; non-blocking `try_acquire` lets the collector count
//! exhaustion rather than stall a suspension point on it.

use std::sync::atomic::{AtomicU32, AtomicI64, Ordering};
use tracing::warn;

/// Non-blocking, single-window token bucket for the upstream call budget.
pub struct CallBudget {
    capacity: u32,
    used: AtomicU32,
    window_start_secs: AtomicI64,
}

impl CallBudget {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            used: AtomicU32::new(0),
            window_start_secs: AtomicI64::new(now_secs()),
        }
    }

    /// Roll the window if a minute has elapsed since it opened.
    fn maybe_roll(&self) {
        let now = now_secs();
        let start = self.window_start_secs.load(Ordering::Relaxed);
        if now - start >= 60 {
            // Best-effort: a concurrent roller may double-reset; harmless,
            // since the bucket only ever gets easier to acquire from that.
            if self
                .window_start_secs
                .compare_exchange(start, now, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                self.used.store(0, Ordering::Relaxed);
            }
        }
    }

    /// Try to spend one call against the budget. Non-blocking.
    pub fn try_acquire(&self) -> bool {
        self.maybe_roll();
        let mut current = self.used.load(Ordering::Relaxed);
        loop {
            if current >= self.capacity {
                warn!(capacity = self.capacity, "upstream call budget exhausted for this window");
                return false;
            }
            match self.used.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn remaining(&self) -> u32 {
        self.maybe_roll();
        self.capacity.saturating_sub(self.used.load(Ordering::Relaxed))
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausts_at_capacity() {
        let budget = CallBudget::new(3);
        assert!(budget.try_acquire());
        assert!(budget.try_acquire());
        assert!(budget.try_acquire());
        assert!(!budget.try_acquire());
        assert_eq!(budget.remaining(), 0);
    }
}
