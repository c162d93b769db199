// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Rolling cost budget tracking
//!
//! An explicit, injected counter rather than ambient global state: the
//! router receives an `Arc<CostTracker>` and asks it for the budget state
//! per query. Updates are atomic; the window rolls over via compare-and-swap
//! so concurrent recorders never double-reset.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::warn;

/// Whether spending is still under the ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetState {
    Normal,
    /// Ceiling exceeded; the router forces the cheap tier until the
    /// window resets.
    Constrained,
}

/// Rolling spend counter with a fixed ceiling per window.
pub struct CostTracker {
    ceiling_microdollars: u64,
    window: Duration,
    spent_microdollars: AtomicU64,
    /// Milliseconds since `anchor` at which the current window began.
    window_started_ms: AtomicU64,
    anchor: Instant,
}

impl CostTracker {
    pub fn new(ceiling_microdollars: u64, window: Duration) -> Self {
        Self {
            ceiling_microdollars,
            window,
            spent_microdollars: AtomicU64::new(0),
            window_started_ms: AtomicU64::new(0),
            anchor: Instant::now(),
        }
    }

    /// Record spend for one model call.
    pub fn record(&self, cost_microdollars: u64) {
        self.maybe_roll_window();
        let spent = self
            .spent_microdollars
            .fetch_add(cost_microdollars, Ordering::SeqCst)
            + cost_microdollars;
        if spent >= self.ceiling_microdollars && spent - cost_microdollars < self.ceiling_microdollars
        {
            warn!(
                spent_microdollars = spent,
                ceiling_microdollars = self.ceiling_microdollars,
                "cost ceiling reached, routing constrained to cheap tier"
            );
        }
    }

    /// Current budget state, rolling the window first if it elapsed.
    pub fn state(&self) -> BudgetState {
        self.maybe_roll_window();
        if self.spent_microdollars.load(Ordering::SeqCst) >= self.ceiling_microdollars {
            BudgetState::Constrained
        } else {
            BudgetState::Normal
        }
    }

    /// Spend recorded in the current window.
    pub fn spent_microdollars(&self) -> u64 {
        self.maybe_roll_window();
        self.spent_microdollars.load(Ordering::SeqCst)
    }

    /// Zero the counter and restart the window now.
    pub fn reset(&self) {
        let now_ms = self.anchor.elapsed().as_millis() as u64;
        self.window_started_ms.store(now_ms, Ordering::SeqCst);
        self.spent_microdollars.store(0, Ordering::SeqCst);
    }

    fn maybe_roll_window(&self) {
        let now_ms = self.anchor.elapsed().as_millis() as u64;
        let started = self.window_started_ms.load(Ordering::SeqCst);
        if now_ms.saturating_sub(started) >= self.window.as_millis() as u64 {
            // One winner rolls the window; losers see the fresh counter.
            if self
                .window_started_ms
                .compare_exchange(started, now_ms, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.spent_microdollars.store(0, Ordering::SeqCst);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normal_until_ceiling() {
        let tracker = CostTracker::new(1_000, Duration::from_secs(3600));
        assert_eq!(tracker.state(), BudgetState::Normal);

        tracker.record(500);
        assert_eq!(tracker.state(), BudgetState::Normal);

        tracker.record(500);
        assert_eq!(tracker.state(), BudgetState::Constrained);
        assert_eq!(tracker.spent_microdollars(), 1_000);
    }

    #[test]
    fn test_window_rollover_resets_counter() {
        let tracker = CostTracker::new(100, Duration::from_millis(0));
        tracker.record(200);
        // Zero-length window: the next read rolls it over
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(tracker.state(), BudgetState::Normal);
    }

    #[test]
    fn test_reset() {
        let tracker = CostTracker::new(100, Duration::from_secs(3600));
        tracker.record(500);
        assert_eq!(tracker.state(), BudgetState::Constrained);

        tracker.reset();
        assert_eq!(tracker.state(), BudgetState::Normal);
        assert_eq!(tracker.spent_microdollars(), 0);
    }
}
