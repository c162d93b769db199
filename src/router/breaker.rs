// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Per-tier circuit breaker
//!
//! Tracks call outcomes over a rolling window. When the failure rate crosses
//! the threshold the breaker opens and calls fail fast for a cool-down
//! period; after that a limited number of half-open trial calls decide
//! whether to close again or re-open.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Rolling window size in calls.
    pub window_size: usize,
    /// Failure rate in [0,1] that opens the breaker.
    pub failure_threshold: f32,
    /// Minimum calls in the window before the rate is meaningful.
    pub min_calls: usize,
    /// How long the breaker stays open before going half-open.
    pub cooldown: Duration,
    /// Trial calls that must all succeed to close from half-open.
    pub half_open_trials: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window_size: 20,
            failure_threshold: 0.5,
            min_calls: 5,
            cooldown: Duration::from_secs(30),
            half_open_trials: 3,
        }
    }
}

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

enum State {
    Closed,
    Open { until: Instant },
    HalfOpen { trials_left: u32, successes: u32 },
}

struct Inner {
    state: State,
    outcomes: VecDeque<bool>,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    label: String,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(label: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            config,
            label: label.into(),
            inner: Mutex::new(Inner {
                state: State::Closed,
                outcomes: VecDeque::new(),
            }),
        }
    }

    /// Whether a call may go out right now.
    ///
    /// An expired open breaker transitions to half-open here; half-open
    /// grants at most `half_open_trials` in-flight trials.
    pub fn allow(&self) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return true;
        };

        match &mut inner.state {
            State::Closed => true,
            State::Open { until } => {
                if Instant::now() >= *until {
                    info!(tier = %self.label, "circuit breaker half-open, trial calls allowed");
                    inner.state = State::HalfOpen {
                        trials_left: self.config.half_open_trials,
                        successes: 0,
                    };
                    self.grant_trial(&mut inner)
                } else {
                    false
                }
            }
            State::HalfOpen { .. } => self.grant_trial(&mut inner),
        }
    }

    fn grant_trial(&self, inner: &mut Inner) -> bool {
        if let State::HalfOpen { trials_left, .. } = &mut inner.state {
            if *trials_left > 0 {
                *trials_left -= 1;
                return true;
            }
        }
        false
    }

    pub fn record_success(&self) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };

        match &mut inner.state {
            State::HalfOpen { successes, .. } => {
                *successes += 1;
                if *successes >= self.config.half_open_trials {
                    info!(tier = %self.label, "circuit breaker closed after successful trials");
                    inner.state = State::Closed;
                    inner.outcomes.clear();
                }
            }
            _ => self.push_outcome(&mut inner, true),
        }
    }

    pub fn record_failure(&self) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };

        if let State::HalfOpen { .. } = inner.state {
            warn!(tier = %self.label, "half-open trial failed, breaker re-opened");
            inner.state = State::Open {
                until: Instant::now() + self.config.cooldown,
            };
            return;
        }

        self.push_outcome(&mut inner, false);

        let total = inner.outcomes.len();
        if total >= self.config.min_calls {
            let failures = inner.outcomes.iter().filter(|ok| !**ok).count();
            let rate = failures as f32 / total as f32;
            if rate >= self.config.failure_threshold {
                warn!(
                    tier = %self.label,
                    failure_rate = rate,
                    window = total,
                    cooldown_secs = self.config.cooldown.as_secs(),
                    "circuit breaker opened"
                );
                inner.state = State::Open {
                    until: Instant::now() + self.config.cooldown,
                };
            }
        }
    }

    fn push_outcome(&self, inner: &mut Inner, ok: bool) {
        inner.outcomes.push_back(ok);
        while inner.outcomes.len() > self.config.window_size {
            inner.outcomes.pop_front();
        }
    }

    pub fn state(&self) -> BreakerState {
        let Ok(inner) = self.inner.lock() else {
            return BreakerState::Closed;
        };
        match inner.state {
            State::Closed => BreakerState::Closed,
            State::Open { .. } => BreakerState::Open,
            State::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }
}
