// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Circuit breakers over downstream providers.
//!
//! One breaker per LLM provider; a hybrid per-session + global pair
//! for bash. Three states: closed, open, half-open. The circuit opens
//! when failures plus slow samples within the rolling window reach the
//! failure threshold; slow samples are tracked separately so metrics
//! can report them, but they count toward opening.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::config::MuxConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: usize,
    pub window: Duration,
    pub open_to_half_open: Duration,
    pub half_open_max_calls: usize,
    pub success_threshold: usize,
    pub latency_threshold: Duration,
}

impl BreakerConfig {
    pub fn llm(config: &MuxConfig) -> Self {
        Self {
            failure_threshold: config.llm_failure_threshold,
            window: config.breaker_window(),
            open_to_half_open: config.open_to_half_open(),
            half_open_max_calls: config.half_open_max_calls,
            success_threshold: config.success_threshold,
            latency_threshold: config.latency_threshold(),
        }
    }

    pub fn bash(config: &MuxConfig) -> Self {
        Self { failure_threshold: config.bash_failure_threshold, ..Self::llm(config) }
    }

    pub fn bash_global(config: &MuxConfig) -> Self {
        Self { failure_threshold: config.bash_global_failure_threshold, ..Self::llm(config) }
    }
}

struct Inner {
    state: BreakerState,
    failures: VecDeque<Instant>,
    slow: VecDeque<Instant>,
    opened_at: Option<Instant>,
    half_open_in_flight: usize,
    half_open_successes: usize,
    last_transition: Instant,
}

/// One three-state breaker.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: VecDeque::new(),
                slow: VecDeque::new(),
                opened_at: None,
                half_open_in_flight: 0,
                half_open_successes: 0,
                last_transition: Instant::now(),
            }),
        }
    }

    fn prune(inner: &mut Inner, window: Duration, now: Instant) {
        while inner.failures.front().is_some_and(|t| now.duration_since(*t) >= window) {
            inner.failures.pop_front();
        }
        while inner.slow.front().is_some_and(|t| now.duration_since(*t) >= window) {
            inner.slow.pop_front();
        }
    }

    fn transition(inner: &mut Inner, next: BreakerState, now: Instant) {
        inner.state = next;
        inner.last_transition = now;
        if next == BreakerState::Open {
            inner.opened_at = Some(now);
        } else {
            inner.opened_at = None;
        }
        if next != BreakerState::HalfOpen {
            inner.half_open_in_flight = 0;
            inner.half_open_successes = 0;
        }
    }

    /// Whether a call may proceed. Half-open admits up to the probe
    /// budget; callers that were admitted must report an outcome.
    pub fn allow(&self) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        Self::prune(&mut inner, self.config.window, now);

        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = inner.opened_at.map(|t| now.duration_since(t)).unwrap_or_default();
                if elapsed >= self.config.open_to_half_open {
                    Self::transition(&mut inner, BreakerState::HalfOpen, now);
                    inner.half_open_in_flight = 1;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_in_flight < self.config.half_open_max_calls {
                    inner.half_open_in_flight += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call with its observed latency. Calls at or
    /// above the latency threshold count as slow samples.
    pub fn record_success(&self, latency: Duration) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        Self::prune(&mut inner, self.config.window, now);

        let slow = latency >= self.config.latency_threshold;
        if slow {
            inner.slow.push_back(now);
        }

        match inner.state {
            BreakerState::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    inner.failures.clear();
                    inner.slow.clear();
                    Self::transition(&mut inner, BreakerState::Closed, now);
                }
            }
            BreakerState::Closed => {
                if slow && Self::over_threshold(&inner, self.config.failure_threshold) {
                    Self::transition(&mut inner, BreakerState::Open, now);
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Record a failed call (handler error or timeout).
    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        Self::prune(&mut inner, self.config.window, now);
        inner.failures.push_back(now);

        match inner.state {
            BreakerState::HalfOpen => {
                // Any probe failure reopens.
                Self::transition(&mut inner, BreakerState::Open, now);
            }
            BreakerState::Closed => {
                if Self::over_threshold(&inner, self.config.failure_threshold) {
                    Self::transition(&mut inner, BreakerState::Open, now);
                }
            }
            BreakerState::Open => {}
        }
    }

    fn over_threshold(inner: &Inner, threshold: usize) -> bool {
        inner.failures.len() + inner.slow.len() >= threshold
    }

    /// Return an admitted-but-unused half-open probe slot.
    pub fn cancel_probe(&self) {
        let mut inner = self.inner.lock();
        if inner.state == BreakerState::HalfOpen {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            state: inner.state.as_str().to_owned(),
            failures_in_window: inner.failures.len(),
            slow_in_window: inner.slow.len(),
            since_transition_ms: inner.last_transition.elapsed().as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    pub state: String,
    pub failures_in_window: usize,
    pub slow_in_window: usize,
    pub since_transition_ms: u64,
}

// -- Breaker sets -------------------------------------------------------------

/// All breakers owned by the engine: per-provider LLM breakers and the
/// hybrid bash pair.
pub struct Breakers {
    llm_config: BreakerConfig,
    bash_config: BreakerConfig,
    llm: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    bash_per_session: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    bash_global: CircuitBreaker,
}

impl Breakers {
    pub fn new(config: &MuxConfig) -> Self {
        Self {
            llm_config: BreakerConfig::llm(config),
            bash_config: BreakerConfig::bash(config),
            llm: Mutex::new(HashMap::new()),
            bash_per_session: Mutex::new(HashMap::new()),
            bash_global: CircuitBreaker::new(BreakerConfig::bash_global(config)),
        }
    }

    /// The breaker guarding LLM calls for one provider.
    pub fn llm(&self, provider: &str) -> Arc<CircuitBreaker> {
        let mut map = self.llm.lock();
        Arc::clone(
            map.entry(provider.to_owned())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(self.llm_config.clone()))),
        )
    }

    fn bash_session(&self, session_id: &str) -> Arc<CircuitBreaker> {
        let mut map = self.bash_per_session.lock();
        Arc::clone(
            map.entry(session_id.to_owned())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(self.bash_config.clone()))),
        )
    }

    /// Hybrid bash admission: both the session's breaker and the
    /// global breaker must admit the call.
    pub fn bash_allow(&self, session_id: &str) -> bool {
        let session = self.bash_session(session_id);
        if !session.allow() {
            return false;
        }
        if !self.bash_global.allow() {
            // Hand back the probe slot the session breaker granted.
            session.cancel_probe();
            return false;
        }
        true
    }

    /// Record a bash outcome against both breakers. Only timeouts are
    /// failures; non-zero exit is a legitimate result.
    pub fn bash_record(&self, session_id: &str, timed_out: bool, latency: Duration) {
        let session = self.bash_session(session_id);
        if timed_out {
            session.record_failure();
            self.bash_global.record_failure();
        } else {
            session.record_success(latency);
            self.bash_global.record_success(latency);
        }
    }

    /// Drop per-session bash breakers for deleted sessions.
    pub fn forget_session(&self, session_id: &str) {
        self.bash_per_session.lock().remove(session_id);
    }

    pub fn snapshot(&self) -> BreakersSnapshot {
        let llm = self
            .llm
            .lock()
            .iter()
            .map(|(provider, b)| (provider.clone(), b.snapshot()))
            .collect();
        BreakersSnapshot { llm, bash_global: self.bash_global.snapshot() }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BreakersSnapshot {
    pub llm: HashMap<String, BreakerSnapshot>,
    pub bash_global: BreakerSnapshot,
}

#[cfg(test)]
#[path = "breaker_tests.rs"]
mod tests;
