// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use super::*;
use crate::config::MuxConfig;

fn breaker_config(failure_threshold: usize) -> BreakerConfig {
    BreakerConfig {
        failure_threshold,
        window: Duration::from_secs(60),
        open_to_half_open: Duration::from_millis(50),
        half_open_max_calls: 2,
        success_threshold: 2,
        latency_threshold: Duration::from_millis(500),
    }
}

#[test]
fn opens_at_failure_threshold() {
    let breaker = CircuitBreaker::new(breaker_config(3));
    assert_eq!(breaker.state(), BreakerState::Closed);

    breaker.record_failure();
    breaker.record_failure();
    assert_eq!(breaker.state(), BreakerState::Closed);
    assert!(breaker.allow());

    breaker.record_failure();
    assert_eq!(breaker.state(), BreakerState::Open);
    assert!(!breaker.allow());
}

#[test]
fn slow_samples_count_toward_opening() {
    let breaker = CircuitBreaker::new(breaker_config(3));

    breaker.record_failure();
    breaker.record_failure();
    // A fast success does not open; a slow one is the third sample.
    breaker.record_success(Duration::from_millis(1));
    assert_eq!(breaker.state(), BreakerState::Closed);
    breaker.record_success(Duration::from_secs(2));
    assert_eq!(breaker.state(), BreakerState::Open);

    let snap = breaker.snapshot();
    assert_eq!(snap.failures_in_window, 2);
    assert_eq!(snap.slow_in_window, 1);
}

#[test]
fn half_open_probe_budget_and_close() {
    let breaker = CircuitBreaker::new(breaker_config(1));
    breaker.record_failure();
    assert_eq!(breaker.state(), BreakerState::Open);
    assert!(!breaker.allow());

    std::thread::sleep(Duration::from_millis(60));

    // Probe budget: two admitted, third refused.
    assert!(breaker.allow());
    assert_eq!(breaker.state(), BreakerState::HalfOpen);
    assert!(breaker.allow());
    assert!(!breaker.allow());

    breaker.record_success(Duration::from_millis(1));
    assert_eq!(breaker.state(), BreakerState::HalfOpen);
    breaker.record_success(Duration::from_millis(1));
    assert_eq!(breaker.state(), BreakerState::Closed);
    assert!(breaker.allow());
}

#[test]
fn half_open_probe_failure_reopens() {
    let breaker = CircuitBreaker::new(breaker_config(1));
    breaker.record_failure();
    std::thread::sleep(Duration::from_millis(60));
    assert!(breaker.allow());
    assert_eq!(breaker.state(), BreakerState::HalfOpen);

    breaker.record_failure();
    assert_eq!(breaker.state(), BreakerState::Open);
    assert!(!breaker.allow());
}

#[test]
fn cancel_probe_returns_slot() {
    let breaker = CircuitBreaker::new(breaker_config(1));
    breaker.record_failure();
    std::thread::sleep(Duration::from_millis(60));

    assert!(breaker.allow());
    assert!(breaker.allow());
    assert!(!breaker.allow());
    breaker.cancel_probe();
    assert!(breaker.allow());
}

#[test]
fn llm_breakers_are_per_provider() {
    let breakers = Breakers::new(&MuxConfig {
        llm_failure_threshold: 1,
        ..MuxConfig::default()
    });

    breakers.llm("anthropic").record_failure();
    assert_eq!(breakers.llm("anthropic").state(), BreakerState::Open);
    assert_eq!(breakers.llm("openai").state(), BreakerState::Closed);
}

#[test]
fn bash_hybrid_trips_per_session_first() {
    let breakers = Breakers::new(&MuxConfig {
        bash_failure_threshold: 2,
        bash_global_failure_threshold: 50,
        ..MuxConfig::default()
    });

    assert!(breakers.bash_allow("s1"));
    breakers.bash_record("s1", true, Duration::from_millis(1));
    breakers.bash_record("s1", true, Duration::from_millis(1));
    assert!(!breakers.bash_allow("s1"));
    // Another session is unaffected by s1's breaker.
    assert!(breakers.bash_allow("s2"));
}

#[test]
fn bash_nonzero_exit_is_not_a_failure() {
    let breakers = Breakers::new(&MuxConfig {
        bash_failure_threshold: 1,
        ..MuxConfig::default()
    });

    // Only timeouts count; plain completions never trip the breaker.
    for _ in 0..5 {
        breakers.bash_record("s1", false, Duration::from_millis(1));
    }
    assert!(breakers.bash_allow("s1"));

    breakers.bash_record("s1", true, Duration::from_millis(1));
    assert!(!breakers.bash_allow("s1"));
}

#[test]
fn forget_session_resets_bash_state() {
    let breakers = Breakers::new(&MuxConfig {
        bash_failure_threshold: 1,
        ..MuxConfig::default()
    });
    breakers.bash_record("s1", true, Duration::from_millis(1));
    assert!(!breakers.bash_allow("s1"));

    breakers.forget_session("s1");
    assert!(breakers.bash_allow("s1"));
}
