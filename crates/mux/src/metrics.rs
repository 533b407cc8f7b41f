// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process-wide counters surfaced by `get_metrics`.
//!
//! All counters only ever increase. Invariant breaches (double
//! unregister, negative balances) are counted explicitly instead of
//! being clamped away.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Default)]
pub struct Metrics {
    pub commands_admitted: AtomicU64,
    pub commands_rejected: AtomicU64,
    pub commands_succeeded: AtomicU64,
    pub commands_failed: AtomicU64,
    pub commands_timed_out: AtomicU64,
    pub replays_served: AtomicU64,
    pub duplicates_coalesced: AtomicU64,
    pub fingerprint_conflicts: AtomicU64,
    pub rate_limited: AtomicU64,
    pub dependency_failures: AtomicU64,
    pub circuit_rejections: AtomicU64,
    pub sessions_created: AtomicU64,
    pub sessions_deleted: AtomicU64,
    pub ui_requests: AtomicU64,
    pub ui_overflows: AtomicU64,
    pub ui_timeouts: AtomicU64,
    pub events_dropped: AtomicU64,
    pub connections_closed_backpressure: AtomicU64,
    pub lock_timeouts: AtomicU64,
    pub lock_long_holds: AtomicU64,
    /// Internal invariant breaches that would otherwise be silently
    /// masked. Nonzero values are a bug.
    pub invariant_breaches: AtomicU64,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub commands_admitted: u64,
    pub commands_rejected: u64,
    pub commands_succeeded: u64,
    pub commands_failed: u64,
    pub commands_timed_out: u64,
    pub replays_served: u64,
    pub duplicates_coalesced: u64,
    pub fingerprint_conflicts: u64,
    pub rate_limited: u64,
    pub dependency_failures: u64,
    pub circuit_rejections: u64,
    pub sessions_created: u64,
    pub sessions_deleted: u64,
    pub ui_requests: u64,
    pub ui_overflows: u64,
    pub ui_timeouts: u64,
    pub events_dropped: u64,
    pub connections_closed_backpressure: u64,
    pub lock_timeouts: u64,
    pub lock_long_holds: u64,
    pub invariant_breaches: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an internal invariant breach with a log line; callers
    /// pass the site so breaches are attributable.
    pub fn breach(&self, site: &str) {
        self.invariant_breaches.fetch_add(1, Ordering::Relaxed);
        tracing::error!(site, "internal invariant breached");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            commands_admitted: self.commands_admitted.load(Ordering::Relaxed),
            commands_rejected: self.commands_rejected.load(Ordering::Relaxed),
            commands_succeeded: self.commands_succeeded.load(Ordering::Relaxed),
            commands_failed: self.commands_failed.load(Ordering::Relaxed),
            commands_timed_out: self.commands_timed_out.load(Ordering::Relaxed),
            replays_served: self.replays_served.load(Ordering::Relaxed),
            duplicates_coalesced: self.duplicates_coalesced.load(Ordering::Relaxed),
            fingerprint_conflicts: self.fingerprint_conflicts.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            dependency_failures: self.dependency_failures.load(Ordering::Relaxed),
            circuit_rejections: self.circuit_rejections.load(Ordering::Relaxed),
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_deleted: self.sessions_deleted.load(Ordering::Relaxed),
            ui_requests: self.ui_requests.load(Ordering::Relaxed),
            ui_overflows: self.ui_overflows.load(Ordering::Relaxed),
            ui_timeouts: self.ui_timeouts.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            connections_closed_backpressure: self
                .connections_closed_backpressure
                .load(Ordering::Relaxed),
            lock_timeouts: self.lock_timeouts.load(Ordering::Relaxed),
            lock_long_holds: self.lock_long_holds.load(Ordering::Relaxed),
            invariant_breaches: self.invariant_breaches.load(Ordering::Relaxed),
        }
    }
}
