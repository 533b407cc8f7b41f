// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Resource governor: sliding-window rate limits, session-slot and
//! connection accounting, and the background sweeper.
//!
//! Window entries are stamped with a per-window generation counter so
//! a rollback removes exactly the entry it added, even if a concurrent
//! prune trimmed neighbors in between.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::{CommandError, ErrorKind};
use crate::metrics::Metrics;
use crate::MuxState;

/// Rate-limit window length. Limits are configured per minute.
const WINDOW: Duration = Duration::from_secs(60);

/// Scope key for the server-wide window.
const GLOBAL_SCOPE: &str = "global";

#[derive(Debug, Clone, Copy)]
struct Stamp {
    at: Instant,
    gen: u64,
}

#[derive(Default)]
struct Window {
    stamps: VecDeque<Stamp>,
    next_gen: u64,
}

impl Window {
    fn prune(&mut self, now: Instant) {
        while self.stamps.front().is_some_and(|s| now.duration_since(s.at) >= WINDOW) {
            self.stamps.pop_front();
        }
    }

    fn stamp(&mut self, now: Instant) -> u64 {
        self.next_gen += 1;
        let gen = self.next_gen;
        self.stamps.push_back(Stamp { at: now, gen });
        gen
    }

    fn remove_gen(&mut self, gen: u64) {
        if let Some(pos) = self.stamps.iter().position(|s| s.gen == gen) {
            self.stamps.remove(pos);
        }
    }
}

/// Observability counts for `get_metrics`.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GovernorStats {
    pub active_windows: usize,
    pub session_slots_used: usize,
    pub connections: usize,
}

pub struct Governor {
    windows: Mutex<HashMap<String, Window>>,
    session_slots: Mutex<usize>,
    connections: Mutex<usize>,
    per_scope_limit: usize,
    global_limit: usize,
    max_sessions: usize,
    max_connections: usize,
    metrics: Arc<Metrics>,
}

impl Governor {
    pub fn new(
        per_scope_limit: usize,
        global_limit: usize,
        max_sessions: usize,
        max_connections: usize,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            session_slots: Mutex::new(0),
            connections: Mutex::new(0),
            per_scope_limit,
            global_limit,
            max_sessions,
            max_connections,
            metrics,
        }
    }

    /// Charge one new execution against `scope` and the global window.
    ///
    /// On refusal the stamps this call added are removed again (by
    /// generation, not by position) and an error is returned. Replays
    /// never reach this point; they are free.
    pub fn try_charge(&self, scope: &str) -> Result<(), CommandError> {
        let now = Instant::now();
        let mut windows = self.windows.lock();

        let scope_window = windows.entry(scope.to_owned()).or_default();
        scope_window.prune(now);
        let scope_gen = scope_window.stamp(now);
        if scope_window.stamps.len() > self.per_scope_limit {
            scope_window.remove_gen(scope_gen);
            return Err(CommandError::new(
                ErrorKind::RateLimited,
                format!("rate limit exceeded for {scope}: {} per minute", self.per_scope_limit),
            ));
        }

        let global_window = windows.entry(GLOBAL_SCOPE.to_owned()).or_default();
        global_window.prune(now);
        let global_gen = global_window.stamp(now);
        if global_window.stamps.len() > self.global_limit {
            global_window.remove_gen(global_gen);
            if let Some(scope_window) = windows.get_mut(scope) {
                scope_window.remove_gen(scope_gen);
            }
            return Err(CommandError::new(
                ErrorKind::RateLimited,
                format!("global rate limit exceeded: {} per minute", self.global_limit),
            ));
        }

        Ok(())
    }

    /// Atomic check-and-reserve of one session slot.
    pub fn try_reserve_session_slot(&self) -> Result<(), CommandError> {
        let mut used = self.session_slots.lock();
        if *used >= self.max_sessions {
            return Err(CommandError::new(
                ErrorKind::SessionSlotsExhausted,
                format!("session limit reached ({})", self.max_sessions),
            ));
        }
        *used += 1;
        Ok(())
    }

    pub fn release_session_slot(&self) {
        let mut used = self.session_slots.lock();
        if *used == 0 {
            self.metrics.breach("governor.release_session_slot");
            return;
        }
        *used -= 1;
    }

    pub fn try_add_connection(&self) -> bool {
        let mut count = self.connections.lock();
        if *count >= self.max_connections {
            return false;
        }
        *count += 1;
        true
    }

    pub fn remove_connection(&self) {
        let mut count = self.connections.lock();
        if *count == 0 {
            self.metrics.breach("governor.remove_connection");
            return;
        }
        *count -= 1;
    }

    pub fn connection_count(&self) -> usize {
        *self.connections.lock()
    }

    /// Drop expired stamps and empty windows; called by the sweeper.
    pub fn prune_windows(&self) {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        for window in windows.values_mut() {
            window.prune(now);
        }
        windows.retain(|_, w| !w.stamps.is_empty());
    }

    pub fn stats(&self) -> GovernorStats {
        GovernorStats {
            active_windows: self.windows.lock().len(),
            session_slots_used: *self.session_slots.lock(),
            connections: *self.connections.lock(),
        }
    }
}

/// Spawn the periodic sweeper: prunes rate windows and idempotency
/// entries, and enforces the max session lifetime by deleting overage
/// sessions. The task observes the shutdown token and never pins
/// process exit.
pub fn spawn_sweeper(state: Arc<MuxState>) {
    let interval = state.config.sweep_interval();
    let max_lifetime = state.config.max_session_lifetime();

    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = state.shutdown.cancelled() => break,
                _ = timer.tick() => {}
            }

            state.governor.prune_windows();
            let pruned = state.engine.replay.prune_idempotency();
            if pruned > 0 {
                tracing::debug!(pruned, "expired idempotency entries removed");
            }

            state.manager.prune_locks();

            if let Some(limit) = max_lifetime {
                for session_id in state.manager.sessions_older_than(limit) {
                    tracing::info!(session_id = %session_id, "max session lifetime exceeded");
                    if let Err(e) = state.manager.delete_session(&session_id).await {
                        tracing::warn!(session_id = %session_id, err = %e, "lifetime delete failed");
                    }
                }
            }
        }
    });
}

#[cfg(test)]
#[path = "governor_tests.rs"]
mod tests;
