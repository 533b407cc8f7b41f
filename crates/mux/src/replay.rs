// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Replay store: terminal outcomes by command ID, idempotency-key
//! entries with TTL, and in-flight reservations for duplicate
//! coalescing.
//!
//! Outcomes are written before the handler returns and are immutable
//! afterwards; a stored timeout is a terminal outcome like any other.
//! The in-flight table is never evicted to make room — a full table
//! rejects new unique IDs, because evicting would break `dependsOn`
//! graphs that reference the evicted command.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;

use crate::error::{CommandError, ErrorKind};
use crate::protocol::{Command, Response};

/// A stored terminal outcome.
#[derive(Debug, Clone)]
pub struct ReplayEntry {
    pub fingerprint: String,
    pub response: Response,
    pub completed_at: Instant,
}

struct IdemEntry {
    fingerprint: String,
    response: Response,
    expires_at: Instant,
}

struct InFlight {
    fingerprint: String,
    lane: String,
    lane_seq: u64,
    tx: watch::Sender<Option<Response>>,
}

/// Result of the admission-time replay consultation.
pub enum ReplayCheck {
    /// A stored outcome exists; serve it without re-executing.
    Hit(Response),
    /// Same retry identity, different semantics; never re-execute.
    Conflict(CommandError),
    Miss,
}

/// Result of reserving an explicit command ID for execution.
pub enum Reservation {
    /// Reserved; the caller owns execution and must store the outcome.
    New,
    /// The same command is already executing; await its outcome.
    Joined(watch::Receiver<Option<Response>>),
    /// Completed between check and reserve; serve the stored outcome.
    Completed(Response),
    Conflict(CommandError),
    /// Reservation table at capacity; reject, never evict.
    Full,
}

/// Dependency lookup for `dependsOn` resolution.
pub enum DepStatus {
    Done(Response),
    InFlight { lane: String, lane_seq: u64, rx: watch::Receiver<Option<Response>> },
    Unknown,
}

/// Observability counts for `get_metrics`.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplayStats {
    pub stored_outcomes: usize,
    pub idempotency_entries: usize,
    pub in_flight: usize,
}

struct Inner {
    /// Completion-ordered outcomes; front is oldest and evicted first.
    by_id: IndexMap<String, ReplayEntry>,
    idempotency: HashMap<(String, String), IdemEntry>,
    in_flight: HashMap<String, InFlight>,
}

pub struct ReplayStore {
    inner: Mutex<Inner>,
    max_outcomes: usize,
    max_in_flight: usize,
    idempotency_ttl: Duration,
}

impl ReplayStore {
    pub fn new(max_outcomes: usize, max_in_flight: usize, idempotency_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                by_id: IndexMap::new(),
                idempotency: HashMap::new(),
                in_flight: HashMap::new(),
            }),
            max_outcomes,
            max_in_flight,
            idempotency_ttl,
        }
    }

    /// Consult stored outcomes for this command's retry identity.
    ///
    /// An ID match wins over an idempotency-key match; either kind of
    /// match with a differing fingerprint is a conflict, not a miss.
    pub fn check(&self, cmd: &Command, fingerprint: &str) -> ReplayCheck {
        let mut inner = self.inner.lock();

        if let Some(ref id) = cmd.id {
            if let Some(entry) = inner.by_id.get(id) {
                if entry.fingerprint == fingerprint {
                    let mut resp = entry.response.replay();
                    resp.id = cmd.id.clone();
                    return ReplayCheck::Hit(resp);
                }
                return ReplayCheck::Conflict(CommandError::new(
                    ErrorKind::FingerprintConflict,
                    format!("fingerprint conflict: id {id} was used with a different payload"),
                ));
            }
        }

        if let Some(ref key) = cmd.idempotency_key {
            let scope_key = (cmd.scope().to_owned(), key.clone());
            enum Idem {
                Expired,
                Hit(Response),
                Conflict,
                Miss,
            }
            let found = match inner.idempotency.get(&scope_key) {
                Some(entry) if entry.expires_at <= Instant::now() => Idem::Expired,
                Some(entry) if entry.fingerprint == fingerprint => {
                    Idem::Hit(entry.response.clone())
                }
                Some(_) => Idem::Conflict,
                None => Idem::Miss,
            };
            match found {
                Idem::Expired => {
                    inner.idempotency.remove(&scope_key);
                }
                Idem::Hit(stored) => {
                    let mut resp = stored.replay();
                    resp.id = cmd.id.clone();
                    return ReplayCheck::Hit(resp);
                }
                Idem::Conflict => {
                    return ReplayCheck::Conflict(CommandError::new(
                        ErrorKind::IdempotencyConflict,
                        format!(
                            "fingerprint conflict: idempotency key {key} was used with a \
                             different payload"
                        ),
                    ));
                }
                Idem::Miss => {}
            }
        }

        ReplayCheck::Miss
    }

    /// Reserve an explicit (non-synthetic) command ID for execution.
    ///
    /// `lane`/`lane_seq` record where the execution was enqueued so
    /// dependents can detect same-lane inversion.
    pub fn reserve(&self, id: &str, fingerprint: &str, lane: &str, lane_seq: u64) -> Reservation {
        let mut inner = self.inner.lock();

        if let Some(existing) = inner.in_flight.get(id) {
            if existing.fingerprint == fingerprint {
                return Reservation::Joined(existing.tx.subscribe());
            }
            return Reservation::Conflict(CommandError::new(
                ErrorKind::FingerprintConflict,
                format!("fingerprint conflict: id {id} is in flight with a different payload"),
            ));
        }

        // A duplicate may have completed between check and reserve.
        if let Some(entry) = inner.by_id.get(id) {
            if entry.fingerprint == fingerprint {
                return Reservation::Completed(entry.response.replay());
            }
            return Reservation::Conflict(CommandError::new(
                ErrorKind::FingerprintConflict,
                format!("fingerprint conflict: id {id} was used with a different payload"),
            ));
        }

        if inner.in_flight.len() >= self.max_in_flight {
            return Reservation::Full;
        }

        let (tx, _rx) = watch::channel(None);
        inner.in_flight.insert(
            id.to_owned(),
            InFlight { fingerprint: fingerprint.to_owned(), lane: lane.to_owned(), lane_seq, tx },
        );
        Reservation::New
    }

    /// Store a terminal outcome and resolve any coalesced waiters.
    ///
    /// First write wins: a late completion arriving after a stored
    /// timeout is discarded, preserving replay determinism.
    pub fn store_outcome(&self, cmd: &Command, fingerprint: &str, response: &Response) {
        let mut inner = self.inner.lock();

        if let Some(ref id) = cmd.id {
            if let Some(existing) = inner.by_id.get(id) {
                tracing::warn!(
                    command_id = %id,
                    timed_out = existing.response.timed_out.unwrap_or(false),
                    "discarding late outcome for already-terminal command"
                );
                return;
            }
            inner.by_id.insert(
                id.clone(),
                ReplayEntry {
                    fingerprint: fingerprint.to_owned(),
                    response: response.clone(),
                    completed_at: Instant::now(),
                },
            );
            while inner.by_id.len() > self.max_outcomes {
                inner.by_id.shift_remove_index(0);
            }
            if let Some(inflight) = inner.in_flight.remove(id) {
                let _ = inflight.tx.send(Some(response.clone()));
            }
        }

        if let Some(ref key) = cmd.idempotency_key {
            inner.idempotency.insert(
                (cmd.scope().to_owned(), key.clone()),
                IdemEntry {
                    fingerprint: fingerprint.to_owned(),
                    response: response.clone(),
                    expires_at: Instant::now() + self.idempotency_ttl,
                },
            );
        }
    }

    /// Resolve a `dependsOn` target.
    pub fn dep_status(&self, id: &str) -> DepStatus {
        let inner = self.inner.lock();
        if let Some(entry) = inner.by_id.get(id) {
            return DepStatus::Done(entry.response.clone());
        }
        if let Some(inflight) = inner.in_flight.get(id) {
            return DepStatus::InFlight {
                lane: inflight.lane.clone(),
                lane_seq: inflight.lane_seq,
                rx: inflight.tx.subscribe(),
            };
        }
        DepStatus::Unknown
    }

    /// Remove expired idempotency entries; called by the sweeper.
    pub fn prune_idempotency(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let before = inner.idempotency.len();
        inner.idempotency.retain(|_, entry| entry.expires_at > now);
        before - inner.idempotency.len()
    }

    pub fn stats(&self) -> ReplayStats {
        let inner = self.inner.lock();
        ReplayStats {
            stored_outcomes: inner.by_id.len(),
            idempotency_entries: inner.idempotency.len(),
            in_flight: inner.in_flight.len(),
        }
    }
}

#[cfg(test)]
#[path = "replay_tests.rs"]
mod tests;
