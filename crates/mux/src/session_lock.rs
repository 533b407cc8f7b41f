// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-session-ID mutex used around create/delete only, never around
//! command execution. Eliminates create/delete races on the same ID.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{CommandError, ErrorKind};
use crate::metrics::Metrics;

/// Acquisition wait budget.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Holds longer than this are reported via metrics.
const LONG_HOLD: Duration = Duration::from_secs(30);

/// Waiters allowed per session ID; the newest waiter beyond this is
/// rejected.
const MAX_WAITERS: usize = 8;

struct LockEntry {
    sem: Arc<Semaphore>,
    waiters: AtomicUsize,
}

/// Guard returned by [`SessionLockMap::acquire`]; releases on drop and
/// reports long holds.
pub struct SessionLockGuard {
    _permit: OwnedSemaphorePermit,
    acquired_at: Instant,
    session_id: String,
    metrics: Arc<Metrics>,
}

impl Drop for SessionLockGuard {
    fn drop(&mut self) {
        let held = self.acquired_at.elapsed();
        if held >= LONG_HOLD {
            Metrics::incr(&self.metrics.lock_long_holds);
            tracing::warn!(
                session_id = %self.session_id,
                held_ms = held.as_millis() as u64,
                "session lock held past reporting threshold"
            );
        }
    }
}

/// Per-session-ID locks for registry mutations.
pub struct SessionLockMap {
    locks: Mutex<HashMap<String, Arc<LockEntry>>>,
    metrics: Arc<Metrics>,
}

impl SessionLockMap {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self { locks: Mutex::new(HashMap::new()), metrics }
    }

    /// Acquire the lock for `session_id`, waiting up to 5 s. A full
    /// wait queue rejects this (newest) waiter immediately.
    pub async fn acquire(&self, session_id: &str) -> Result<SessionLockGuard, CommandError> {
        let entry = {
            let mut locks = self.locks.lock();
            Arc::clone(locks.entry(session_id.to_owned()).or_insert_with(|| {
                Arc::new(LockEntry {
                    sem: Arc::new(Semaphore::new(1)),
                    waiters: AtomicUsize::new(0),
                })
            }))
        };

        if entry.waiters.fetch_add(1, Ordering::AcqRel) >= MAX_WAITERS {
            entry.waiters.fetch_sub(1, Ordering::AcqRel);
            return Err(CommandError::new(
                ErrorKind::HandlerError,
                format!("too many queued operations on session {session_id}"),
            ));
        }

        let acquired =
            tokio::time::timeout(ACQUIRE_TIMEOUT, Arc::clone(&entry.sem).acquire_owned()).await;
        entry.waiters.fetch_sub(1, Ordering::AcqRel);

        match acquired {
            Ok(Ok(permit)) => Ok(SessionLockGuard {
                _permit: permit,
                acquired_at: Instant::now(),
                session_id: session_id.to_owned(),
                metrics: Arc::clone(&self.metrics),
            }),
            Ok(Err(_)) | Err(_) => {
                Metrics::incr(&self.metrics.lock_timeouts);
                Err(CommandError::new(
                    ErrorKind::HandlerError,
                    format!("timed out waiting for session lock {session_id}"),
                ))
            }
        }
    }

    /// Drop entries whose lock is free; called by the sweeper.
    pub fn prune_idle(&self) {
        let mut locks = self.locks.lock();
        locks.retain(|_, entry| {
            entry.sem.available_permits() == 0 || entry.waiters.load(Ordering::Acquire) > 0
        });
    }
}

#[cfg(test)]
#[path = "session_lock_tests.rs"]
mod tests;
