// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Lane table: per-lane strict FIFO built from chained completion
//! handles.
//!
//! Each enqueue atomically swaps the lane's tail for its own
//! completion handle and keeps the previous one to wait on. The
//! completing task clears the lane entry only if it is still the tail,
//! so a stale task can never orphan a lane that has since grown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::watch;

struct Tail {
    seq: u64,
    done: watch::Receiver<bool>,
}

/// One task's position in a lane. Obtained at admission time so lane
/// order equals arrival order; `wait_turn` suspends until the
/// predecessor finishes.
pub struct LaneTicket {
    pub lane: String,
    pub seq: u64,
    prev: Option<watch::Receiver<bool>>,
    done_tx: watch::Sender<bool>,
}

impl LaneTicket {
    /// Suspend until the predecessor on this lane has finished. A
    /// dropped predecessor handle counts as finished.
    pub async fn wait_turn(&mut self) {
        if let Some(mut prev) = self.prev.take() {
            let _ = prev.wait_for(|done| *done).await;
        }
    }

    /// Mark this task finished and clear the lane entry if this task
    /// is still the tail.
    pub fn complete(self, lanes: &Lanes) {
        let _ = self.done_tx.send(true);
        lanes.clear_if_tail(&self.lane, self.seq);
    }

    /// Give up the slot without running (admission-stage rejection).
    /// The completion signal still fires after the predecessor's, so
    /// successors keep their order.
    pub fn abandon(mut self, lanes: &std::sync::Arc<Lanes>) {
        let prev = self.prev.take();
        let lanes = std::sync::Arc::clone(lanes);
        let (lane, seq, done_tx) = (self.lane, self.seq, self.done_tx);
        tokio::spawn(async move {
            if let Some(mut prev) = prev {
                let _ = prev.wait_for(|done| *done).await;
            }
            let _ = done_tx.send(true);
            lanes.clear_if_tail(&lane, seq);
        });
    }
}

/// All live lanes. Empty lanes are removed eagerly by the completing
/// tail task; the table never needs periodic cleanup.
pub struct Lanes {
    inner: Mutex<HashMap<String, Tail>>,
    /// Global enqueue counter; lane sequence numbers are comparable
    /// across the whole process lifetime.
    next_seq: AtomicU64,
}

impl Lanes {
    pub fn new() -> Self {
        Self { inner: Mutex::new(HashMap::new()), next_seq: AtomicU64::new(1) }
    }

    /// Append to a lane's tail, returning the ticket for this slot.
    pub fn enter(&self, lane: &str) -> LaneTicket {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (done_tx, done_rx) = watch::channel(false);
        let mut inner = self.inner.lock();
        let prev = inner.insert(lane.to_owned(), Tail { seq, done: done_rx }).map(|t| t.done);
        LaneTicket { lane: lane.to_owned(), seq, prev, done_tx }
    }

    fn clear_if_tail(&self, lane: &str, seq: u64) {
        let mut inner = self.inner.lock();
        if inner.get(lane).is_some_and(|tail| tail.seq == seq) {
            inner.remove(lane);
        }
    }

    /// Number of lanes with queued or running work.
    pub fn active(&self) -> usize {
        self.inner.lock().len()
    }
}

impl Default for Lanes {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "lane_tests.rs"]
mod tests;
