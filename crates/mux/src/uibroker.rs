// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Extension UI broker — correlates server-initiated prompts with the
//! eventual `extension_ui_response` command.
//!
//! A pending entry is private to the broker; callers only see
//! `request` and `resolve`. The table is bounded: overflow returns
//! `None` so the agent can degrade to a sensible default instead of
//! blocking.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::oneshot;

use crate::metrics::Metrics;

/// How a pending UI request ended.
#[derive(Debug, Clone, PartialEq)]
pub enum UiOutcome {
    Value(serde_json::Value),
    Cancelled,
}

/// Fan a session-scoped event out to the session's subscribers.
/// Implemented by the session registry; kept as a seam so the broker
/// has no registry dependency.
pub trait SessionEventSink: Send + Sync {
    fn send_session_event(&self, session_id: &str, event: serde_json::Value);
}

/// Pending-request table. One per server.
pub struct UiBroker {
    pending: Mutex<HashMap<String, oneshot::Sender<UiOutcome>>>,
    max_pending: usize,
    request_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl UiBroker {
    pub fn new(max_pending: usize, request_timeout: Duration, metrics: Arc<Metrics>) -> Self {
        Self { pending: Mutex::new(HashMap::new()), max_pending, request_timeout, metrics }
    }

    /// Broadcast an `extension_ui_request` to the session's
    /// subscribers and await the correlated response.
    ///
    /// Returns `None` when the table is full or the round trip times
    /// out; the caller degrades to its default.
    pub async fn request(
        &self,
        sink: &dyn SessionEventSink,
        session_id: &str,
        method: &str,
        payload: serde_json::Value,
    ) -> Option<UiOutcome> {
        let request_id = format!(
            "{session_id}:{}:{}",
            crate::epoch_ms(),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if pending.len() >= self.max_pending {
                Metrics::incr(&self.metrics.ui_overflows);
                tracing::warn!(session_id, method, "pending UI table full; degrading");
                return None;
            }
            pending.insert(request_id.clone(), tx);
        }
        Metrics::incr(&self.metrics.ui_requests);

        let mut event = json!({
            "type": "extension_ui_request",
            "requestId": request_id,
            "method": method,
        });
        if let (Some(obj), Some(extra)) = (event.as_object_mut(), payload.as_object()) {
            for (k, v) in extra {
                obj.insert(k.clone(), v.clone());
            }
        }
        sink.send_session_event(session_id, event);

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(outcome)) => Some(outcome),
            Ok(Err(_)) => None,
            Err(_) => {
                self.pending.lock().remove(&request_id);
                Metrics::incr(&self.metrics.ui_timeouts);
                tracing::debug!(session_id, request_id = %request_id, "UI request timed out");
                None
            }
        }
    }

    /// Resolve a pending request from an `extension_ui_response`
    /// command. Returns false for unknown (or already-resolved)
    /// request IDs.
    pub fn resolve(&self, request_id: &str, outcome: UiOutcome) -> bool {
        let Some(tx) = self.pending.lock().remove(request_id) else {
            return false;
        };
        tx.send(outcome).is_ok()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

// -- Per-session context ------------------------------------------------------

/// The UI entry points bound into one agent session at create time.
pub struct UiContext {
    broker: Arc<UiBroker>,
    sink: Arc<dyn SessionEventSink>,
    session_id: String,
}

impl UiContext {
    pub fn new(broker: Arc<UiBroker>, sink: Arc<dyn SessionEventSink>, session_id: &str) -> Self {
        Self { broker, sink, session_id: session_id.to_owned() }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn round_trip(&self, method: &str, payload: serde_json::Value) -> Option<UiOutcome> {
        self.broker.request(self.sink.as_ref(), &self.session_id, method, payload).await
    }

    /// Ask the user to pick one of `options`; `None` means degraded or
    /// cancelled and the agent should use its default.
    pub async fn select(&self, prompt: &str, options: &[String]) -> Option<serde_json::Value> {
        match self.round_trip("select", json!({ "prompt": prompt, "options": options })).await {
            Some(UiOutcome::Value(v)) => Some(v),
            _ => None,
        }
    }

    pub async fn confirm(&self, prompt: &str) -> Option<bool> {
        match self.round_trip("confirm", json!({ "prompt": prompt })).await {
            Some(UiOutcome::Value(v)) => v.as_bool(),
            _ => None,
        }
    }

    pub async fn input(&self, prompt: &str) -> Option<String> {
        match self.round_trip("input", json!({ "prompt": prompt })).await {
            Some(UiOutcome::Value(v)) => v.as_str().map(str::to_owned),
            _ => None,
        }
    }

    pub async fn editor(&self, initial: &str) -> Option<String> {
        match self.round_trip("editor", json!({ "initial": initial })).await {
            Some(UiOutcome::Value(v)) => v.as_str().map(str::to_owned),
            _ => None,
        }
    }

    pub async fn interview(&self, questions: serde_json::Value) -> Option<serde_json::Value> {
        match self.round_trip("interview", json!({ "questions": questions })).await {
            Some(UiOutcome::Value(v)) => Some(v),
            _ => None,
        }
    }
}

#[cfg(test)]
#[path = "uibroker_tests.rs"]
mod tests;
