// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;

use super::*;
use crate::metrics::Metrics;

/// Sink that records fanned-out events for inspection.
#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<(String, serde_json::Value)>>,
}

impl SessionEventSink for RecordingSink {
    fn send_session_event(&self, session_id: &str, event: serde_json::Value) {
        self.events.lock().push((session_id.to_owned(), event));
    }
}

fn broker(max: usize, timeout_ms: u64) -> UiBroker {
    UiBroker::new(max, Duration::from_millis(timeout_ms), Arc::new(Metrics::new()))
}

#[tokio::test]
async fn round_trip_resolves_pending_request() {
    let broker = Arc::new(broker(10, 1_000));
    let sink = Arc::new(RecordingSink::default());

    let requester = {
        let broker = Arc::clone(&broker);
        let sink = Arc::clone(&sink);
        tokio::spawn(async move {
            broker.request(sink.as_ref(), "s1", "select", json!({ "options": ["a", "b"] })).await
        })
    };

    // Wait for the broadcast, then answer it by requestId.
    let request_id = loop {
        if let Some((session, event)) = sink.events.lock().first().cloned() {
            assert_eq!(session, "s1");
            assert_eq!(event["type"], "extension_ui_request");
            assert_eq!(event["method"], "select");
            if let Some(id) = event["requestId"].as_str() {
                break id.to_owned();
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    assert!(request_id.starts_with("s1:"));

    assert!(broker.resolve(&request_id, UiOutcome::Value(json!("b"))));
    let outcome = requester.await.ok().flatten();
    assert_eq!(outcome, Some(UiOutcome::Value(json!("b"))));
    assert_eq!(broker.pending_count(), 0);
}

#[tokio::test]
async fn overflow_degrades_to_none() {
    let broker = Arc::new(broker(0, 1_000));
    let sink = RecordingSink::default();

    let outcome = broker.request(&sink, "s1", "confirm", json!({})).await;
    assert!(outcome.is_none());
    // Nothing was broadcast for the refused request.
    assert!(sink.events.lock().is_empty());
}

#[tokio::test]
async fn timeout_fails_pending_entry_deterministically() {
    let broker = Arc::new(broker(10, 30));
    let sink = RecordingSink::default();

    let outcome = broker.request(&sink, "s1", "input", json!({})).await;
    assert!(outcome.is_none());
    assert_eq!(broker.pending_count(), 0);
}

#[tokio::test]
async fn unknown_request_id_resolves_nothing() {
    let broker = broker(10, 1_000);
    assert!(!broker.resolve("s1:123:abc", UiOutcome::Cancelled));
}

#[tokio::test]
async fn cancelled_outcome_passes_through() {
    let broker = Arc::new(broker(10, 1_000));
    let sink = Arc::new(RecordingSink::default());

    let requester = {
        let broker = Arc::clone(&broker);
        let sink = Arc::clone(&sink);
        tokio::spawn(
            async move { broker.request(sink.as_ref(), "s1", "editor", json!({})).await },
        )
    };

    let request_id = loop {
        let recorded = sink.events.lock().first().cloned();
        if let Some((_, event)) = recorded {
            if let Some(id) = event["requestId"].as_str() {
                break id.to_owned();
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };

    assert!(broker.resolve(&request_id, UiOutcome::Cancelled));
    assert_eq!(requester.await.ok().flatten(), Some(UiOutcome::Cancelled));
}
