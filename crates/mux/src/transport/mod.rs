// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Transports: connection registry, byte-counted backpressure, and the
//! shared dispatch path both framings feed into.

pub mod auth;
pub mod stdio;
pub mod ws;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::engine::Submission;
use crate::error::{CommandError, ErrorKind};
use crate::metrics::Metrics;
use crate::protocol::{Response, ServerMessage};
use crate::validate;
use crate::MuxState;

/// Buffered bytes below which everything is sent.
const SOFT_LIMIT: usize = 64 * 1024;

/// Buffered bytes above which the connection is closed.
const HARD_LIMIT: usize = 1024 * 1024;

pub type ConnId = u64;

/// One client connection, transport-agnostic. Frames are queued as
/// serialized strings; the owning writer task drains the queue and
/// returns the byte count.
pub struct ConnHandle {
    pub id: ConnId,
    tx: mpsc::UnboundedSender<String>,
    buffered: AtomicUsize,
    pub closed: CancellationToken,
    metrics: Arc<Metrics>,
}

impl ConnHandle {
    /// Queue a frame, applying the backpressure policy: under 64 KiB
    /// send everything; between 64 KiB and 1 MiB drop non-critical
    /// frames (events) but attempt critical ones (responses); past
    /// 1 MiB close the connection.
    pub fn send(&self, msg: &ServerMessage) {
        if self.closed.is_cancelled() {
            return;
        }
        let Ok(text) = serde_json::to_string(msg) else {
            self.metrics.breach("conn.serialize");
            return;
        };

        let buffered = self.buffered.load(Ordering::Acquire);
        if buffered > HARD_LIMIT {
            Metrics::incr(&self.metrics.connections_closed_backpressure);
            tracing::warn!(conn_id = self.id, buffered, "closing connection: send buffer overrun");
            self.closed.cancel();
            return;
        }
        if buffered >= SOFT_LIMIT && !msg.is_critical() {
            Metrics::incr(&self.metrics.events_dropped);
            return;
        }

        self.buffered.fetch_add(text.len(), Ordering::AcqRel);
        if self.tx.send(text).is_err() {
            self.closed.cancel();
        }
    }

    /// Record that the writer drained `bytes` off the queue.
    pub(crate) fn drained(&self, bytes: usize) {
        let prev = self.buffered.fetch_sub(bytes, Ordering::AcqRel);
        if prev < bytes {
            self.metrics.breach("conn.buffered_underflow");
            self.buffered.store(0, Ordering::Release);
        }
    }
}

/// Registry of live connections, used for handshake bookkeeping and
/// connection teardown.
pub struct Connections {
    map: RwLock<HashMap<ConnId, Arc<ConnHandle>>>,
    next_id: AtomicU64,
}

impl Connections {
    pub fn new() -> Self {
        Self { map: RwLock::new(HashMap::new()), next_id: AtomicU64::new(1) }
    }

    /// Create and register a handle; the caller owns the paired
    /// receiver and must call `unregister` on teardown.
    pub fn register(&self, metrics: Arc<Metrics>) -> (Arc<ConnHandle>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Arc::new(ConnHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            tx,
            buffered: AtomicUsize::new(0),
            closed: CancellationToken::new(),
            metrics,
        });
        self.map.write().insert(handle.id, Arc::clone(&handle));
        (handle, rx)
    }

    pub fn unregister(&self, id: ConnId) {
        self.map.write().remove(&id);
    }

    pub fn count(&self) -> usize {
        self.map.read().len()
    }
}

impl Default for Connections {
    fn default() -> Self {
        Self::new()
    }
}

// -- Shared inbound dispatch --------------------------------------------------

/// Handle one inbound frame: size check, validation, admission, and
/// eventual response delivery. Admission runs inline so commands from
/// one connection enter their lanes in arrival order.
pub fn dispatch_frame(state: &Arc<MuxState>, conn: &Arc<ConnHandle>, text: &str) {
    if text.len() > state.config.max_message_bytes {
        let err = CommandError::new(
            ErrorKind::MalformedFrame,
            format!("frame exceeds {} bytes", state.config.max_message_bytes),
        );
        Metrics::incr(&state.metrics.commands_rejected);
        conn.send(&ServerMessage::Response(Response::fail("unknown", None, &err)));
        return;
    }

    let admitted = match validate::validate(text) {
        Ok(admitted) => admitted,
        Err(rejected) => {
            Metrics::incr(&state.metrics.commands_rejected);
            let command = rejected.command_type.as_deref().unwrap_or("unknown");
            conn.send(&ServerMessage::Response(Response::fail(
                command,
                rejected.id.clone(),
                &rejected.error,
            )));
            return;
        }
    };

    match state.engine.submit(Arc::clone(conn), admitted) {
        Submission::Ready(response) => {
            conn.send(&ServerMessage::Response(response));
        }
        Submission::Pending(rx) => {
            let conn = Arc::clone(conn);
            tokio::spawn(async move {
                if let Ok(response) = rx.await {
                    conn.send(&ServerMessage::Response(response));
                }
            });
        }
    }
}

/// Build the axum router: the WebSocket upgrade is the whole HTTP
/// surface.
pub fn build_router(state: Arc<MuxState>) -> axum::Router {
    axum::Router::new()
        .route("/ws", axum::routing::get(ws::ws_handler))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}
