// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket transport: upgrade, handshake, heartbeat, and the
//! per-connection read/write loops.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;

use crate::metrics::Metrics;
use crate::protocol::{ServerMessage, ServerReadyData};
use crate::transport::{auth, dispatch_frame};
use crate::MuxState;

/// Query parameters for the WebSocket upgrade.
#[derive(Debug, Clone, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// `GET /ws` — upgrade one client connection.
pub async fn ws_handler(
    State(state): State<Arc<MuxState>>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if !auth::validate_ws_token(query.token.as_deref(), state.config.auth_token.as_deref()) {
        return axum::http::Response::builder()
            .status(401)
            .body(axum::body::Body::from("unauthorized"))
            .unwrap_or_default()
            .into_response();
    }
    // Shutdown stops accepting before anything else; refuse the
    // upgrade while existing connections drain.
    if !state.accepting.load(Ordering::Acquire) {
        return axum::http::Response::builder()
            .status(503)
            .body(axum::body::Body::from("shutting down"))
            .unwrap_or_default()
            .into_response();
    }
    if !state.governor.try_add_connection() {
        return axum::http::Response::builder()
            .status(503)
            .body(axum::body::Body::from("connection limit reached"))
            .unwrap_or_default()
            .into_response();
    }

    ws.on_upgrade(move |socket| handle_connection(state, socket)).into_response()
}

/// Per-connection loop. The governor slot was reserved by the upgrade
/// handler and is released on exit.
async fn handle_connection(state: Arc<MuxState>, socket: WebSocket) {
    let (conn, frame_rx) = state.connections.register(Arc::clone(&state.metrics));
    let (ws_tx, mut ws_rx) = socket.split();

    // Pong receipts observed by the read loop, checked by the writer's
    // heartbeat.
    let last_pong = Arc::new(std::sync::atomic::AtomicU64::new(crate::epoch_ms()));

    let writer = tokio::spawn(write_loop(
        Arc::clone(&state),
        Arc::clone(&conn),
        ws_tx,
        frame_rx,
        Arc::clone(&last_pong),
    ));

    conn.send(&ServerMessage::ServerReady { data: ServerReadyData::current() });

    loop {
        tokio::select! {
            _ = conn.closed.cancelled() => break,
            _ = state.shutdown.cancelled() => break,
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        dispatch_frame(&state, &conn, &text);
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong.store(crate::epoch_ms(), Ordering::Release);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    conn.closed.cancel();
    writer.abort();
    state.connections.unregister(conn.id);
    state.registry.drop_connection(conn.id);
    state.governor.remove_connection();
}

/// Writer half: drains queued frames, runs the heartbeat, and evicts
/// the connection when a pong misses its deadline.
async fn write_loop(
    state: Arc<MuxState>,
    conn: Arc<crate::transport::ConnHandle>,
    mut ws_tx: futures_util::stream::SplitSink<WebSocket, Message>,
    mut frame_rx: tokio::sync::mpsc::UnboundedReceiver<String>,
    last_pong: Arc<std::sync::atomic::AtomicU64>,
) {
    let mut hub_rx = state.hub.subscribe();
    let mut heartbeat = tokio::time::interval(state.config.heartbeat_interval());
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // First tick fires immediately; skip it so the first ping waits a
    // full interval after the handshake.
    heartbeat.tick().await;
    let mut ping_sent_ms: Option<u64> = None;
    let mut pong_deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = conn.closed.cancelled() => break,

            frame = frame_rx.recv() => {
                let Some(text) = frame else { break };
                let bytes = text.len();
                let result = ws_tx.send(Message::Text(text.into())).await;
                conn.drained(bytes);
                if result.is_err() {
                    conn.closed.cancel();
                    break;
                }
            }

            event = hub_rx.recv() => {
                match event {
                    Ok(msg) => conn.send(&msg),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        Metrics::incr(&state.metrics.events_dropped);
                        tracing::debug!(conn_id = conn.id, skipped, "lifecycle stream lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }

            _ = heartbeat.tick() => {
                if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                    conn.closed.cancel();
                    break;
                }
                ping_sent_ms = Some(crate::epoch_ms());
                pong_deadline = Some(Instant::now() + state.config.pong_deadline());
            }

            _ = deadline_sleep(pong_deadline) => {
                let responded = ping_sent_ms
                    .is_some_and(|sent| last_pong.load(Ordering::Acquire) >= sent);
                if responded {
                    pong_deadline = None;
                } else {
                    tracing::info!(conn_id = conn.id, "no pong within deadline; evicting");
                    conn.closed.cancel();
                    break;
                }
            }
        }
    }

    let _ = ws_tx.send(Message::Close(None)).await;
}

/// Sleep until the pong deadline, or forever when no ping is pending.
async fn deadline_sleep(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at.into()).await,
        None => std::future::pending().await,
    }
}
