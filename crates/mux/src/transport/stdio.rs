// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Stdio transport: newline-delimited JSON objects on stdin/stdout.
//! Same dispatch as the WebSocket transport; only the framing differs.
//! Local pipes have no silent-zombie problem, so no heartbeat runs.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::protocol::{ServerMessage, ServerReadyData};
use crate::transport::dispatch_frame;
use crate::MuxState;

/// Serve one connection over stdin/stdout until EOF or shutdown.
pub async fn run_stdio(state: Arc<MuxState>) {
    if !state.governor.try_add_connection() {
        tracing::warn!("connection limit reached; stdio transport disabled");
        return;
    }

    let (conn, mut frame_rx) = state.connections.register(Arc::clone(&state.metrics));

    // Writer: queued frames to stdout, one JSON object per line.
    let writer_conn = Arc::clone(&conn);
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(text) = frame_rx.recv().await {
            let bytes = text.len();
            let failed = stdout.write_all(text.as_bytes()).await.is_err()
                || stdout.write_all(b"\n").await.is_err()
                || stdout.flush().await.is_err();
            writer_conn.drained(bytes);
            if failed {
                writer_conn.closed.cancel();
                break;
            }
        }
    });

    // Lifecycle events route through the same backpressure path.
    let hub_conn = Arc::clone(&conn);
    let hub_state = Arc::clone(&state);
    let hub_task = tokio::spawn(async move {
        let mut hub_rx = hub_state.hub.subscribe();
        loop {
            tokio::select! {
                _ = hub_conn.closed.cancelled() => break,
                event = hub_rx.recv() => {
                    match event {
                        Ok(msg) => hub_conn.send(&msg),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
    });

    conn.send(&ServerMessage::ServerReady { data: ServerReadyData::current() });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = conn.closed.cancelled() => break,
            _ = state.shutdown.cancelled() => break,
            line = lines.next_line() => {
                match line {
                    Ok(Some(text)) => {
                        let trimmed = text.trim();
                        if !trimmed.is_empty() {
                            dispatch_frame(&state, &conn, trimmed);
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
        }
    }

    conn.closed.cancel();
    writer.abort();
    hub_task.abort();
    state.connections.unregister(conn.id);
    state.registry.drop_connection(conn.id);
    state.governor.remove_connection();
}
