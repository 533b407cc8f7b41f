// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test infrastructure: state builders and submission helpers
//! used by unit tests and the scenario suite in tests/specs.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::backend::EchoBackend;
use crate::config::MuxConfig;
use crate::engine::Submission;
use crate::error::{CommandError, ErrorKind};
use crate::protocol::Response;
use crate::transport::ConnHandle;
use crate::{build_state, MuxState};

/// Config tuned for fast tests: short budgets, small tables.
pub fn test_config() -> MuxConfig {
    MuxConfig {
        short_timeout_ms: 500,
        long_timeout_ms: 1_000,
        dep_wait_timeout_ms: 1_000,
        ui_request_timeout_ms: 1_000,
        drain_timeout_ms: 1_000,
        ..MuxConfig::default()
    }
}

/// Build server state over the echo backend, no transports attached.
pub fn echo_state(config: MuxConfig) -> Arc<MuxState> {
    build_state(config, Arc::new(EchoBackend))
}

/// Register a loopback connection; the receiver observes every frame
/// the server queues for it.
pub fn loopback(state: &Arc<MuxState>) -> (Arc<ConnHandle>, mpsc::UnboundedReceiver<String>) {
    state.connections.register(Arc::clone(&state.metrics))
}

/// Validate and submit one raw frame, awaiting the terminal response.
pub async fn submit(
    state: &Arc<MuxState>,
    conn: &Arc<ConnHandle>,
    frame: serde_json::Value,
) -> Response {
    let text = frame.to_string();
    let admitted = match crate::validate::validate(&text) {
        Ok(admitted) => admitted,
        Err(rejected) => {
            let command = rejected.command_type.as_deref().unwrap_or("unknown");
            return Response::fail(command, rejected.id.clone(), &rejected.error);
        }
    };
    match state.engine.submit(Arc::clone(conn), admitted) {
        Submission::Ready(resp) => resp,
        Submission::Pending(rx) => rx.await.unwrap_or_else(|_| {
            Response::fail(
                "unknown",
                None,
                &CommandError::new(ErrorKind::HandlerError, "pipeline dropped the response"),
            )
        }),
    }
}

/// Create a session and return its create response.
pub async fn create_session(
    state: &Arc<MuxState>,
    conn: &Arc<ConnHandle>,
    session_id: &str,
) -> Response {
    submit(
        state,
        conn,
        serde_json::json!({ "type": "create_session", "sessionId": session_id }),
    )
    .await
}
