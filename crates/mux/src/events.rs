// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Lifecycle event hub — fans global events out to every connected
//! client via a broadcast channel. Session-scoped agent events do not
//! pass through here; they go to subscriber sets only.

use tokio::sync::broadcast;

use crate::protocol::ServerMessage;

/// Hub for global lifecycle events (`command_*`, `session_*`,
/// `server_shutdown`).
pub struct Hub {
    event_tx: broadcast::Sender<ServerMessage>,
}

impl Hub {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(1024);
        Self { event_tx }
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerMessage> {
        self.event_tx.subscribe()
    }

    /// Broadcast one lifecycle event. Lagging or absent receivers are
    /// not an error.
    pub fn emit(&self, msg: ServerMessage) {
        let _ = self.event_tx.send(msg);
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}
