// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Harness for end-to-end spec tests: an in-process pimux server over
//! the echo backend, driven through a real WebSocket connection.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use pimux::backend::EchoBackend;
use pimux::config::MuxConfig;

/// Default frame-wait budget.
pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Find a free TCP port by binding to :0 then releasing.
pub fn free_port() -> anyhow::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// Spec-friendly config: tight budgets so timeout scenarios run in
/// milliseconds.
pub fn spec_config(port: u16) -> MuxConfig {
    MuxConfig {
        port,
        short_timeout_ms: 2_000,
        long_timeout_ms: 2_000,
        dep_wait_timeout_ms: 2_000,
        ui_request_timeout_ms: 2_000,
        drain_timeout_ms: 1_000,
        ..MuxConfig::default()
    }
}

/// An in-process server on its own port.
pub struct SpecServer {
    pub port: u16,
    task: tokio::task::JoinHandle<()>,
}

impl SpecServer {
    /// Start a server with the default spec config.
    pub async fn start() -> anyhow::Result<Self> {
        Self::start_with(spec_config(free_port()?)).await
    }

    /// Start a server with a caller-tuned config (port 0 picks one).
    pub async fn start_with(mut config: MuxConfig) -> anyhow::Result<Self> {
        if config.port == 0 {
            config.port = free_port()?;
        }
        let port = config.port;
        let task = tokio::spawn(async move {
            if let Err(e) = pimux::run(config, Arc::new(EchoBackend)).await {
                eprintln!("spec server exited: {e:#}");
            }
        });

        // Wait for the listener to come up.
        let deadline = tokio::time::Instant::now() + TIMEOUT;
        loop {
            if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                break;
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("server never started listening on {port}");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        Ok(Self { port, task })
    }

    pub fn ws_url(&self) -> String {
        format!("ws://127.0.0.1:{}/ws", self.port)
    }

    /// Connect a client and consume the `server_ready` handshake.
    pub async fn client(&self) -> anyhow::Result<WsClient> {
        let (stream, _) = tokio_tungstenite::connect_async(self.ws_url()).await?;
        let mut client = WsClient { stream, buffered: Vec::new() };
        let ready = client.next_json().await?;
        anyhow::ensure!(
            ready["type"] == "server_ready",
            "expected server_ready, got {ready}"
        );
        Ok(client)
    }
}

impl Drop for SpecServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A WebSocket client speaking one JSON object per text frame.
///
/// Frames read while looking for something else are buffered, so
/// responses and events can be awaited in any order regardless of how
/// the server interleaved them.
pub struct WsClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    buffered: Vec<serde_json::Value>,
}

impl WsClient {
    pub async fn send(&mut self, frame: serde_json::Value) -> anyhow::Result<()> {
        self.stream.send(Message::Text(frame.to_string().into())).await?;
        Ok(())
    }

    /// Next JSON text frame, skipping transport-level frames.
    pub async fn next_json(&mut self) -> anyhow::Result<serde_json::Value> {
        let deadline = tokio::time::Instant::now() + TIMEOUT;
        loop {
            let remaining = deadline - tokio::time::Instant::now();
            let msg = tokio::time::timeout(remaining, self.stream.next())
                .await?
                .ok_or_else(|| anyhow::anyhow!("connection closed"))??;
            match msg {
                Message::Text(text) => return Ok(serde_json::from_str(&text)?),
                Message::Close(_) => anyhow::bail!("connection closed"),
                _ => {}
            }
        }
    }

    /// Return the first frame satisfying the predicate, checking
    /// previously buffered frames first. Non-matching frames are kept
    /// for later waits.
    pub async fn wait_for<F>(&mut self, mut pred: F) -> anyhow::Result<serde_json::Value>
    where
        F: FnMut(&serde_json::Value) -> bool,
    {
        if let Some(pos) = self.buffered.iter().position(&mut pred) {
            return Ok(self.buffered.remove(pos));
        }
        let deadline = tokio::time::Instant::now() + TIMEOUT;
        loop {
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("no matching frame before deadline");
            }
            let frame = self.next_json().await?;
            if pred(&frame) {
                return Ok(frame);
            }
            self.buffered.push(frame);
        }
    }

    /// The terminal response echoing `id`.
    pub async fn response_for(&mut self, id: &str) -> anyhow::Result<serde_json::Value> {
        self.wait_for(|frame| frame["type"] == "response" && frame["id"] == id).await
    }

    /// Send a command and await its response by id.
    pub async fn round_trip(
        &mut self,
        frame: serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        let id = frame["id"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("round_trip needs an id"))?
            .to_owned();
        self.send(frame).await?;
        self.response_for(&id).await
    }
}
