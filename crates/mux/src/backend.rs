// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The seam to the backend coding-agent engine.
//!
//! The engine is an external collaborator: the multiplexer only
//! requires the two traits below. [`EchoBackend`] is the deterministic
//! local implementation served by the dev binary and by the scenario
//! tests; a real deployment links its own backend.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::broadcast;

use crate::protocol::CommandPayload;
use crate::uibroker::UiContext;

/// One live agent session. `call` executes an operation; `abort` and
/// `abort_bash` are side-channel cancellations that may be invoked
/// while a `call` is in flight.
#[async_trait]
pub trait AgentSession: Send + Sync {
    async fn call(&self, op: &CommandPayload) -> anyhow::Result<serde_json::Value>;

    /// Best-effort cancel of an in-flight LLM turn.
    fn abort(&self);

    /// Signal a running bash command.
    fn abort_bash(&self);

    /// The typed event stream this session emits.
    fn subscribe(&self) -> broadcast::Receiver<serde_json::Value>;

    /// Detach the session (delete or shutdown drain).
    async fn close(&self);
}

/// Builds agent sessions. Owned by the session manager.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Create a fresh session.
    async fn open(&self, session_id: &str, ui: UiContext)
        -> anyhow::Result<Arc<dyn AgentSession>>;

    /// Restore a session from a persisted file (validated path).
    async fn load(
        &self,
        session_id: &str,
        path: &Path,
        ui: UiContext,
    ) -> anyhow::Result<Arc<dyn AgentSession>>;

    /// Provider new sessions start on (keys the LLM breaker).
    fn default_provider(&self) -> String;
}

// -- Echo backend -------------------------------------------------------------

/// Deterministic in-process backend for development and tests.
///
/// Prompts echo their message back as a short event stream. A few
/// message prefixes script useful behaviors: `sleep:<ms>` delays the
/// reply, `fail:` errors, `ui:select` runs an extension-UI round trip.
pub struct EchoBackend;

#[async_trait]
impl AgentBackend for EchoBackend {
    async fn open(
        &self,
        session_id: &str,
        ui: UiContext,
    ) -> anyhow::Result<Arc<dyn AgentSession>> {
        Ok(Arc::new(EchoAgent::new(session_id, ui, None)))
    }

    async fn load(
        &self,
        session_id: &str,
        path: &Path,
        ui: UiContext,
    ) -> anyhow::Result<Arc<dyn AgentSession>> {
        let file = path.to_string_lossy().into_owned();
        Ok(Arc::new(EchoAgent::new(session_id, ui, Some(file))))
    }

    fn default_provider(&self) -> String {
        "echo".to_owned()
    }
}

struct EchoState {
    model: String,
    provider: String,
    thinking_level: String,
    name: Option<String>,
    auto_compaction: bool,
    auto_retry: bool,
    messages: Vec<serde_json::Value>,
    session_file: Option<String>,
}

pub struct EchoAgent {
    session_id: String,
    ui: UiContext,
    state: Mutex<EchoState>,
    event_tx: broadcast::Sender<serde_json::Value>,
}

impl EchoAgent {
    pub fn new(session_id: &str, ui: UiContext, session_file: Option<String>) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            session_id: session_id.to_owned(),
            ui,
            state: Mutex::new(EchoState {
                model: "echo-1".to_owned(),
                provider: "echo".to_owned(),
                thinking_level: "medium".to_owned(),
                name: None,
                auto_compaction: true,
                auto_retry: true,
                messages: Vec::new(),
                session_file,
            }),
            event_tx,
        }
    }

    fn emit(&self, event: serde_json::Value) {
        let _ = self.event_tx.send(event);
    }

    async fn turn(&self, kind: &str, message: &str) -> anyhow::Result<serde_json::Value> {
        if let Some(ms) = message.strip_prefix("sleep:").and_then(|s| s.parse::<u64>().ok()) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        if message.starts_with("fail:") {
            anyhow::bail!("scripted failure: {message}");
        }
        if message.starts_with("ui:select") {
            let options = vec!["alpha".to_owned(), "beta".to_owned()];
            let picked = self.ui.select("pick one", &options).await;
            let value = picked.unwrap_or_else(|| json!("alpha"));
            return Ok(json!({ "kind": kind, "selected": value }));
        }

        let text = format!("echo: {message}");
        self.emit(json!({ "type": "message_start", "role": "assistant" }));
        self.emit(json!({ "type": "text", "text": text }));
        self.emit(json!({ "type": "message_end" }));
        self.state.lock().messages.push(json!({ "role": "user", "content": message }));
        Ok(json!({ "kind": kind, "text": text }))
    }
}

#[async_trait]
impl AgentSession for EchoAgent {
    async fn call(&self, op: &CommandPayload) -> anyhow::Result<serde_json::Value> {
        match op {
            CommandPayload::Prompt { message } => self.turn("prompt", message).await,
            CommandPayload::Steer { message } => self.turn("steer", message).await,
            CommandPayload::FollowUp { message } => self.turn("follow_up", message).await,
            CommandPayload::Abort => Ok(json!({ "aborted": true })),
            CommandPayload::GetState => {
                let state = self.state.lock();
                Ok(json!({
                    "sessionId": self.session_id,
                    "model": state.model,
                    "provider": state.provider,
                    "thinkingLevel": state.thinking_level,
                    "name": state.name,
                    "autoCompaction": state.auto_compaction,
                    "autoRetry": state.auto_retry,
                }))
            }
            CommandPayload::GetMessages => {
                Ok(json!({ "messages": self.state.lock().messages.clone() }))
            }
            CommandPayload::SetModel { provider, model } => {
                let mut state = self.state.lock();
                state.provider = provider.clone();
                state.model = model.clone();
                Ok(json!({ "provider": provider, "model": model }))
            }
            CommandPayload::CycleModel => {
                let mut state = self.state.lock();
                state.model =
                    if state.model == "echo-1" { "echo-2".to_owned() } else { "echo-1".to_owned() };
                Ok(json!({ "model": state.model }))
            }
            CommandPayload::SetThinkingLevel { level } => {
                self.state.lock().thinking_level = level.clone();
                Ok(json!({ "thinkingLevel": level }))
            }
            CommandPayload::CycleThinkingLevel => {
                let mut state = self.state.lock();
                state.thinking_level = match state.thinking_level.as_str() {
                    "low" => "medium".to_owned(),
                    "medium" => "high".to_owned(),
                    _ => "low".to_owned(),
                };
                Ok(json!({ "thinkingLevel": state.thinking_level }))
            }
            CommandPayload::SetSessionName { name } => {
                self.state.lock().name = Some(name.clone());
                Ok(json!({ "name": name }))
            }
            CommandPayload::Compact => Ok(json!({ "compacted": true })),
            CommandPayload::AbortCompaction => Ok(json!({ "aborted": true })),
            CommandPayload::SetAutoCompaction { enabled } => {
                self.state.lock().auto_compaction = *enabled;
                Ok(json!({ "autoCompaction": enabled }))
            }
            CommandPayload::SetAutoRetry { enabled } => {
                self.state.lock().auto_retry = *enabled;
                Ok(json!({ "autoRetry": enabled }))
            }
            CommandPayload::AbortRetry => Ok(json!({ "aborted": true })),
            CommandPayload::Bash { command } => {
                if let Some(ms) =
                    command.strip_prefix("sleep:").and_then(|s| s.parse::<u64>().ok())
                {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                }
                Ok(json!({ "exitCode": 0, "stdout": format!("ran: {command}"), "stderr": "" }))
            }
            CommandPayload::AbortBash => Ok(json!({ "aborted": true })),
            CommandPayload::GetAvailableModels => {
                Ok(json!({ "models": [
                    { "provider": "echo", "model": "echo-1" },
                    { "provider": "echo", "model": "echo-2" },
                ] }))
            }
            CommandPayload::GetCommands => Ok(json!({ "commands": [] })),
            CommandPayload::GetSkills => Ok(json!({ "skills": [] })),
            CommandPayload::GetTools => Ok(json!({ "tools": ["bash"] })),
            CommandPayload::ListSessionFiles => Ok(json!({ "files": [] })),
            CommandPayload::GetSessionStats => {
                Ok(json!({ "messageCount": self.state.lock().messages.len() }))
            }
            CommandPayload::ExportHtml { .. } => {
                let state = self.state.lock();
                Ok(json!({
                    "html": format!(
                        "<html><body><h1>{}</h1></body></html>",
                        state.name.as_deref().unwrap_or(&self.session_id)
                    )
                }))
            }
            CommandPayload::NewSession => {
                let mut state = self.state.lock();
                state.messages.clear();
                state.session_file = None;
                Ok(json!({ "reset": true }))
            }
            CommandPayload::SwitchSessionFile { path } => {
                self.state.lock().session_file = Some(path.clone());
                Ok(json!({ "file": path }))
            }
            CommandPayload::Fork { index } => {
                Ok(json!({ "forked": true, "fromIndex": index }))
            }
            CommandPayload::GetForkMessages => Ok(json!({ "messages": [] })),
            CommandPayload::GetLastAssistantText => {
                Ok(json!({ "text": self
                    .state
                    .lock()
                    .messages
                    .last()
                    .and_then(|m| m.get("content"))
                    .cloned() }))
            }
            CommandPayload::GetContextUsage => {
                Ok(json!({ "tokens": self.state.lock().messages.len() * 8, "limit": 200000 }))
            }
            // Server-lane and broker-handled types never reach the agent.
            other => anyhow::bail!("not an agent operation: {}", other.name()),
        }
    }

    fn abort(&self) {
        self.emit(json!({ "type": "aborted" }));
    }

    fn abort_bash(&self) {
        self.emit(json!({ "type": "bash_aborted" }));
    }

    fn subscribe(&self) -> broadcast::Receiver<serde_json::Value> {
        self.event_tx.subscribe()
    }

    async fn close(&self) {
        self.emit(json!({ "type": "session_closed" }));
    }
}
