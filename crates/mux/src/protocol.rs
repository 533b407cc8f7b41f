// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire-format types for the pimux protocol.
//!
//! Inbound commands and outbound frames are single JSON objects,
//! internally tagged on `type` with camelCase field names. Both
//! transports (WebSocket and stdio) carry the same objects; only the
//! framing differs.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::CommandError;

/// Reserved prefix for server-synthesized command IDs. Client-supplied
/// IDs must never start with it; synthetic IDs are never stored.
pub const ANON_PREFIX: &str = "anon:";

/// Lane key for server-scoped commands.
pub const SERVER_LANE: &str = "server";

// -- Command envelope ---------------------------------------------------------

/// A decoded inbound command: retry identity, causality, and the
/// type-specific payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Ordered set of command IDs this command waits on (bounded at 32).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Optimistic-concurrency precondition against the session version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub if_session_version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(flatten)]
    pub payload: CommandPayload,
}

impl Command {
    /// Rate-limit / idempotency scope: the session ID, or `server`.
    pub fn scope(&self) -> &str {
        match self.session_id {
            Some(ref id) if !self.payload.is_server() => id,
            _ => SERVER_LANE,
        }
    }

    /// Serialization lane key (`server` or `session:<id>`).
    pub fn lane(&self) -> String {
        if self.payload.is_server() {
            SERVER_LANE.to_owned()
        } else {
            format!("session:{}", self.session_id.as_deref().unwrap_or_default())
        }
    }
}

/// The closed command set. Server-lane commands manage the session
/// registry and server state; everything else is executed against one
/// agent session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandPayload {
    // Server lane
    ListSessions,
    CreateSession,
    DeleteSession,
    SwitchSession,
    GetMetrics,
    HealthCheck,
    ListStoredSessions,
    #[serde(rename_all = "camelCase")]
    LoadSession { path: String },
    // Session lane
    #[serde(rename_all = "camelCase")]
    Prompt { message: String },
    #[serde(rename_all = "camelCase")]
    Steer { message: String },
    #[serde(rename_all = "camelCase")]
    FollowUp { message: String },
    Abort,
    GetState,
    GetMessages,
    #[serde(rename_all = "camelCase")]
    SetModel { provider: String, model: String },
    CycleModel,
    #[serde(rename_all = "camelCase")]
    SetThinkingLevel { level: String },
    CycleThinkingLevel,
    #[serde(rename_all = "camelCase")]
    SetSessionName { name: String },
    Compact,
    AbortCompaction,
    #[serde(rename_all = "camelCase")]
    SetAutoCompaction { enabled: bool },
    #[serde(rename_all = "camelCase")]
    SetAutoRetry { enabled: bool },
    AbortRetry,
    #[serde(rename_all = "camelCase")]
    Bash { command: String },
    AbortBash,
    GetAvailableModels,
    GetCommands,
    GetSkills,
    GetTools,
    ListSessionFiles,
    GetSessionStats,
    #[serde(rename_all = "camelCase")]
    ExportHtml {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    NewSession,
    #[serde(rename_all = "camelCase")]
    SwitchSessionFile { path: String },
    #[serde(rename_all = "camelCase")]
    Fork {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<u64>,
    },
    GetForkMessages,
    GetLastAssistantText,
    GetContextUsage,
    #[serde(rename_all = "camelCase")]
    ExtensionUiResponse {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        confirmed: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        responses: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        cancelled: bool,
    },
}

/// Every wire-format type tag, used by the validator to tell an
/// unknown `type` apart from a payload that fails to parse.
pub const COMMAND_TYPES: &[&str] = &[
    "list_sessions",
    "create_session",
    "delete_session",
    "switch_session",
    "get_metrics",
    "health_check",
    "list_stored_sessions",
    "load_session",
    "prompt",
    "steer",
    "follow_up",
    "abort",
    "get_state",
    "get_messages",
    "set_model",
    "cycle_model",
    "set_thinking_level",
    "cycle_thinking_level",
    "set_session_name",
    "compact",
    "abort_compaction",
    "set_auto_compaction",
    "set_auto_retry",
    "abort_retry",
    "bash",
    "abort_bash",
    "get_available_models",
    "get_commands",
    "get_skills",
    "get_tools",
    "list_session_files",
    "get_session_stats",
    "export_html",
    "new_session",
    "switch_session_file",
    "fork",
    "get_fork_messages",
    "get_last_assistant_text",
    "get_context_usage",
    "extension_ui_response",
];

impl CommandPayload {
    /// The wire-format type tag.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ListSessions => "list_sessions",
            Self::CreateSession => "create_session",
            Self::DeleteSession => "delete_session",
            Self::SwitchSession => "switch_session",
            Self::GetMetrics => "get_metrics",
            Self::HealthCheck => "health_check",
            Self::ListStoredSessions => "list_stored_sessions",
            Self::LoadSession { .. } => "load_session",
            Self::Prompt { .. } => "prompt",
            Self::Steer { .. } => "steer",
            Self::FollowUp { .. } => "follow_up",
            Self::Abort => "abort",
            Self::GetState => "get_state",
            Self::GetMessages => "get_messages",
            Self::SetModel { .. } => "set_model",
            Self::CycleModel => "cycle_model",
            Self::SetThinkingLevel { .. } => "set_thinking_level",
            Self::CycleThinkingLevel => "cycle_thinking_level",
            Self::SetSessionName { .. } => "set_session_name",
            Self::Compact => "compact",
            Self::AbortCompaction => "abort_compaction",
            Self::SetAutoCompaction { .. } => "set_auto_compaction",
            Self::SetAutoRetry { .. } => "set_auto_retry",
            Self::AbortRetry => "abort_retry",
            Self::Bash { .. } => "bash",
            Self::AbortBash => "abort_bash",
            Self::GetAvailableModels => "get_available_models",
            Self::GetCommands => "get_commands",
            Self::GetSkills => "get_skills",
            Self::GetTools => "get_tools",
            Self::ListSessionFiles => "list_session_files",
            Self::GetSessionStats => "get_session_stats",
            Self::ExportHtml { .. } => "export_html",
            Self::NewSession => "new_session",
            Self::SwitchSessionFile { .. } => "switch_session_file",
            Self::Fork { .. } => "fork",
            Self::GetForkMessages => "get_fork_messages",
            Self::GetLastAssistantText => "get_last_assistant_text",
            Self::GetContextUsage => "get_context_usage",
            Self::ExtensionUiResponse { .. } => "extension_ui_response",
        }
    }

    /// Whether this command runs on the `server` lane.
    pub fn is_server(&self) -> bool {
        matches!(
            self,
            Self::ListSessions
                | Self::CreateSession
                | Self::DeleteSession
                | Self::SwitchSession
                | Self::GetMetrics
                | Self::HealthCheck
                | Self::ListStoredSessions
                | Self::LoadSession { .. }
        )
    }
}

// -- Fingerprint --------------------------------------------------------------

/// Deterministic semantic identity of a command, excluding retry
/// identity (`id`, `idempotencyKey`).
///
/// Relies on `serde_json`'s sorted object keys for a canonical byte
/// encoding; the result is stable across process lifetime.
pub fn fingerprint(raw: &serde_json::Value) -> String {
    let canonical = match raw {
        serde_json::Value::Object(map) => {
            let mut map = map.clone();
            map.remove("id");
            map.remove("idempotencyKey");
            serde_json::Value::Object(map)
        }
        other => other.clone(),
    };
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    let mut out = String::with_capacity(64);
    for b in digest {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

// -- Response -----------------------------------------------------------------

/// Terminal outcome of one admitted command. Exactly one is produced
/// per admitted command; once stored in the replay store it is
/// immutable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    /// Echo of the request `type`.
    pub command: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replayed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timed_out: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ResponseData>,
}

impl Response {
    pub fn ok(command: &str, id: Option<String>, data: Option<ResponseData>) -> Self {
        Self {
            command: command.to_owned(),
            success: true,
            id,
            error: None,
            session_version: None,
            replayed: None,
            timed_out: None,
            data,
        }
    }

    pub fn fail(command: &str, id: Option<String>, err: &CommandError) -> Self {
        Self {
            command: command.to_owned(),
            success: false,
            id,
            error: Some(err.message.clone()),
            session_version: None,
            replayed: None,
            timed_out: None,
            data: None,
        }
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.session_version = Some(version);
        self
    }

    /// Mark a stored response as served from the replay store.
    pub fn replay(&self) -> Self {
        let mut r = self.clone();
        r.replayed = Some(true);
        r
    }
}

/// Success payloads, tagged by shape rather than by an extra wrapper
/// key. Agent-session results are opaque to the multiplexer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ResponseData {
    #[serde(rename_all = "camelCase")]
    Sessions { sessions: Vec<SessionInfo> },
    #[serde(rename_all = "camelCase")]
    StoredSessions { files: Vec<StoredSessionInfo> },
    #[serde(rename_all = "camelCase")]
    Metrics { metrics: serde_json::Value },
    #[serde(rename_all = "camelCase")]
    Health {
        status: String,
        uptime_ms: u64,
        session_count: usize,
        connection_count: usize,
        shutting_down: bool,
    },
    #[serde(rename_all = "camelCase")]
    Exported { path: String, bytes: u64 },
    Agent(serde_json::Value),
}

/// One registered session, as reported by `list_sessions`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub created_at_ms: u64,
    pub version: u64,
    pub subscribers: usize,
}

/// One persisted session file under the allowed roots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoredSessionInfo {
    pub name: String,
    pub path: String,
    pub size_bytes: u64,
    pub modified_ms: u64,
}

// -- Outbound frames ----------------------------------------------------------

/// Everything the server writes to a client: responses, session-scoped
/// events, and global lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Response(Response),
    /// Session-scoped wrapper around an opaque agent event.
    #[serde(rename_all = "camelCase")]
    Event { session_id: String, event: serde_json::Value },
    #[serde(rename_all = "camelCase")]
    CommandAccepted {
        command_id: String,
        command_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    CommandStarted {
        command_id: String,
        command_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    CommandFinished(CommandFinished),
    #[serde(rename_all = "camelCase")]
    SessionCreated { session_id: String },
    #[serde(rename_all = "camelCase")]
    SessionDeleted { session_id: String },
    #[serde(rename_all = "camelCase")]
    ServerReady { data: ServerReadyData },
    ServerShutdown,
}

impl ServerMessage {
    /// Responses and handshake/shutdown frames must survive
    /// backpressure; events are droppable.
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::Response(_) | Self::ServerReady { .. } | Self::ServerShutdown)
    }
}

/// Terminal lifecycle record for one command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommandFinished {
    pub command_id: String,
    pub command_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replayed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timed_out: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandFinished {
    /// Build the lifecycle record mirroring a terminal response.
    pub fn from_response(command_id: &str, session_id: Option<&str>, resp: &Response) -> Self {
        Self {
            command_id: command_id.to_owned(),
            command_type: resp.command.clone(),
            session_id: session_id.map(str::to_owned),
            success: resp.success,
            session_version: resp.session_version,
            replayed: resp.replayed,
            timed_out: resp.timed_out,
            error: resp.error.clone(),
        }
    }
}

/// Handshake payload sent on every new connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerReadyData {
    pub server_version: String,
    pub protocol_version: String,
    pub transports: Vec<String>,
}

impl ServerReadyData {
    pub fn current() -> Self {
        Self {
            server_version: env!("CARGO_PKG_VERSION").to_owned(),
            protocol_version: "1.0.0".to_owned(),
            transports: vec!["websocket".to_owned(), "stdio".to_owned()],
        }
    }
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
