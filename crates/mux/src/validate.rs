// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Structural admission checks. Everything here runs before any
//! lifecycle event is emitted; a rejected frame produces a failure
//! response and nothing else.

use serde_json::Value;

use crate::error::{CommandError, ErrorKind};
use crate::protocol::{fingerprint, Command, ANON_PREFIX, COMMAND_TYPES};
use crate::storage;

/// Maximum `dependsOn` entries per command.
pub const MAX_DEPENDS_ON: usize = 32;

/// Bound for `id`, `idempotencyKey`, and `requestId` strings.
pub const MAX_IDENTITY_LEN: usize = 256;

/// A validated command ready for the execution engine.
pub struct AdmittedCommand {
    pub command: Command,
    /// The explicit client ID, or a synthetic `anon:` ID used only for
    /// lifecycle events.
    pub command_id: String,
    pub explicit_id: bool,
    pub fingerprint: String,
}

/// A rejected frame, with whatever identity could be recovered for the
/// failure response.
pub struct RejectedCommand {
    pub command_type: Option<String>,
    pub id: Option<String>,
    pub error: CommandError,
}

fn reject(
    raw: Option<&Value>,
    kind: ErrorKind,
    message: impl Into<String>,
) -> Box<RejectedCommand> {
    let command_type = raw
        .and_then(|v| v.get("type"))
        .and_then(Value::as_str)
        .map(str::to_owned);
    let id = raw.and_then(|v| v.get("id")).and_then(Value::as_str).map(str::to_owned);
    Box::new(RejectedCommand { command_type, id, error: CommandError::new(kind, message) })
}

fn valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && !id.contains("..")
        && id.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

fn valid_request_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_IDENTITY_LEN
        && id.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, ':' | '_' | '-'))
}

/// Command types that name a session in the envelope, including the
/// server-lane registry operations.
fn requires_session_id(command_type: &str) -> bool {
    !matches!(
        command_type,
        "list_sessions" | "get_metrics" | "health_check" | "list_stored_sessions" | "load_session"
    )
}

/// Validate one inbound frame. The transport has already bounded its
/// size; everything else is checked here.
pub fn validate(text: &str) -> Result<AdmittedCommand, Box<RejectedCommand>> {
    let raw: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            return Err(reject(None, ErrorKind::MalformedFrame, format!("invalid JSON: {e}")));
        }
    };
    if !raw.is_object() {
        return Err(reject(None, ErrorKind::MalformedFrame, "frame must be a JSON object"));
    }

    let Some(type_value) = raw.get("type") else {
        return Err(reject(Some(&raw), ErrorKind::MissingField, "missing field: type"));
    };
    let Some(command_type) = type_value.as_str() else {
        return Err(reject(Some(&raw), ErrorKind::InvalidField, "type must be a string"));
    };
    if !COMMAND_TYPES.contains(&command_type) {
        return Err(reject(
            Some(&raw),
            ErrorKind::UnknownCommand,
            format!("unknown command type: {command_type}"),
        ));
    }

    if let Some(id_value) = raw.get("id") {
        let Some(id) = id_value.as_str() else {
            return Err(reject(Some(&raw), ErrorKind::InvalidField, "id must be a string"));
        };
        if id.is_empty() || id.len() > MAX_IDENTITY_LEN {
            return Err(reject(
                Some(&raw),
                ErrorKind::InvalidField,
                format!("id must be 1..={MAX_IDENTITY_LEN} characters"),
            ));
        }
        if id.starts_with(ANON_PREFIX) {
            return Err(reject(
                Some(&raw),
                ErrorKind::ReservedId,
                format!("id prefix {ANON_PREFIX} is reserved for synthetic ids"),
            ));
        }
    }

    match raw.get("sessionId") {
        Some(value) => {
            let Some(session_id) = value.as_str() else {
                return Err(reject(
                    Some(&raw),
                    ErrorKind::InvalidField,
                    "sessionId must be a string",
                ));
            };
            if !valid_session_id(session_id) {
                return Err(reject(
                    Some(&raw),
                    ErrorKind::InvalidField,
                    "sessionId must match [A-Za-z0-9._-]+ with no traversal sequences",
                ));
            }
        }
        None => {
            if requires_session_id(command_type) {
                return Err(reject(
                    Some(&raw),
                    ErrorKind::MissingField,
                    format!("{command_type} requires sessionId"),
                ));
            }
        }
    }

    if let Some(deps_value) = raw.get("dependsOn") {
        let Some(deps) = deps_value.as_array() else {
            return Err(reject(
                Some(&raw),
                ErrorKind::InvalidField,
                "dependsOn must be an array of command ids",
            ));
        };
        if deps.len() > MAX_DEPENDS_ON {
            return Err(reject(
                Some(&raw),
                ErrorKind::InvalidField,
                format!("dependsOn is bounded at {MAX_DEPENDS_ON} entries"),
            ));
        }
        if !deps.iter().all(|d| d.as_str().is_some_and(|s| !s.is_empty())) {
            return Err(reject(
                Some(&raw),
                ErrorKind::InvalidField,
                "dependsOn entries must be non-empty strings",
            ));
        }
    }

    if let Some(version_value) = raw.get("ifSessionVersion") {
        if version_value.as_u64().is_none() {
            return Err(reject(
                Some(&raw),
                ErrorKind::InvalidField,
                "ifSessionVersion must be a non-negative integer",
            ));
        }
    }

    if let Some(key_value) = raw.get("idempotencyKey") {
        let Some(key) = key_value.as_str() else {
            return Err(reject(
                Some(&raw),
                ErrorKind::InvalidField,
                "idempotencyKey must be a string",
            ));
        };
        if key.is_empty() || key.len() > MAX_IDENTITY_LEN {
            return Err(reject(
                Some(&raw),
                ErrorKind::InvalidField,
                format!("idempotencyKey must be 1..={MAX_IDENTITY_LEN} characters"),
            ));
        }
    }

    // Type-specific payload checks that guard filesystem and broker
    // access run before the typed parse.
    if command_type == "load_session" {
        let Some(path) = raw.get("path").and_then(Value::as_str) else {
            return Err(reject(Some(&raw), ErrorKind::MissingField, "load_session requires path"));
        };
        if let Err(e) = storage::check_session_path(path) {
            return Err(reject(Some(&raw), e.kind, e.message));
        }
    }
    if command_type == "extension_ui_response" {
        let Some(request_id) = raw.get("requestId").and_then(Value::as_str) else {
            return Err(reject(
                Some(&raw),
                ErrorKind::MissingField,
                "extension_ui_response requires requestId",
            ));
        };
        if !valid_request_id(request_id) {
            return Err(reject(
                Some(&raw),
                ErrorKind::InvalidField,
                "requestId must match [A-Za-z0-9:_-]+ and be at most 256 characters",
            ));
        }
    }

    let fp = fingerprint(&raw);

    let mut command: Command = match serde_json::from_value(raw.clone()) {
        Ok(cmd) => cmd,
        Err(e) => {
            return Err(reject(
                Some(&raw),
                ErrorKind::InvalidField,
                format!("invalid {command_type} payload: {e}"),
            ));
        }
    };

    // dependsOn is an ordered set: drop duplicate entries, keep first
    // occurrence order.
    let mut seen = std::collections::HashSet::new();
    command.depends_on.retain(|d| seen.insert(d.clone()));

    let (command_id, explicit_id) = match command.id {
        Some(ref id) => (id.clone(), true),
        None => (format!("{ANON_PREFIX}{}", uuid::Uuid::new_v4().simple()), false),
    };

    Ok(AdmittedCommand { command, command_id, explicit_id, fingerprint: fp })
}

#[cfg(test)]
#[path = "validate_tests.rs"]
mod tests;
