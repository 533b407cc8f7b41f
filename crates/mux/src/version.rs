// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-session monotonic version counters with an
//! optimistic-concurrency precheck.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::classify::mutates;
use crate::error::{CommandError, ErrorKind};
use crate::protocol::CommandPayload;

/// `sessionId -> version`. Initialized to 0 on create, removed on
/// delete; strictly increases by 1 per successful mutating command.
#[derive(Default)]
pub struct VersionStore {
    versions: RwLock<HashMap<String, u64>>,
}

impl VersionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly created session at version 0.
    pub fn insert(&self, session_id: &str) {
        self.versions.write().insert(session_id.to_owned(), 0);
    }

    pub fn remove(&self, session_id: &str) {
        self.versions.write().remove(session_id);
    }

    pub fn current(&self, session_id: &str) -> Option<u64> {
        self.versions.read().get(session_id).copied()
    }

    /// Bump after a successful mutating command; returns the new
    /// version (or the unchanged current one for non-mutating types).
    pub fn bump_if_mutating(&self, session_id: &str, payload: &CommandPayload) -> Option<u64> {
        let mut versions = self.versions.write();
        let v = versions.get_mut(session_id)?;
        if mutates(payload) {
            *v += 1;
        }
        Some(*v)
    }

    /// Optimistic-concurrency gate, evaluated before dispatch.
    pub fn precheck(
        &self,
        session_id: &str,
        if_session_version: Option<u64>,
    ) -> Result<(), CommandError> {
        let versions = self.versions.read();
        let Some(current) = versions.get(session_id) else {
            return Err(CommandError::new(
                ErrorKind::SessionNotFound,
                format!("session not found: {session_id}"),
            ));
        };
        if let Some(expected) = if_session_version {
            if expected != *current {
                return Err(CommandError::new(
                    ErrorKind::VersionMismatch,
                    format!("version mismatch: expected {expected}, session is at {current}"),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "version_tests.rs"]
mod tests;
