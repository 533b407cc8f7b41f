// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Pure classification over the command set: timeout class and
//! version-bump behavior. Both functions are total.

use std::time::Duration;

use crate::config::MuxConfig;
use crate::protocol::CommandPayload;

/// Execution-time budget class for a command type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutClass {
    /// Pure reads and cheap mutations.
    Short,
    /// LLM-driven turns.
    Long,
    /// Cancellable stream holders and abort dispatchers: no timer runs.
    None,
}

impl TimeoutClass {
    /// Resolve the class into a concrete budget from config.
    pub fn budget(&self, config: &MuxConfig) -> Option<Duration> {
        match self {
            Self::Short => Some(config.short_timeout()),
            Self::Long => Some(config.long_timeout()),
            Self::None => None,
        }
    }
}

/// Timeout class per command type.
pub fn timeout_class(payload: &CommandPayload) -> TimeoutClass {
    match payload {
        CommandPayload::Prompt { .. }
        | CommandPayload::Steer { .. }
        | CommandPayload::FollowUp { .. }
        | CommandPayload::Compact => TimeoutClass::Long,
        CommandPayload::Bash { .. }
        | CommandPayload::Abort
        | CommandPayload::AbortBash
        | CommandPayload::AbortCompaction
        | CommandPayload::AbortRetry => TimeoutClass::None,
        _ => TimeoutClass::Short,
    }
}

/// Whether a successful execution of this command bumps the session
/// version. Reads and aborts never do; server-lane commands have no
/// session scope to bump.
pub fn mutates(payload: &CommandPayload) -> bool {
    matches!(
        payload,
        CommandPayload::Prompt { .. }
            | CommandPayload::Steer { .. }
            | CommandPayload::FollowUp { .. }
            | CommandPayload::Compact
            | CommandPayload::SetModel { .. }
            | CommandPayload::CycleModel
            | CommandPayload::SetThinkingLevel { .. }
            | CommandPayload::CycleThinkingLevel
            | CommandPayload::SetSessionName { .. }
            | CommandPayload::SetAutoCompaction { .. }
            | CommandPayload::SetAutoRetry { .. }
            | CommandPayload::Bash { .. }
            | CommandPayload::NewSession
            | CommandPayload::SwitchSessionFile { .. }
            | CommandPayload::Fork { .. }
    )
}

#[cfg(test)]
#[path = "classify_tests.rs"]
mod tests;
