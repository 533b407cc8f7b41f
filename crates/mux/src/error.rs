// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::fmt;

/// Failure taxonomy for command execution.
///
/// Every taxonomic failure is recovered locally into a well-formed
/// response with `success = false`; none of these ever crashes a lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    // Structural
    MalformedFrame,
    MissingField,
    InvalidField,
    ReservedId,
    // Admission
    UnknownCommand,
    ShuttingDown,
    // Resource
    RateLimited,
    SessionSlotsExhausted,
    InFlightTableFull,
    ConnectionLimit,
    // Concurrency
    VersionMismatch,
    DependencyUnknown,
    DependencyFailed,
    DependencyTimeout,
    LaneInversion,
    // Replay identity
    FingerprintConflict,
    IdempotencyConflict,
    // Execution
    HandlerError,
    Timeout,
    CircuitOpen,
    // Lifecycle
    SessionNotFound,
    SessionExists,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MalformedFrame => "MALFORMED_FRAME",
            Self::MissingField => "MISSING_FIELD",
            Self::InvalidField => "INVALID_FIELD",
            Self::ReservedId => "RESERVED_ID",
            Self::UnknownCommand => "UNKNOWN_COMMAND",
            Self::ShuttingDown => "SHUTTING_DOWN",
            Self::RateLimited => "RATE_LIMITED",
            Self::SessionSlotsExhausted => "SESSION_SLOTS_EXHAUSTED",
            Self::InFlightTableFull => "IN_FLIGHT_TABLE_FULL",
            Self::ConnectionLimit => "CONNECTION_LIMIT",
            Self::VersionMismatch => "VERSION_MISMATCH",
            Self::DependencyUnknown => "DEPENDENCY_UNKNOWN",
            Self::DependencyFailed => "DEPENDENCY_FAILED",
            Self::DependencyTimeout => "DEPENDENCY_TIMEOUT",
            Self::LaneInversion => "LANE_INVERSION",
            Self::FingerprintConflict => "FINGERPRINT_CONFLICT",
            Self::IdempotencyConflict => "IDEMPOTENCY_CONFLICT",
            Self::HandlerError => "HANDLER_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::CircuitOpen => "CIRCUIT_OPEN",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::SessionExists => "SESSION_EXISTS",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A taxonomic command failure: machine-readable kind plus the
/// human-readable message that ends up in the response `error` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandError {
    pub kind: ErrorKind,
    pub message: String,
}

impl CommandError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for CommandError {}
