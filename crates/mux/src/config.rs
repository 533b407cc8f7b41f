// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

/// Configuration for the pimux server.
#[derive(Debug, Clone, clap::Args)]
pub struct MuxConfig {
    /// Host to bind on.
    #[arg(long, default_value = "127.0.0.1", env = "PI_MUX_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 3141, env = "PI_MUX_PORT")]
    pub port: u16,

    /// Also serve newline-delimited JSON on stdin/stdout.
    #[arg(long, env = "PI_MUX_STDIO")]
    pub stdio: bool,

    /// Shared token for WebSocket auth. If unset, auth is disabled.
    #[arg(long, env = "PI_MUX_AUTH_TOKEN")]
    pub auth_token: Option<String>,

    /// Maximum inbound frame size in bytes; larger frames are rejected
    /// before parsing.
    #[arg(long, default_value_t = 10 * 1024 * 1024, env = "PI_MUX_MAX_MESSAGE_BYTES")]
    pub max_message_bytes: usize,

    /// Maximum concurrent sessions.
    #[arg(long, default_value_t = 100, env = "PI_MUX_MAX_SESSIONS")]
    pub max_sessions: usize,

    /// Maximum concurrent client connections.
    #[arg(long, default_value_t = 1000, env = "PI_MUX_MAX_CONNECTIONS")]
    pub max_connections: usize,

    /// In-flight reservation table capacity. When full, new unique-ID
    /// commands are rejected rather than evicting existing entries.
    #[arg(long, default_value_t = 10_000, env = "PI_MUX_MAX_IN_FLIGHT_COMMANDS")]
    pub max_in_flight_commands: usize,

    /// Stored command outcome capacity (LRU by completion time).
    #[arg(long, default_value_t = 2_000, env = "PI_MUX_MAX_COMMAND_OUTCOMES")]
    pub max_command_outcomes: usize,

    /// Idempotency-key entry lifetime in milliseconds.
    #[arg(long, default_value_t = 600_000, env = "PI_MUX_IDEMPOTENCY_TTL_MS")]
    pub idempotency_ttl_ms: u64,

    /// Rate limit: new executions per session per minute.
    #[arg(long, default_value_t = 100, env = "PI_MUX_RATE_LIMIT_PER_SESSION_PER_MIN")]
    pub rate_limit_per_session_per_min: usize,

    /// Rate limit: new executions across the whole server per minute.
    #[arg(long, default_value_t = 1000, env = "PI_MUX_RATE_LIMIT_GLOBAL_PER_MIN")]
    pub rate_limit_global_per_min: usize,

    /// Budget for short-class commands in milliseconds.
    #[arg(long, default_value_t = 30_000, env = "PI_MUX_SHORT_TIMEOUT_MS")]
    pub short_timeout_ms: u64,

    /// Budget for long-class (LLM-driven) commands in milliseconds.
    #[arg(long, default_value_t = 300_000, env = "PI_MUX_LONG_TIMEOUT_MS")]
    pub long_timeout_ms: u64,

    /// Maximum wait on a `dependsOn` entry in milliseconds.
    #[arg(long, default_value_t = 300_000, env = "PI_MUX_DEP_WAIT_TIMEOUT_MS")]
    pub dep_wait_timeout_ms: u64,

    /// WebSocket heartbeat interval in milliseconds.
    #[arg(long, default_value_t = 30_000, env = "PI_MUX_HEARTBEAT_MS")]
    pub heartbeat_ms: u64,

    /// Deadline for a pong after a ping, in milliseconds.
    #[arg(long, default_value_t = 10_000, env = "PI_MUX_PONG_DEADLINE_MS")]
    pub pong_deadline_ms: u64,

    /// Maximum session lifetime in milliseconds; 0 disables
    /// enforcement. The sweeper deletes sessions older than this.
    #[arg(long, default_value_t = 0, env = "PI_MUX_MAX_SESSION_LIFETIME_MS")]
    pub max_session_lifetime_ms: u64,

    /// Pending extension-UI request capacity.
    #[arg(long, default_value_t = 1000, env = "PI_MUX_PENDING_UI_MAX")]
    pub pending_ui_max: usize,

    /// Extension-UI round-trip timeout in milliseconds.
    #[arg(long, default_value_t = 120_000, env = "PI_MUX_UI_REQUEST_TIMEOUT_MS")]
    pub ui_request_timeout_ms: u64,

    /// Graceful-shutdown drain budget in milliseconds.
    #[arg(long, default_value_t = 10_000, env = "PI_MUX_DRAIN_TIMEOUT_MS")]
    pub drain_timeout_ms: u64,

    /// Background sweeper interval in milliseconds.
    #[arg(long, default_value_t = 30_000, env = "PI_MUX_SWEEP_INTERVAL_MS")]
    pub sweep_interval_ms: u64,

    /// LLM breaker: failures (plus slow samples) within the window
    /// that open the circuit.
    #[arg(long, default_value_t = 5, env = "PI_MUX_LLM_FAILURE_THRESHOLD")]
    pub llm_failure_threshold: usize,

    /// Bash breaker: per-session failure threshold.
    #[arg(long, default_value_t = 10, env = "PI_MUX_BASH_FAILURE_THRESHOLD")]
    pub bash_failure_threshold: usize,

    /// Bash breaker: global failure threshold.
    #[arg(long, default_value_t = 50, env = "PI_MUX_BASH_GLOBAL_FAILURE_THRESHOLD")]
    pub bash_global_failure_threshold: usize,

    /// Breaker rolling-window length in milliseconds.
    #[arg(long, default_value_t = 60_000, env = "PI_MUX_BREAKER_WINDOW_MS")]
    pub breaker_window_ms: u64,

    /// Time an open circuit waits before admitting half-open probes,
    /// in milliseconds.
    #[arg(long, default_value_t = 30_000, env = "PI_MUX_OPEN_TO_HALF_OPEN_MS")]
    pub open_to_half_open_ms: u64,

    /// Maximum concurrent half-open probes.
    #[arg(long, default_value_t = 3, env = "PI_MUX_HALF_OPEN_MAX_CALLS")]
    pub half_open_max_calls: usize,

    /// Consecutive probe successes that close the circuit.
    #[arg(long, default_value_t = 2, env = "PI_MUX_SUCCESS_THRESHOLD")]
    pub success_threshold: usize,

    /// Successful calls at or above this latency count as slow
    /// samples, in milliseconds.
    #[arg(long, default_value_t = 30_000, env = "PI_MUX_LATENCY_THRESHOLD_MS")]
    pub latency_threshold_ms: u64,
}

impl MuxConfig {
    pub fn short_timeout(&self) -> Duration {
        Duration::from_millis(self.short_timeout_ms)
    }

    pub fn long_timeout(&self) -> Duration {
        Duration::from_millis(self.long_timeout_ms)
    }

    pub fn dep_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.dep_wait_timeout_ms)
    }

    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_millis(self.idempotency_ttl_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn pong_deadline(&self) -> Duration {
        Duration::from_millis(self.pong_deadline_ms)
    }

    pub fn ui_request_timeout(&self) -> Duration {
        Duration::from_millis(self.ui_request_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn breaker_window(&self) -> Duration {
        Duration::from_millis(self.breaker_window_ms)
    }

    pub fn open_to_half_open(&self) -> Duration {
        Duration::from_millis(self.open_to_half_open_ms)
    }

    pub fn latency_threshold(&self) -> Duration {
        Duration::from_millis(self.latency_threshold_ms)
    }

    pub fn max_session_lifetime(&self) -> Option<Duration> {
        (self.max_session_lifetime_ms > 0)
            .then(|| Duration::from_millis(self.max_session_lifetime_ms))
    }
}

impl Default for MuxConfig {
    /// The same defaults the CLI serves, for library and test use.
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 3141,
            stdio: false,
            auth_token: None,
            max_message_bytes: 10 * 1024 * 1024,
            max_sessions: 100,
            max_connections: 1000,
            max_in_flight_commands: 10_000,
            max_command_outcomes: 2_000,
            idempotency_ttl_ms: 600_000,
            rate_limit_per_session_per_min: 100,
            rate_limit_global_per_min: 1000,
            short_timeout_ms: 30_000,
            long_timeout_ms: 300_000,
            dep_wait_timeout_ms: 300_000,
            heartbeat_ms: 30_000,
            pong_deadline_ms: 10_000,
            max_session_lifetime_ms: 0,
            pending_ui_max: 1000,
            ui_request_timeout_ms: 120_000,
            drain_timeout_ms: 10_000,
            sweep_interval_ms: 30_000,
            llm_failure_threshold: 5,
            bash_failure_threshold: 10,
            bash_global_failure_threshold: 50,
            breaker_window_ms: 60_000,
            open_to_half_open_ms: 30_000,
            half_open_max_calls: 3,
            success_threshold: 2,
            latency_threshold_ms: 30_000,
        }
    }
}
