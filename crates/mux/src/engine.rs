// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Execution engine: the admission pipeline and per-lane serializer.
//!
//! Admission (replay consultation, in-flight reservation, rate charge,
//! lane entry) runs synchronously in the transport read loop so lane
//! order equals arrival order. Everything from `command_accepted`
//! onward runs when the command reaches the head of its lane.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{oneshot, Notify};

use crate::breaker::{Breakers, CircuitBreaker};
use crate::classify::{mutates, timeout_class, TimeoutClass};
use crate::config::MuxConfig;
use crate::error::{CommandError, ErrorKind};
use crate::events::Hub;
use crate::governor::Governor;
use crate::lane::{LaneTicket, Lanes};
use crate::manager::SessionRecord;
use crate::metrics::Metrics;
use crate::protocol::{
    Command, CommandFinished, CommandPayload, Response, ResponseData, ServerMessage,
};
use crate::replay::{DepStatus, Reservation, ReplayCheck, ReplayStore};
use crate::storage;
use crate::transport::ConnHandle;
use crate::uibroker::{UiBroker, UiOutcome};
use crate::validate::AdmittedCommand;
use crate::version::VersionStore;

/// Session lookup capability. Implemented by the registry; kept as a
/// trait so the engine has no manager dependency and tests can
/// substitute doubles.
pub trait SessionResolver: Send + Sync {
    fn get_session(&self, session_id: &str) -> Option<Arc<SessionRecord>>;
}

/// Server-lane command handlers (registry and server state
/// operations). Implemented by the session manager.
#[async_trait]
pub trait ServerCommands: Send + Sync {
    async fn run(
        &self,
        conn: &Arc<ConnHandle>,
        cmd: &Command,
    ) -> Result<Option<ResponseData>, CommandError>;
}

/// Result of submitting one admitted command.
pub enum Submission {
    /// Settled at admission (replay hit, conflict, refusal).
    Ready(Response),
    /// Executing; the response arrives on the receiver.
    Pending(oneshot::Receiver<Response>),
}

/// Lane placement recorded for in-flight bookkeeping. Aborts and
/// extension-UI responses bypass lane serialization (each targets a
/// command that may be holding the lane) and carry the reserved
/// `direct` label.
struct Placement {
    lane: String,
    seq: u64,
    ticket: Option<LaneTicket>,
}

/// Whether this command must run immediately instead of queueing on
/// its session lane.
fn bypasses_lane(payload: &CommandPayload) -> bool {
    matches!(
        payload,
        CommandPayload::ExtensionUiResponse { .. }
            | CommandPayload::Abort
            | CommandPayload::AbortBash
            | CommandPayload::AbortCompaction
            | CommandPayload::AbortRetry
    )
}

pub struct Engine {
    pub config: MuxConfig,
    pub replay: Arc<ReplayStore>,
    pub versions: Arc<VersionStore>,
    pub governor: Arc<Governor>,
    pub breakers: Arc<Breakers>,
    pub lanes: Arc<Lanes>,
    pub hub: Arc<Hub>,
    pub metrics: Arc<Metrics>,
    resolver: Arc<dyn SessionResolver>,
    server: Arc<dyn ServerCommands>,
    broker: Arc<UiBroker>,
    draining: AtomicBool,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: MuxConfig,
        replay: Arc<ReplayStore>,
        versions: Arc<VersionStore>,
        governor: Arc<Governor>,
        breakers: Arc<Breakers>,
        lanes: Arc<Lanes>,
        hub: Arc<Hub>,
        metrics: Arc<Metrics>,
        resolver: Arc<dyn SessionResolver>,
        server: Arc<dyn ServerCommands>,
        broker: Arc<UiBroker>,
    ) -> Self {
        Self {
            config,
            replay,
            versions,
            governor,
            breakers,
            lanes,
            hub,
            metrics,
            resolver,
            server,
            broker,
            draining: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    fn accepted(&self, admitted: &AdmittedCommand) {
        self.hub.emit(ServerMessage::CommandAccepted {
            command_id: admitted.command_id.clone(),
            command_type: admitted.command.payload.name().to_owned(),
            session_id: admitted.command.session_id.clone(),
        });
    }

    fn finished(&self, admitted: &AdmittedCommand, resp: &Response) {
        self.hub.emit(ServerMessage::CommandFinished(CommandFinished::from_response(
            &admitted.command_id,
            admitted.command.session_id.as_deref(),
            resp,
        )));
    }

    /// Settle at admission: emit the lifecycle pair around an
    /// already-terminal response.
    fn settle(&self, admitted: &AdmittedCommand, resp: Response) -> Submission {
        self.accepted(admitted);
        self.finished(admitted, &resp);
        Submission::Ready(resp)
    }

    /// Admit one validated command. Runs synchronously (lock-only, no
    /// suspension) so callers preserve arrival order into the lanes.
    pub fn submit(self: &Arc<Self>, conn: Arc<ConnHandle>, admitted: AdmittedCommand) -> Submission {
        let cmd = &admitted.command;
        let ctype = cmd.payload.name();

        if self.draining.load(Ordering::Acquire) {
            Metrics::incr(&self.metrics.commands_rejected);
            let err = CommandError::new(ErrorKind::ShuttingDown, "server is shutting down");
            return Submission::Ready(Response::fail(ctype, cmd.id.clone(), &err));
        }

        // Replay consultation: hits and conflicts settle without
        // executing and without charging the rate limit.
        match self.replay.check(cmd, &admitted.fingerprint) {
            ReplayCheck::Hit(resp) => {
                Metrics::incr(&self.metrics.replays_served);
                return self.settle(&admitted, resp);
            }
            ReplayCheck::Conflict(err) => {
                Metrics::incr(&self.metrics.fingerprint_conflicts);
                let resp = Response::fail(ctype, cmd.id.clone(), &err);
                return self.settle(&admitted, resp);
            }
            ReplayCheck::Miss => {}
        }

        let placement = self.place(cmd);

        // In-flight reservation for explicit IDs: coalesce duplicate
        // retries, surface conflicts, reject (never evict) when full.
        if admitted.explicit_id {
            match self.replay.reserve(
                &admitted.command_id,
                &admitted.fingerprint,
                &placement.lane,
                placement.seq,
            ) {
                Reservation::New => {}
                Reservation::Joined(rx) => {
                    self.abandon(placement);
                    Metrics::incr(&self.metrics.duplicates_coalesced);
                    self.accepted(&admitted);
                    return self.join(admitted, rx);
                }
                Reservation::Completed(resp) => {
                    self.abandon(placement);
                    Metrics::incr(&self.metrics.replays_served);
                    return self.settle(&admitted, resp);
                }
                Reservation::Conflict(err) => {
                    self.abandon(placement);
                    Metrics::incr(&self.metrics.fingerprint_conflicts);
                    let resp = Response::fail(ctype, cmd.id.clone(), &err);
                    return self.settle(&admitted, resp);
                }
                Reservation::Full => {
                    self.abandon(placement);
                    Metrics::incr(&self.metrics.commands_rejected);
                    let err = CommandError::new(
                        ErrorKind::InFlightTableFull,
                        "in-flight command table is full",
                    );
                    let resp = Response::fail(ctype, cmd.id.clone(), &err);
                    return self.settle(&admitted, resp);
                }
            }
        }

        // Rate limit: a refusal is a terminal outcome and is stored,
        // so retries of the same ID replay it for free.
        if let Err(err) = self.governor.try_charge(cmd.scope()) {
            Metrics::incr(&self.metrics.rate_limited);
            let resp = Response::fail(ctype, cmd.id.clone(), &err);
            self.replay.store_outcome(cmd, &admitted.fingerprint, &resp);
            self.abandon(placement);
            return self.settle(&admitted, resp);
        }

        Metrics::incr(&self.metrics.commands_admitted);
        self.in_flight.fetch_add(1, Ordering::AcqRel);

        let engine = Arc::clone(self);
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let resp = engine.run_pipeline(conn, &admitted, placement).await;
            engine.in_flight.fetch_sub(1, Ordering::AcqRel);
            engine.idle.notify_waiters();
            let _ = tx.send(resp);
        });
        Submission::Pending(rx)
    }

    fn place(&self, cmd: &Command) -> Placement {
        if bypasses_lane(&cmd.payload) {
            return Placement { lane: "direct".to_owned(), seq: 0, ticket: None };
        }
        let ticket = self.lanes.enter(&cmd.lane());
        Placement { lane: ticket.lane.clone(), seq: ticket.seq, ticket: Some(ticket) }
    }

    fn abandon(&self, placement: Placement) {
        if let Some(ticket) = placement.ticket {
            ticket.abandon(&self.lanes);
        }
    }

    /// A duplicate retry joined an in-flight execution: await its
    /// stored outcome and finish as a replay.
    fn join(
        self: &Arc<Self>,
        admitted: AdmittedCommand,
        mut rx: tokio::sync::watch::Receiver<Option<Response>>,
    ) -> Submission {
        let engine = Arc::clone(self);
        let (tx, out) = oneshot::channel();
        tokio::spawn(async move {
            let resp = match rx.wait_for(|v| v.is_some()).await {
                Ok(guard) => match guard.as_ref() {
                    Some(resp) => resp.replay(),
                    None => engine.lost_outcome(&admitted),
                },
                Err(_) => engine.lost_outcome(&admitted),
            };
            engine.finished(&admitted, &resp);
            let _ = tx.send(resp);
        });
        Submission::Pending(out)
    }

    /// The original execution vanished without storing an outcome.
    /// This breaks the single-store invariant; surface it rather than
    /// hanging the retry.
    fn lost_outcome(&self, admitted: &AdmittedCommand) -> Response {
        self.metrics.breach("engine.join.lost_outcome");
        let err = CommandError::new(
            ErrorKind::HandlerError,
            format!("in-flight outcome for {} was lost", admitted.command_id),
        );
        Response::fail(admitted.command.payload.name(), admitted.command.id.clone(), &err)
    }

    /// Everything from `command_accepted` to the stored outcome,
    /// executed at the head of the command's lane.
    async fn run_pipeline(
        &self,
        conn: Arc<ConnHandle>,
        admitted: &AdmittedCommand,
        mut placement: Placement,
    ) -> Response {
        if let Some(ref mut ticket) = placement.ticket {
            ticket.wait_turn().await;
        }

        self.accepted(admitted);

        let mut resp = self.perform(&conn, admitted, &placement).await;
        if let Some(ref id) = admitted.command.id {
            resp.id = Some(id.clone());
        }

        if resp.success {
            Metrics::incr(&self.metrics.commands_succeeded);
        } else {
            Metrics::incr(&self.metrics.commands_failed);
        }

        // The outcome is stored before anyone can observe the
        // response; a retry arriving after this point replays it.
        self.replay.store_outcome(&admitted.command, &admitted.fingerprint, &resp);
        self.finished(admitted, &resp);

        if let Some(ticket) = placement.ticket.take() {
            ticket.complete(&self.lanes);
        }
        resp
    }

    /// Dependency wait, precondition, breaker guard, dispatch with
    /// timeout, version bump.
    async fn perform(
        &self,
        conn: &Arc<ConnHandle>,
        admitted: &AdmittedCommand,
        placement: &Placement,
    ) -> Response {
        let cmd = &admitted.command;
        let ctype = cmd.payload.name();

        if let Err(err) = self.wait_dependencies(cmd, placement).await {
            Metrics::incr(&self.metrics.dependency_failures);
            return Response::fail(ctype, cmd.id.clone(), &err);
        }

        // Session existence + optimistic concurrency.
        let session = if cmd.payload.is_server() {
            None
        } else {
            let session_id = cmd.session_id.as_deref().unwrap_or_default();
            if let Err(err) = self.versions.precheck(session_id, cmd.if_session_version) {
                return Response::fail(ctype, cmd.id.clone(), &err);
            }
            match self.resolver.get_session(session_id) {
                Some(record) => Some(record),
                None => {
                    let err = CommandError::new(
                        ErrorKind::SessionNotFound,
                        format!("session not found: {session_id}"),
                    );
                    return Response::fail(ctype, cmd.id.clone(), &err);
                }
            }
        };

        // Circuit-breaker guard.
        let guard = match self.breaker_guard(cmd, session.as_deref()) {
            Ok(guard) => guard,
            Err(err) => {
                Metrics::incr(&self.metrics.circuit_rejections);
                return Response::fail(ctype, cmd.id.clone(), &err);
            }
        };

        self.hub.emit(ServerMessage::CommandStarted {
            command_id: admitted.command_id.clone(),
            command_type: ctype.to_owned(),
            session_id: cmd.session_id.clone(),
        });

        // Dispatch under the class budget, with side-channel
        // cancellation on expiry.
        let started = Instant::now();
        let budget = timeout_class(&cmd.payload).budget(&self.config);
        let dispatched = self.dispatch(conn, cmd, session.clone());
        let (result, timed_out) = match budget {
            Some(budget) => match tokio::time::timeout(budget, dispatched).await {
                Ok(result) => (result, false),
                Err(_) => {
                    if let Some(ref record) = session {
                        side_channel_abort(&cmd.payload, record);
                    }
                    let err = CommandError::new(
                        ErrorKind::Timeout,
                        format!("{} timed out after {}ms", ctype, budget.as_millis()),
                    );
                    (Err(err), true)
                }
            },
            None => (dispatched.await, false),
        };
        let latency = started.elapsed();

        self.record_breaker(guard, &result, timed_out, latency);

        match result {
            Ok(data) => {
                let mut resp = Response::ok(ctype, cmd.id.clone(), data);
                // Only mutating successes bump the version.
                if mutates(&cmd.payload) {
                    if let Some(session_id) = cmd.session_id.as_deref() {
                        if let Some(version) =
                            self.versions.bump_if_mutating(session_id, &cmd.payload)
                        {
                            resp = resp.with_version(version);
                        }
                    }
                }
                resp
            }
            Err(err) => {
                let mut resp = Response::fail(ctype, cmd.id.clone(), &err);
                if timed_out {
                    Metrics::incr(&self.metrics.commands_timed_out);
                    resp.timed_out = Some(true);
                }
                resp
            }
        }
    }

    /// Resolve every `dependsOn` entry to a terminal outcome.
    async fn wait_dependencies(
        &self,
        cmd: &Command,
        placement: &Placement,
    ) -> Result<(), CommandError> {
        if cmd.depends_on.is_empty() {
            return Ok(());
        }
        let deadline = Instant::now() + self.config.dep_wait_timeout();

        for dep in &cmd.depends_on {
            match self.replay.dep_status(dep) {
                DepStatus::Done(resp) => {
                    if !resp.success {
                        return Err(CommandError::new(
                            ErrorKind::DependencyFailed,
                            format!("dependency {dep} failed"),
                        ));
                    }
                }
                DepStatus::InFlight { lane, lane_seq, mut rx } => {
                    // A dependency queued behind us on our own lane can
                    // never finish while we hold the lane head.
                    if lane == placement.lane && lane_seq > placement.seq {
                        return Err(CommandError::new(
                            ErrorKind::LaneInversion,
                            format!("dependency {dep} is queued behind this command"),
                        ));
                    }
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    let waited =
                        tokio::time::timeout(remaining, rx.wait_for(|v| v.is_some())).await;
                    match waited {
                        Ok(Ok(outcome)) => {
                            let success =
                                outcome.as_ref().map(|r| r.success).unwrap_or_default();
                            if !success {
                                return Err(CommandError::new(
                                    ErrorKind::DependencyFailed,
                                    format!("dependency {dep} failed"),
                                ));
                            }
                        }
                        Ok(Err(_)) => {
                            return Err(CommandError::new(
                                ErrorKind::DependencyUnknown,
                                format!("dependency {dep} vanished without an outcome"),
                            ));
                        }
                        Err(_) => {
                            return Err(CommandError::new(
                                ErrorKind::DependencyTimeout,
                                format!("timed out waiting for dependency {dep}"),
                            ));
                        }
                    }
                }
                DepStatus::Unknown => {
                    return Err(CommandError::new(
                        ErrorKind::DependencyUnknown,
                        format!("dependency {dep} is unknown"),
                    ));
                }
            }
        }
        Ok(())
    }

    fn breaker_guard(
        &self,
        cmd: &Command,
        session: Option<&SessionRecord>,
    ) -> Result<BreakerGuard, CommandError> {
        match cmd.payload {
            CommandPayload::Prompt { .. }
            | CommandPayload::Steer { .. }
            | CommandPayload::FollowUp { .. }
            | CommandPayload::Compact => {
                let provider = session
                    .map(|record| record.provider.read().clone())
                    .unwrap_or_else(|| "default".to_owned());
                let breaker = self.breakers.llm(&provider);
                if !breaker.allow() {
                    return Err(CommandError::new(
                        ErrorKind::CircuitOpen,
                        format!("circuit open for provider {provider}"),
                    ));
                }
                Ok(BreakerGuard::Llm(breaker))
            }
            CommandPayload::Bash { .. } => {
                let session_id = cmd.session_id.clone().unwrap_or_default();
                if !self.breakers.bash_allow(&session_id) {
                    return Err(CommandError::new(ErrorKind::CircuitOpen, "bash circuit open"));
                }
                Ok(BreakerGuard::Bash(session_id))
            }
            _ => Ok(BreakerGuard::None),
        }
    }

    fn record_breaker(
        &self,
        guard: BreakerGuard,
        result: &Result<Option<ResponseData>, CommandError>,
        timed_out: bool,
        latency: Duration,
    ) {
        match guard {
            BreakerGuard::Llm(breaker) => {
                if timed_out || result.is_err() {
                    breaker.record_failure();
                } else {
                    breaker.record_success(latency);
                }
            }
            BreakerGuard::Bash(session_id) => {
                // Timeout-only accounting: a bash command that ran to a
                // non-zero exit is a legitimate outcome.
                let agent_timed_out = matches!(
                    result,
                    Ok(Some(ResponseData::Agent(value)))
                        if value.get("timedOut").and_then(|v| v.as_bool()) == Some(true)
                );
                self.breakers.bash_record(&session_id, timed_out || agent_timed_out, latency);
            }
            BreakerGuard::None => {}
        }
    }

    /// Handler selection: server commands go to the manager; the
    /// extension-UI response resolves the broker; everything else is a
    /// pass-through to the agent session.
    async fn dispatch(
        &self,
        conn: &Arc<ConnHandle>,
        cmd: &Command,
        session: Option<Arc<SessionRecord>>,
    ) -> Result<Option<ResponseData>, CommandError> {
        if cmd.payload.is_server() {
            return self.server.run(conn, cmd).await;
        }

        if let CommandPayload::ExtensionUiResponse {
            ref request_id,
            ref value,
            confirmed,
            ref responses,
            cancelled,
        } = cmd.payload
        {
            let outcome = if cancelled {
                UiOutcome::Cancelled
            } else if let Some(value) = value.clone() {
                UiOutcome::Value(value)
            } else if let Some(confirmed) = confirmed {
                UiOutcome::Value(json!(confirmed))
            } else if let Some(responses) = responses.clone() {
                UiOutcome::Value(responses)
            } else {
                UiOutcome::Cancelled
            };
            if !self.broker.resolve(request_id, outcome) {
                return Err(CommandError::new(
                    ErrorKind::HandlerError,
                    format!("no pending UI request: {request_id}"),
                ));
            }
            return Ok(Some(ResponseData::Agent(json!({ "resolved": true }))));
        }

        let Some(record) = session else {
            return Err(CommandError::new(
                ErrorKind::SessionNotFound,
                "session handle lost before dispatch",
            ));
        };

        // Abort dispatchers fire the side channel first; the in-flight
        // target may be holding the session lane.
        match &cmd.payload {
            CommandPayload::Abort => record.agent.abort(),
            CommandPayload::AbortBash => record.agent.abort_bash(),
            _ => {}
        }

        let value = record
            .agent
            .call(&cmd.payload)
            .await
            .map_err(|e| CommandError::new(ErrorKind::HandlerError, e.to_string()))?;

        // Post-dispatch bookkeeping for a few pass-throughs.
        match &cmd.payload {
            CommandPayload::SetModel { provider, .. } => {
                *record.provider.write() = provider.clone();
                Ok(Some(ResponseData::Agent(value)))
            }
            CommandPayload::ExportHtml { path: Some(path) } => {
                let target = storage::check_export_path(path)?;
                let html = value.get("html").and_then(|v| v.as_str()).unwrap_or_default();
                let bytes = storage::write_atomic(&target, html.as_bytes()).map_err(|e| {
                    CommandError::new(ErrorKind::HandlerError, format!("export failed: {e}"))
                })?;
                Ok(Some(ResponseData::Exported {
                    path: target.to_string_lossy().into_owned(),
                    bytes,
                }))
            }
            _ => Ok(Some(ResponseData::Agent(value))),
        }
    }

    // -- Shutdown -------------------------------------------------------------

    /// Stop admitting new commands. Idempotent.
    pub fn begin_drain(&self) {
        self.draining.store(true, Ordering::Release);
    }

    /// Wait until in-flight commands settle, up to `budget`. Returns
    /// whether the engine fully drained.
    pub async fn drain(&self, budget: Duration) -> bool {
        let deadline = Instant::now() + budget;
        while self.in_flight.load(Ordering::Acquire) > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let _ = tokio::time::timeout(remaining, self.idle.notified()).await;
        }
        true
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }
}

enum BreakerGuard {
    Llm(Arc<CircuitBreaker>),
    Bash(String),
    None,
}

/// Side-channel cancellation on timeout: abort the LLM turn for
/// long-class commands. Bash runs without a timer; its own abort
/// command signals it.
fn side_channel_abort(payload: &CommandPayload, record: &SessionRecord) {
    match timeout_class(payload) {
        TimeoutClass::Long => record.agent.abort(),
        TimeoutClass::Short | TimeoutClass::None => {}
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
