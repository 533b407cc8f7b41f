// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session manager: registry, subscriber fan-out, and the server-lane
//! command handlers.
//!
//! The manager exclusively owns session records. Create and delete run
//! under the per-ID session lock; command execution does not.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::json;

use crate::backend::{AgentBackend, AgentSession};
use crate::breaker::Breakers;
use crate::engine::{ServerCommands, SessionResolver};
use crate::error::{CommandError, ErrorKind};
use crate::events::Hub;
use crate::governor::Governor;
use crate::metrics::Metrics;
use crate::protocol::{
    Command, CommandPayload, ResponseData, ServerMessage, SessionInfo,
};
use crate::replay::ReplayStore;
use crate::session_lock::SessionLockMap;
use crate::storage;
use crate::transport::{ConnHandle, ConnId};
use crate::uibroker::{SessionEventSink, UiBroker, UiContext};
use crate::version::VersionStore;

/// One live session: the agent handle plus multiplexer bookkeeping.
pub struct SessionRecord {
    pub session_id: String,
    pub agent: Arc<dyn AgentSession>,
    pub created_at: Instant,
    pub created_at_ms: u64,
    /// Current model provider; keys the LLM breaker.
    pub provider: RwLock<String>,
    /// Connections receiving this session's events.
    pub subscribers: RwLock<HashMap<ConnId, Arc<ConnHandle>>>,
    /// Cancels the event fan-out task.
    pub cancel: tokio_util::sync::CancellationToken,
}

/// Shared session table. Split from the manager so the execution
/// engine can resolve sessions without a manager dependency.
pub struct Registry {
    sessions: RwLock<HashMap<String, Arc<SessionRecord>>>,
    /// Reverse index for connection teardown.
    by_conn: RwLock<HashMap<ConnId, HashSet<String>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self { sessions: RwLock::new(HashMap::new()), by_conn: RwLock::new(HashMap::new()) }
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<SessionRecord>> {
        self.sessions.read().get(session_id).map(Arc::clone)
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.read().contains_key(session_id)
    }

    pub fn count(&self) -> usize {
        self.sessions.read().len()
    }

    fn insert(&self, record: Arc<SessionRecord>) {
        self.sessions.write().insert(record.session_id.clone(), record);
    }

    fn remove(&self, session_id: &str) -> Option<Arc<SessionRecord>> {
        let record = self.sessions.write().remove(session_id)?;
        let mut by_conn = self.by_conn.write();
        for subscriptions in by_conn.values_mut() {
            subscriptions.remove(session_id);
        }
        by_conn.retain(|_, subs| !subs.is_empty());
        Some(record)
    }

    /// Subscribe a connection to a session's events.
    fn subscribe(&self, record: &SessionRecord, conn: &Arc<ConnHandle>) {
        record.subscribers.write().insert(conn.id, Arc::clone(conn));
        self.by_conn
            .write()
            .entry(conn.id)
            .or_default()
            .insert(record.session_id.clone());
    }

    /// Remove a closed connection from every subscriber set.
    pub fn drop_connection(&self, conn_id: ConnId) {
        let Some(session_ids) = self.by_conn.write().remove(&conn_id) else {
            return;
        };
        let sessions = self.sessions.read();
        for session_id in session_ids {
            if let Some(record) = sessions.get(&session_id) {
                record.subscribers.write().remove(&conn_id);
            }
        }
    }

    pub fn is_subscribed(&self, conn_id: ConnId, session_id: &str) -> bool {
        self.by_conn.read().get(&conn_id).is_some_and(|subs| subs.contains(session_id))
    }

    fn snapshot(&self) -> Vec<Arc<SessionRecord>> {
        self.sessions.read().values().map(Arc::clone).collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionEventSink for Registry {
    /// Fan one session event out to the session's subscribers.
    /// Iterates a snapshot: the live set may mutate concurrently, and
    /// a send failure must not interrupt the rest of the fan-out.
    fn send_session_event(&self, session_id: &str, event: serde_json::Value) {
        let Some(record) = self.get(session_id) else {
            return;
        };
        let subscribers: Vec<Arc<ConnHandle>> =
            record.subscribers.read().values().map(Arc::clone).collect();
        let msg = ServerMessage::Event { session_id: session_id.to_owned(), event };
        for conn in subscribers {
            conn.send(&msg);
        }
    }
}

impl SessionResolver for Registry {
    fn get_session(&self, session_id: &str) -> Option<Arc<SessionRecord>> {
        self.get(session_id)
    }
}

// -- Manager ------------------------------------------------------------------

pub struct SessionManager {
    pub registry: Arc<Registry>,
    backend: Arc<dyn AgentBackend>,
    governor: Arc<Governor>,
    versions: Arc<VersionStore>,
    breakers: Arc<Breakers>,
    replay: Arc<ReplayStore>,
    locks: SessionLockMap,
    pub broker: Arc<UiBroker>,
    hub: Arc<Hub>,
    metrics: Arc<Metrics>,
    started_at: Instant,
    shutdown: tokio_util::sync::CancellationToken,
}

impl SessionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backend: Arc<dyn AgentBackend>,
        registry: Arc<Registry>,
        governor: Arc<Governor>,
        versions: Arc<VersionStore>,
        breakers: Arc<Breakers>,
        replay: Arc<ReplayStore>,
        broker: Arc<UiBroker>,
        hub: Arc<Hub>,
        metrics: Arc<Metrics>,
        shutdown: tokio_util::sync::CancellationToken,
    ) -> Self {
        Self {
            registry,
            backend,
            governor,
            versions,
            breakers,
            replay,
            locks: SessionLockMap::new(Arc::clone(&metrics)),
            broker,
            hub,
            metrics,
            started_at: Instant::now(),
            shutdown,
        }
    }

    /// Create a session under the per-ID lock: duplicate check,
    /// governor slot, backend build, UI binding, fan-out wiring.
    pub async fn create_session(&self, session_id: &str) -> Result<(), CommandError> {
        let _guard = self.locks.acquire(session_id).await?;

        if self.registry.contains(session_id) {
            return Err(CommandError::new(
                ErrorKind::SessionExists,
                format!("session already exists: {session_id}"),
            ));
        }

        self.governor.try_reserve_session_slot()?;

        let ui = UiContext::new(
            Arc::clone(&self.broker),
            Arc::clone(&self.registry) as Arc<dyn SessionEventSink>,
            session_id,
        );
        let agent = match self.backend.open(session_id, ui).await {
            Ok(agent) => agent,
            Err(e) => {
                self.governor.release_session_slot();
                return Err(CommandError::new(
                    ErrorKind::HandlerError,
                    format!("backend failed to build session: {e}"),
                ));
            }
        };

        self.install(session_id, agent);
        Ok(())
    }

    /// Restore a session from a validated stored-session path.
    pub async fn load_session(&self, session_id: &str, path: &str) -> Result<(), CommandError> {
        let path = storage::check_session_path(path)?;
        let _guard = self.locks.acquire(session_id).await?;

        if self.registry.contains(session_id) {
            return Err(CommandError::new(
                ErrorKind::SessionExists,
                format!("session already exists: {session_id}"),
            ));
        }

        self.governor.try_reserve_session_slot()?;

        let ui = UiContext::new(
            Arc::clone(&self.broker),
            Arc::clone(&self.registry) as Arc<dyn SessionEventSink>,
            session_id,
        );
        let agent = match self.backend.load(session_id, &path, ui).await {
            Ok(agent) => agent,
            Err(e) => {
                self.governor.release_session_slot();
                return Err(CommandError::new(
                    ErrorKind::HandlerError,
                    format!("backend failed to load session: {e}"),
                ));
            }
        };

        self.install(session_id, agent);
        Ok(())
    }

    fn install(&self, session_id: &str, agent: Arc<dyn AgentSession>) {
        let record = Arc::new(SessionRecord {
            session_id: session_id.to_owned(),
            agent: Arc::clone(&agent),
            created_at: Instant::now(),
            created_at_ms: crate::epoch_ms(),
            provider: RwLock::new(self.backend.default_provider()),
            subscribers: RwLock::new(HashMap::new()),
            cancel: self.shutdown.child_token(),
        });

        self.versions.insert(session_id);
        self.registry.insert(Arc::clone(&record));
        spawn_fanout(Arc::clone(&self.registry), record);

        Metrics::incr(&self.metrics.sessions_created);
        self.hub.emit(ServerMessage::SessionCreated { session_id: session_id.to_owned() });
        tracing::info!(session_id, "session created");
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<(), CommandError> {
        let _guard = self.locks.acquire(session_id).await?;

        let Some(record) = self.registry.remove(session_id) else {
            return Err(CommandError::new(
                ErrorKind::SessionNotFound,
                format!("session not found: {session_id}"),
            ));
        };

        record.cancel.cancel();
        record.agent.close().await;
        self.versions.remove(session_id);
        self.breakers.forget_session(session_id);
        self.governor.release_session_slot();

        Metrics::incr(&self.metrics.sessions_deleted);
        self.hub.emit(ServerMessage::SessionDeleted { session_id: session_id.to_owned() });
        tracing::info!(session_id, "session deleted");
        Ok(())
    }

    /// Subscribe `conn` to a session's events. Subscription happens
    /// only on success.
    pub fn switch_session(
        &self,
        conn: &Arc<ConnHandle>,
        session_id: &str,
    ) -> Result<(), CommandError> {
        let Some(record) = self.registry.get(session_id) else {
            return Err(CommandError::new(
                ErrorKind::SessionNotFound,
                format!("session not found: {session_id}"),
            ));
        };
        self.registry.subscribe(&record, conn);
        Ok(())
    }

    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .registry
            .snapshot()
            .into_iter()
            .map(|record| SessionInfo {
                session_id: record.session_id.clone(),
                created_at_ms: record.created_at_ms,
                version: self.versions.current(&record.session_id).unwrap_or_default(),
                subscribers: record.subscribers.read().len(),
            })
            .collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        sessions
    }

    /// Sessions past the lifetime limit, for the sweeper.
    pub fn sessions_older_than(&self, limit: Duration) -> Vec<String> {
        self.registry
            .snapshot()
            .into_iter()
            .filter(|record| record.created_at.elapsed() >= limit)
            .map(|record| record.session_id.clone())
            .collect()
    }

    /// Delete every session; used by shutdown drain.
    pub async fn close_all(&self) {
        for record in self.registry.snapshot() {
            if let Err(e) = self.delete_session(&record.session_id).await {
                tracing::debug!(session_id = %record.session_id, err = %e, "shutdown delete");
            }
        }
    }

    pub fn prune_locks(&self) {
        self.locks.prune_idle();
    }

    fn metrics_data(&self) -> ResponseData {
        ResponseData::Metrics {
            metrics: json!({
                "counters": self.metrics.snapshot(),
                "replay": self.replay.stats(),
                "governor": self.governor.stats(),
                "breakers": self.breakers.snapshot(),
                "sessions": self.registry.count(),
                "uptimeMs": self.started_at.elapsed().as_millis() as u64,
            }),
        }
    }

    fn health_data(&self) -> ResponseData {
        ResponseData::Health {
            status: "running".to_owned(),
            uptime_ms: self.started_at.elapsed().as_millis() as u64,
            session_count: self.registry.count(),
            connection_count: self.governor.connection_count(),
            shutting_down: self.shutdown.is_cancelled(),
        }
    }
}

#[async_trait]
impl ServerCommands for SessionManager {
    async fn run(
        &self,
        conn: &Arc<ConnHandle>,
        cmd: &Command,
    ) -> Result<Option<ResponseData>, CommandError> {
        let session_id = cmd.session_id.as_deref().unwrap_or_default();
        match &cmd.payload {
            CommandPayload::ListSessions => {
                Ok(Some(ResponseData::Sessions { sessions: self.list_sessions() }))
            }
            CommandPayload::CreateSession => {
                self.create_session(session_id).await?;
                Ok(Some(ResponseData::Agent(json!({ "sessionId": session_id }))))
            }
            CommandPayload::DeleteSession => {
                self.delete_session(session_id).await?;
                Ok(Some(ResponseData::Agent(json!({ "sessionId": session_id }))))
            }
            CommandPayload::SwitchSession => {
                self.switch_session(conn, session_id)?;
                Ok(Some(ResponseData::Agent(json!({
                    "sessionId": session_id,
                    "subscribed": true,
                }))))
            }
            CommandPayload::LoadSession { path } => {
                let session_id = match cmd.session_id {
                    Some(ref id) => id.clone(),
                    None => derive_session_id(path),
                };
                self.load_session(&session_id, path).await?;
                Ok(Some(ResponseData::Agent(json!({ "sessionId": session_id, "path": path }))))
            }
            CommandPayload::ListStoredSessions => {
                Ok(Some(ResponseData::StoredSessions { files: storage::list_stored_sessions() }))
            }
            CommandPayload::GetMetrics => Ok(Some(self.metrics_data())),
            CommandPayload::HealthCheck => Ok(Some(self.health_data())),
            other => Err(CommandError::new(
                ErrorKind::UnknownCommand,
                format!("{} is not a server command", other.name()),
            )),
        }
    }
}

/// Session ID for a loaded file when the client did not name one.
fn derive_session_id(path: &str) -> String {
    let stem = std::path::Path::new(path)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("loaded");
    let cleaned: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!("{cleaned}-{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
}

/// Forward the agent's event stream to the session's subscribers until
/// the session is cancelled.
fn spawn_fanout(registry: Arc<Registry>, record: Arc<SessionRecord>) {
    let mut events = record.agent.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = record.cancel.cancelled() => break,
                event = events.recv() => {
                    match event {
                        Ok(event) => {
                            registry.send_session_event(&record.session_id, event);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(
                                session_id = %record.session_id,
                                skipped,
                                "event fan-out lagged"
                            );
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
    });
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
