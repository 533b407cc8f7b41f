// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! pimux: deterministic session multiplexer for pi agent sessions.
//!
//! One process fronts a backend coding-agent engine and exposes N
//! independent sessions over WebSocket and stdio. Commands are
//! validated, deduplicated by retry identity, serialized per lane,
//! and executed under rate limits, circuit breakers, and optimistic
//! concurrency; session events fan out to subscribed connections.

pub mod backend;
pub mod breaker;
pub mod classify;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod governor;
pub mod lane;
pub mod manager;
pub mod metrics;
pub mod protocol;
pub mod replay;
pub mod session_lock;
pub mod storage;
pub mod test_support;
pub mod transport;
pub mod uibroker;
pub mod validate;
pub mod version;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::backend::AgentBackend;
use crate::breaker::Breakers;
use crate::config::MuxConfig;
use crate::engine::Engine;
use crate::events::Hub;
use crate::governor::Governor;
use crate::lane::Lanes;
use crate::manager::{Registry, SessionManager};
use crate::metrics::Metrics;
use crate::protocol::ServerMessage;
use crate::replay::ReplayStore;
use crate::transport::Connections;
use crate::uibroker::UiBroker;
use crate::version::VersionStore;

/// Shared server state: configuration, composed subsystems, and the
/// shutdown token.
pub struct MuxState {
    pub config: MuxConfig,
    /// Cleared as the first step of shutdown, before anything else:
    /// new connections are refused while existing ones drain.
    pub accepting: AtomicBool,
    pub shutdown: CancellationToken,
    pub hub: Arc<Hub>,
    pub metrics: Arc<Metrics>,
    pub governor: Arc<Governor>,
    pub registry: Arc<Registry>,
    pub manager: Arc<SessionManager>,
    pub engine: Arc<Engine>,
    pub connections: Connections,
}

/// Wire every subsystem together. The backend is the only injected
/// collaborator; everything else is owned here.
pub fn build_state(config: MuxConfig, backend: Arc<dyn AgentBackend>) -> Arc<MuxState> {
    let shutdown = CancellationToken::new();
    let hub = Arc::new(Hub::new());
    let metrics = Arc::new(Metrics::new());
    let governor = Arc::new(Governor::new(
        config.rate_limit_per_session_per_min,
        config.rate_limit_global_per_min,
        config.max_sessions,
        config.max_connections,
        Arc::clone(&metrics),
    ));
    let versions = Arc::new(VersionStore::new());
    let replay = Arc::new(ReplayStore::new(
        config.max_command_outcomes,
        config.max_in_flight_commands,
        config.idempotency_ttl(),
    ));
    let breakers = Arc::new(Breakers::new(&config));
    let lanes = Arc::new(Lanes::new());
    let registry = Arc::new(Registry::new());
    let broker = Arc::new(UiBroker::new(
        config.pending_ui_max,
        config.ui_request_timeout(),
        Arc::clone(&metrics),
    ));

    let manager = Arc::new(SessionManager::new(
        backend,
        Arc::clone(&registry),
        Arc::clone(&governor),
        Arc::clone(&versions),
        Arc::clone(&breakers),
        Arc::clone(&replay),
        Arc::clone(&broker),
        Arc::clone(&hub),
        Arc::clone(&metrics),
        shutdown.clone(),
    ));

    let engine = Arc::new(Engine::new(
        config.clone(),
        replay,
        versions,
        Arc::clone(&governor),
        breakers,
        lanes,
        Arc::clone(&hub),
        Arc::clone(&metrics),
        Arc::clone(&registry) as Arc<dyn engine::SessionResolver>,
        Arc::clone(&manager) as Arc<dyn engine::ServerCommands>,
        broker,
    ));

    Arc::new(MuxState {
        config,
        accepting: AtomicBool::new(true),
        shutdown,
        hub,
        metrics,
        governor,
        registry,
        manager,
        engine,
        connections: Connections::new(),
    })
}

/// Run the server until shutdown.
pub async fn run(config: MuxConfig, backend: Arc<dyn AgentBackend>) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let stdio = config.stdio;
    let state = build_state(config, backend);

    governor::spawn_sweeper(Arc::clone(&state));

    if stdio {
        let stdio_state = Arc::clone(&state);
        tokio::spawn(async move {
            transport::stdio::run_stdio(stdio_state).await;
        });
    }

    // Ctrl-C begins the graceful drain.
    {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                graceful_shutdown(&state).await;
            }
        });
    }

    let router = transport::build_router(Arc::clone(&state));
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("pimux listening on {addr}");
    axum::serve(listener, router)
        .with_graceful_shutdown(state.shutdown.clone().cancelled_owned())
        .await?;

    Ok(())
}

/// Graceful shutdown, in order: stop accepting new connections,
/// broadcast `server_shutdown`, stop admitting new commands, drain
/// in-flight commands within the budget, close sessions, force-close.
/// Idempotent; only the first caller proceeds.
pub async fn graceful_shutdown(state: &Arc<MuxState>) {
    if !state.accepting.swap(false, Ordering::AcqRel) {
        return;
    }
    tracing::info!("shutdown requested; draining");

    state.hub.emit(ServerMessage::ServerShutdown);
    state.engine.begin_drain();

    if !state.engine.drain(state.config.drain_timeout()).await {
        tracing::warn!(
            in_flight = state.engine.in_flight_count(),
            "drain budget elapsed with commands still in flight"
        );
    }

    state.manager.close_all().await;
    state.shutdown.cancel();
}

/// Current epoch milliseconds.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
