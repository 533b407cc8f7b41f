// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use clap::Parser;
use tracing::error;

use pimux::backend::EchoBackend;
use pimux::config::MuxConfig;

/// Session multiplexer for pi agent sessions.
///
/// The binary serves the deterministic echo backend for development;
/// production embeds the library with a real engine.
#[derive(clap::Parser)]
#[command(name = "pimux", version)]
struct Cli {
    #[command(flatten)]
    config: MuxConfig,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = pimux::run(cli.config, Arc::new(EchoBackend)).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}
