//! conduit-bridge - relays an editor on stdio to a subordinate language server.
//!
//! ```text
//! editor <--stdio--> Connection("editor") --Relay--> SubordinateServer
//!                                         <--Relay--
//! ```
//!
//! The bridge runs until either side goes away, then shuts the subordinate
//! down. Logs go to stderr; stdout carries the protocol.

mod config;
mod relay;

use std::env;
use std::sync::Arc;

use anyhow::{Context, Result};
use conduit_jsonrpc::{Connection, MessageRegistry, SubordinateServer, Transport};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::{BridgeConfig, CONFIG_ENV_VAR};
use crate::relay::Relay;

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_writer(std::io::stderr),
        )
        .with(env_filter)
        .init();
}

async fn run(config: BridgeConfig) -> Result<()> {
    let editor = Connection::builder("editor")
        .config(config.connection.clone())
        .registry(MessageRegistry::permissive())
        .build(Transport::stdio());

    let server = SubordinateServer::spawn(
        &config.server,
        MessageRegistry::permissive(),
        Arc::new(Relay::new(editor.clone())),
        config.connection,
    )?;
    editor
        .start(Arc::new(Relay::new(server.connection().clone())))
        .context("starting editor connection")?;
    tracing::info!(server = server.name(), "Bridge running");

    tokio::select! {
        () = editor.closed() => tracing::info!("Editor disconnected"),
        () = server.connection().closed() => tracing::info!("Subordinate server exited"),
    }

    editor.close();
    server.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let path = config::resolve_path(env::args_os().nth(1), env::var_os(CONFIG_ENV_VAR))?;
    let config = BridgeConfig::load(&path)?;
    tracing::info!(path = %path.display(), command = %config.server.command, "Loaded config");

    run(config).await?;

    // The stdin reader may still be parked in a blocking read.
    std::process::exit(0);
}
