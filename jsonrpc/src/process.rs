//! Subordinate server: a child process spoken to over its stdio.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use conduit_types::{ExitNotification, ShutdownRequest};
use tokio::process::{Child, Command};

use crate::config::{ConnectionConfig, ServerConfig};
use crate::connection::{Connection, MessageHandler};
use crate::registry::MessageRegistry;
use crate::transport::Transport;

const SHUTDOWN_TIMEOUT_SECS: u64 = 2;

/// Minimal glob matcher for env var denylist patterns.
/// Handles `*_SUFFIX`, `PREFIX_*`, `*_INFIX*`, and exact match.
/// Both pattern and key are compared in uppercase.
fn env_glob_matches(pattern: &str, key_upper: &str) -> bool {
    let pat = pattern.to_uppercase();
    match (pat.strip_prefix('*'), pat.strip_suffix('*')) {
        (Some(_), Some(_)) if pat.len() >= 2 => key_upper.contains(&pat[1..pat.len() - 1]),
        (Some(suffix), None) => key_upper.ends_with(suffix),
        (None, Some(prefix)) => key_upper.starts_with(prefix),
        (Some(_), Some(_)) => true,
        (None, None) => key_upper == pat,
    }
}

fn is_denied(key: &str, denylist: &[String]) -> bool {
    let upper = key.to_uppercase();
    denylist.iter().any(|pat| env_glob_matches(pat, &upper))
}

/// A running child language server and the connection to it.
pub struct SubordinateServer {
    name: String,
    child: Child,
    connection: Connection,
}

impl SubordinateServer {
    /// Launch `config.command` and start a connection over its stdio.
    ///
    /// Environment variables matching `config.env_denylist` are removed
    /// from the child's environment. The child's stderr is discarded.
    pub fn spawn(
        config: &ServerConfig,
        registry: impl Into<Arc<MessageRegistry>>,
        handler: Arc<dyn MessageHandler>,
        connection_config: ConnectionConfig,
    ) -> Result<Self> {
        let resolved_cmd = which::which(&config.command)
            .with_context(|| format!("{} not found in PATH", config.command))?;
        let mut cmd = Command::new(&resolved_cmd);
        cmd.args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(cwd) = &config.cwd {
            cmd.current_dir(cwd);
        }

        for (key, _) in std::env::vars_os() {
            if let Some(key) = key.to_str()
                && is_denied(key, &config.env_denylist)
            {
                cmd.env_remove(key);
            }
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning {}", config.command))?;
        let transport = Transport::from_child(&mut child)?;

        let name = config.command.clone();
        let connection = Connection::builder(name.clone())
            .config(connection_config)
            .registry(registry)
            .span(tracing::info_span!("subordinate", server = %name))
            .build(transport);
        connection
            .start(handler)
            .with_context(|| format!("starting connection to {name}"))?;

        tracing::info!(server = %name, pid = child.id(), "Subordinate server started");
        Ok(Self {
            name,
            child,
            connection,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Gracefully shut down the server. Consumes self.
    ///
    /// Sends `shutdown`, then `exit` if the server acknowledged, closes the
    /// connection and waits briefly for the child before killing it.
    pub async fn shutdown(mut self) {
        let timeout = Duration::from_secs(SHUTDOWN_TIMEOUT_SECS);
        match tokio::time::timeout(timeout, self.connection.request::<ShutdownRequest>(())).await {
            Ok(Ok(())) => self.connection.notify::<ExitNotification>(()),
            Ok(Err(e)) => tracing::debug!("'{}' rejected shutdown: {e}", self.name),
            Err(_) => tracing::debug!("'{}' did not answer shutdown in time", self.name),
        }

        self.connection.close();

        let exited = tokio::time::timeout(timeout, self.child.wait()).await;
        if exited.is_err() {
            tracing::debug!("'{}' didn't exit in time, killing", self.name);
            let _ = self.child.kill().await;
        }
    }
}
