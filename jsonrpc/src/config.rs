//! Configuration types.
//!
//! Binaries deserialize these from their config files; library callers can
//! construct them directly or take the defaults.

use std::path::PathBuf;

use serde::Deserialize;

use crate::frame::DEFAULT_MAX_FRAME_BYTES;

const DEFAULT_READ_CHUNK_BYTES: usize = 8 * 1024;

/// Tuning for a single connection.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Largest accepted frame body. Larger frames are fatal. Default: 64 MiB.
    pub max_frame_bytes: usize,
    /// Size of each read from the inbound transport. Default: 8 KiB.
    pub read_chunk_bytes: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            read_chunk_bytes: DEFAULT_READ_CHUNK_BYTES,
        }
    }
}

/// How to launch a subordinate language server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Executable command (e.g. "clangd"), resolved on `PATH`.
    pub command: String,
    /// Arguments to pass to the command.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory for the child. Default: inherited.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Environment variable patterns removed from the child's environment.
    /// Default: [`conduit_types::ENV_SECRET_DENYLIST`].
    #[serde(default = "default_env_denylist")]
    pub env_denylist: Vec<String>,
}

fn default_env_denylist() -> Vec<String> {
    conduit_types::ENV_SECRET_DENYLIST
        .iter()
        .map(|pattern| (*pattern).to_string())
        .collect()
}

impl ServerConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            cwd: None,
            env_denylist: default_env_denylist(),
        }
    }

    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}
