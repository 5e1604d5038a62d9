//! Bridge configuration, loaded from TOML.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use conduit_jsonrpc::{ConnectionConfig, ServerConfig};
use serde::Deserialize;
use thiserror::Error;

pub const CONFIG_ENV_VAR: &str = "CONDUIT_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot determine a config path; pass one as the first argument")]
    NoPath,
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl ConfigError {
    pub fn path(&self) -> Option<&Path> {
        match self {
            ConfigError::NoPath => None,
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => Some(path),
        }
    }
}

/// ```toml
/// [connection]
/// max_frame_bytes = 67108864
///
/// [server]
/// command = "clangd"
/// args = ["--background-index"]
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,
    pub server: ServerConfig,
}

impl BridgeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        toml::from_str(&content).map_err(|err| {
            tracing::warn!("Failed to parse config at {:?}: {}", path, err);
            ConfigError::Parse {
                path: path.to_path_buf(),
                source: err,
            }
        })
    }
}

/// First of: explicit argument, `$CONDUIT_CONFIG`, `~/.conduit/config.toml`.
pub fn resolve_path(arg: Option<OsString>, env: Option<OsString>) -> Result<PathBuf, ConfigError> {
    arg.or(env)
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .or_else(default_path)
        .ok_or(ConfigError::NoPath)
}

pub fn default_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".conduit").join("config.toml"))
}
