use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use blacklist_psi_engine::EngineConfig;
use serde::{Deserialize, Serialize};

pub const DEFAULT_DB_PATH: &str = "./blacklist_psi.sqlite3";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    pub db: PathBuf,
    pub bind: SocketAddr,
    pub engine: EngineConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            db: PathBuf::from(DEFAULT_DB_PATH),
            bind: SocketAddr::from(([127, 0, 0, 1], 4020)),
            engine: EngineConfig::default(),
        }
    }
}

/// Values given on the command line or through `BLACKLIST_PSI_*` variables.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub db: Option<PathBuf>,
    pub bind: Option<SocketAddr>,
    pub engine_host: Option<String>,
    pub engine_port: Option<u16>,
}

impl ServiceConfig {
    /// Parse a TOML document; missing keys take their defaults.
    ///
    /// # Errors
    /// Returns an error when the document is not valid TOML or names unknown keys.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("failed to parse service config")
    }

    /// Load `path` when it exists, otherwise fall back to defaults.
    ///
    /// # Errors
    /// Returns an error when an existing file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("invalid config file {}", path.display()))
    }

    #[must_use]
    pub fn with_overrides(mut self, overrides: ConfigOverrides) -> Self {
        if let Some(db) = overrides.db {
            self.db = db;
        }
        if let Some(bind) = overrides.bind {
            self.bind = bind;
        }
        if let Some(host) = overrides.engine_host {
            self.engine.host = host;
        }
        if let Some(port) = overrides.engine_port {
            self.engine.port = port;
        }
        self
    }

    /// Request body ceiling: the engine ceiling after Base64 expansion plus JSON framing.
    #[must_use]
    pub fn body_limit(&self) -> usize {
        self.engine.max_message_bytes.saturating_mul(4) / 3 + 64 * 1024
    }
}
