use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};

use crate::object_id::IdentifierConfig;

pub const DEFAULT_CONFIG_FILE: &str = "plasmacat.toml";
pub const DEFAULT_CAPACITY: u64 = 1024 * 1024 * 1024; // 1GB

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub client: ClientConfig,
    pub identifier: IdentifierConfig,
    pub server: ServerConfig,
}

/// Connection parameters passed to the store on connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Name the store logs this client under.
    pub client_name: String,
    /// Forwarded verbatim in the connect request; empty means none.
    pub manager_socket: String,
    /// Forwarded verbatim in the connect request.
    pub release_delay: u64,
    /// Bound on socket connect plus handshake. Unset waits for the OS.
    pub connect_timeout_ms: Option<u64>,
    /// Bound on waiting for an unsealed object. Unset blocks until sealed.
    pub get_timeout_ms: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_name: "plasmacat".to_string(),
            manager_socket: String::new(),
            release_delay: 0,
            connect_timeout_ms: None,
            get_timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Directory holding object files; a tmpfs such as /dev/shm keeps them in memory.
    pub objects_dir: PathBuf,
    pub capacity_bytes: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            objects_dir: default_objects_dir(),
            capacity_bytes: DEFAULT_CAPACITY,
        }
    }
}

fn default_objects_dir() -> PathBuf {
    let shm = Path::new("/dev/shm");
    if shm.is_dir() {
        shm.join("plasmacat")
    } else {
        std::env::temp_dir().join("plasmacat")
    }
}

impl Config {
    /// Explicit path must exist; otherwise the default file is read when present.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let config = match config_path {
            Some(path) => Self::read(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Self::read(DEFAULT_CONFIG_FILE)?,
            None => Self::default(),
        };
        config.identifier.validate()?;
        Ok(config)
    }

    fn read(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing config file {}", path))?;
        tracing::debug!("Loaded config from {}", path);
        Ok(config)
    }

    pub fn save(&self, config_path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }
}
