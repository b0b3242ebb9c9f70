//! Capability server configuration
//!
//! Declarative definitions of known servers plus the store contract used to
//! persist them. The storage format itself belongs to the surrounding
//! application; the core only reads and rewrites the server list.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

fn default_enabled() -> bool {
    true
}

fn default_timeout() -> u64 {
    30
}

/// Configuration for a capability server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Unique id for this server (used in tool prefixes)
    pub id: String,
    /// Human-readable name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Command to run the server
    pub command: String,
    /// Arguments to pass to the command
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables merged over the host environment
    /// (supports ${VAR} expansion)
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory for the server
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    /// Base URL for servers reached over HTTP instead of stdio
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Whether this server participates in auto-connect and the catalog
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Timeout for handshake and per-request operations in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl ServerConfig {
    /// Create a new server config with just id and command
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            url: None,
            enabled: true,
            timeout_secs: 30,
        }
    }

    /// Add an argument
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add arguments
    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add an environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the display name
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Set working directory
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Mark the server enabled or disabled
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Expand ${VAR} patterns in env values
    pub fn expand_env_vars(&mut self) -> Result<()> {
        for value in self.env.values_mut() {
            *value = expand_env_string(value)?;
        }
        Ok(())
    }
}

/// Expand ${VAR} patterns in a string using environment variables
pub fn expand_env_string(s: &str) -> Result<String> {
    let mut result = s.to_string();
    let re = regex::Regex::new(r"\$\{([^}]+)\}").unwrap();

    for cap in re.captures_iter(s) {
        let var_name = &cap[1];
        let var_value = std::env::var(var_name).map_err(|_| {
            CoreError::Config(format!("environment variable {} not set", var_name))
        })?;
        result = result.replace(&cap[0], &var_value);
    }

    Ok(result)
}

/// Contract for the external configuration store.
///
/// The core reads a list of server configs and can request the list be
/// rewritten; it does not own the storage format.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Read the full server list
    async fn load(&self) -> Result<Vec<ServerConfig>>;

    /// Rewrite the full server list
    async fn save(&self, servers: &[ServerConfig]) -> Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ServersFile {
    #[serde(default)]
    servers: Vec<ServerConfig>,
}

/// TOML-file backed store under the user config directory
pub struct TomlConfigStore {
    path: PathBuf,
}

impl TomlConfigStore {
    /// Create a store backed by the given file
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at the default location (`<config dir>/caplink/servers.toml`)
    pub fn default_path() -> Result<Self> {
        let path = dirs::config_dir()
            .map(|d| d.join("caplink").join("servers.toml"))
            .ok_or_else(|| {
                CoreError::Config("could not determine config directory".to_string())
            })?;
        Ok(Self { path })
    }

    /// Path to the backing file
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl ConfigStore for TomlConfigStore {
    async fn load(&self) -> Result<Vec<ServerConfig>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            CoreError::Config(format!("failed to read {}: {}", self.path.display(), e))
        })?;

        let file: ServersFile = toml::from_str(&content).map_err(|e| {
            CoreError::Config(format!("failed to parse {}: {}", self.path.display(), e))
        })?;

        Ok(file.servers)
    }

    async fn save(&self, servers: &[ServerConfig]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CoreError::Config(format!("failed to create {}: {}", parent.display(), e))
            })?;
        }

        let file = ServersFile {
            servers: servers.to_vec(),
        };
        let content = toml::to_string_pretty(&file)
            .map_err(|e| CoreError::Config(format!("failed to serialize servers: {}", e)))?;

        std::fs::write(&self.path, content).map_err(|e| {
            CoreError::Config(format!("failed to write {}: {}", self.path.display(), e))
        })?;

        Ok(())
    }
}

/// In-memory store for tests and embedded use
#[derive(Default)]
pub struct MemoryConfigStore {
    servers: parking_lot::Mutex<Vec<ServerConfig>>,
}

impl MemoryConfigStore {
    pub fn new(servers: Vec<ServerConfig>) -> Self {
        Self {
            servers: parking_lot::Mutex::new(servers),
        }
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn load(&self) -> Result<Vec<ServerConfig>> {
        Ok(self.servers.lock().clone())
    }

    async fn save(&self, servers: &[ServerConfig]) -> Result<()> {
        *self.servers.lock() = servers.to_vec();
        Ok(())
    }
}
