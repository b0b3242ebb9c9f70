//! Server registry
//!
//! Owns the declarative set of known capability servers and persists it
//! through the external [`ConfigStore`] collaborator.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::config::{ConfigStore, ServerConfig};
use crate::error::{CoreError, Result};

/// Registry of configured capability servers
pub struct ServerRegistry {
    store: Arc<dyn ConfigStore>,
    servers: RwLock<Vec<ServerConfig>>,
}

impl ServerRegistry {
    /// Load the registry from the given store
    pub async fn load(store: Arc<dyn ConfigStore>) -> Result<Self> {
        let servers = sanitize(store.load().await?);
        debug!(count = servers.len(), "Loaded server registry");
        Ok(Self {
            store,
            servers: RwLock::new(servers),
        })
    }

    /// Re-read the store, replacing the in-memory set.
    ///
    /// A store failure here is the only total failure the core reports;
    /// the previous set stays intact in that case.
    pub async fn reload(&self) -> Result<Vec<ServerConfig>> {
        let servers = sanitize(self.store.load().await?);
        *self.servers.write() = servers.clone();
        info!(count = servers.len(), "Reloaded server registry");
        Ok(servers)
    }

    /// Look up a server by id
    pub fn get(&self, id: &str) -> Option<ServerConfig> {
        self.servers.read().iter().find(|s| s.id == id).cloned()
    }

    /// Snapshot of all configured servers
    pub fn all(&self) -> Vec<ServerConfig> {
        self.servers.read().clone()
    }

    /// Add a new server and persist the updated list
    pub async fn add(&self, config: ServerConfig) -> Result<()> {
        validate(&config)?;
        if self.get(&config.id).is_some() {
            return Err(CoreError::Config(format!(
                "server '{}' already exists",
                config.id
            )));
        }

        let updated = {
            let mut servers = self.servers.write();
            servers.push(config);
            servers.clone()
        };
        self.store.save(&updated).await
    }

    /// Replace an existing server's configuration and persist
    pub async fn update(&self, config: ServerConfig) -> Result<()> {
        validate(&config)?;

        let updated = {
            let mut servers = self.servers.write();
            let slot = servers
                .iter_mut()
                .find(|s| s.id == config.id)
                .ok_or_else(|| CoreError::ServerNotFound(config.id.clone()))?;
            *slot = config;
            servers.clone()
        };
        self.store.save(&updated).await
    }

    /// Remove a server and persist
    pub async fn remove(&self, id: &str) -> Result<()> {
        let updated = {
            let mut servers = self.servers.write();
            let before = servers.len();
            servers.retain(|s| s.id != id);
            if servers.len() == before {
                return Err(CoreError::ServerNotFound(id.to_string()));
            }
            servers.clone()
        };
        self.store.save(&updated).await
    }
}

/// Drop loaded configs that could never produce a working connection.
///
/// A bad entry is skipped with a warning so the rest of the list proceeds;
/// only a store failure is a total one.
fn sanitize(servers: Vec<ServerConfig>) -> Vec<ServerConfig> {
    let mut seen = std::collections::HashSet::new();
    let mut kept = Vec::with_capacity(servers.len());
    for config in servers {
        if let Err(e) = validate(&config) {
            warn!(server = %config.id, error = %e, "Skipping invalid server config");
            continue;
        }
        if !seen.insert(config.id.clone()) {
            warn!(server = %config.id, "Skipping duplicate server id");
            continue;
        }
        kept.push(config);
    }
    kept
}

/// Reject configs that could never produce a working connection
fn validate(config: &ServerConfig) -> Result<()> {
    if config.id.trim().is_empty() {
        return Err(CoreError::Config("server id must not be empty".to_string()));
    }
    if config.command.trim().is_empty() && config.url.is_none() {
        return Err(CoreError::Config(format!(
            "server '{}' has neither a command nor a url",
            config.id
        )));
    }
    Ok(())
}
