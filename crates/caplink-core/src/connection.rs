//! Server connection lifecycle management
//!
//! Owns the per-server state machine and transport. States move
//! `disconnected → connecting → connected`, drop to `error` on handshake or
//! transport failure, and can always be retried; there is no terminal state.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::client::{CapClient, ToolInfo};
use crate::config::ServerConfig;
use crate::error::{CoreError, Result};
use crate::events::{CoreEvent, EventBus};
use crate::registry::ServerRegistry;
use crate::transport::{HttpTransport, StdioTransport, Transport};

/// State of a server connection
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No live transport
    Disconnected,
    /// Transport spawn and handshake in progress
    Connecting,
    /// Handshake complete, catalog fetched
    Connected,
    /// Last connect or probe failed; retried only on explicit connect
    Error(String),
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Error(reason) => write!(f, "error: {}", reason),
        }
    }
}

/// Read-only snapshot of one server's runtime state
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub id: String,
    pub display_name: Option<String>,
    pub command: String,
    pub enabled: bool,
    pub state: ConnectionState,
    pub tool_count: usize,
    pub last_error: Option<String>,
    pub last_health_check: Option<DateTime<Utc>>,
}

/// Runtime binding to one server; at most one per server id
pub(crate) struct ServerEntry {
    pub(crate) config: RwLock<ServerConfig>,
    pub(crate) state: RwLock<ConnectionState>,
    pub(crate) client: RwLock<Option<Arc<CapClient>>>,
    pub(crate) tools: RwLock<Vec<ToolInfo>>,
    pub(crate) last_error: RwLock<Option<String>>,
    pub(crate) last_health_check: RwLock<Option<DateTime<Utc>>>,
    /// Single-writer rule for connection transitions
    pub(crate) connect_lock: tokio::sync::Mutex<()>,
    /// Guards against overlapping health probes
    pub(crate) probing: AtomicBool,
}

impl ServerEntry {
    fn new(config: ServerConfig) -> Self {
        Self {
            config: RwLock::new(config),
            state: RwLock::new(ConnectionState::Disconnected),
            client: RwLock::new(None),
            tools: RwLock::new(Vec::new()),
            last_error: RwLock::new(None),
            last_health_check: RwLock::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
            probing: AtomicBool::new(false),
        }
    }
}

/// Manager owning the runtime state of every configured server
pub struct ConnectionManager {
    registry: Arc<ServerRegistry>,
    entries: DashMap<String, Arc<ServerEntry>>,
    events: EventBus,
}

impl ConnectionManager {
    pub fn new(registry: Arc<ServerRegistry>, events: EventBus) -> Self {
        Self {
            registry,
            entries: DashMap::new(),
            events,
        }
    }

    fn set_state(&self, id: &str, entry: &ServerEntry, state: ConnectionState) {
        *entry.state.write() = state.clone();
        self.events.publish(CoreEvent::ServerStateChanged {
            server: id.to_string(),
            state,
        });
    }

    /// Connect to a configured server.
    ///
    /// Idempotent: connecting an already-connected server is a no-op, and
    /// concurrent calls for the same id collapse onto one in-flight attempt.
    pub async fn connect(&self, id: &str) -> Result<()> {
        self.connect_inner(id, None).await
    }

    pub(crate) async fn connect_inner(
        &self,
        id: &str,
        transport_override: Option<Box<dyn Transport>>,
    ) -> Result<()> {
        let config = self
            .registry
            .get(id)
            .ok_or_else(|| CoreError::ServerNotFound(id.to_string()))?;

        if !config.enabled {
            return Err(CoreError::Config(format!("server '{}' is disabled", id)));
        }

        let entry = self
            .entries
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(ServerEntry::new(config.clone())))
            .clone();

        if *entry.state.read() == ConnectionState::Connected {
            return Ok(());
        }

        let _guard = entry.connect_lock.lock().await;

        // A concurrent caller may have finished the attempt while we waited
        if *entry.state.read() == ConnectionState::Connected {
            return Ok(());
        }

        *entry.config.write() = config.clone();
        self.set_state(id, &entry, ConnectionState::Connecting);
        info!(server = %id, command = %config.command, "Connecting to server");

        match self.establish(&config, transport_override).await {
            Ok((client, tools)) => {
                // The server may have been disconnected while we were
                // connecting; do not resurrect a removed entry.
                let still_tracked = self
                    .entries
                    .get(id)
                    .map(|e| Arc::ptr_eq(e.value(), &entry))
                    .unwrap_or(false);
                if !still_tracked {
                    let _ = client.close().await;
                    return Err(CoreError::Connection {
                        server: id.to_string(),
                        reason: "disconnected during connect".to_string(),
                    });
                }

                info!(
                    server = %id,
                    remote = %client.server_info().name,
                    tools = tools.len(),
                    "Server connected"
                );
                *entry.client.write() = Some(Arc::new(client));
                *entry.tools.write() = tools;
                *entry.last_error.write() = None;
                self.set_state(id, &entry, ConnectionState::Connected);
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                warn!(server = %id, error = %reason, "Connect failed");
                *entry.last_error.write() = Some(reason.clone());
                self.set_state(id, &entry, ConnectionState::Error(reason.clone()));
                match e {
                    CoreError::Connection { .. } | CoreError::Config(_) => Err(e),
                    _ => Err(CoreError::Connection {
                        server: id.to_string(),
                        reason,
                    }),
                }
            }
        }
    }

    async fn establish(
        &self,
        config: &ServerConfig,
        transport_override: Option<Box<dyn Transport>>,
    ) -> Result<(CapClient, Vec<ToolInfo>)> {
        let mut config = config.clone();
        config.expand_env_vars()?;

        let transport: Box<dyn Transport> = match transport_override {
            Some(t) => t,
            None => match &config.url {
                Some(url) => Box::new(HttpTransport::new(url.clone())),
                None => Box::new(StdioTransport::spawn(&config)?),
            },
        };

        let timeout = Duration::from_secs(config.timeout_secs);
        let client = CapClient::connect(transport, timeout).await?;
        let tools = client.list_tools().await?;

        Ok((client, tools))
    }

    /// Terminate a server's transport and discard its cached tools.
    ///
    /// Tolerates servers with no active connection.
    pub async fn disconnect(&self, id: &str) -> Result<()> {
        let Some((_, entry)) = self.entries.remove(id) else {
            return Ok(());
        };

        info!(server = %id, "Disconnecting server");
        let client = entry.client.write().take();
        if let Some(client) = client {
            if let Err(e) = client.close().await {
                warn!(server = %id, error = %e, "Error closing connection");
            }
        }
        entry.tools.write().clear();
        self.set_state(id, &entry, ConnectionState::Disconnected);
        Ok(())
    }

    /// Disconnect every tracked server
    pub async fn disconnect_all(&self) {
        let ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            let _ = self.disconnect(&id).await;
        }
    }

    /// Re-read the registry, disconnecting servers whose configuration
    /// changed or disappeared. Unaffected connections stay intact.
    pub async fn reload_config(&self) -> Result<()> {
        let configs = self.registry.reload().await?;

        let mut stale = Vec::new();
        for item in self.entries.iter() {
            let id = item.key();
            let current = item.value().config.read().clone();
            match configs.iter().find(|c| &c.id == id) {
                Some(new_config) if *new_config == current => {}
                _ => stale.push(id.clone()),
            }
        }

        for id in stale {
            info!(server = %id, "Configuration changed, disconnecting");
            self.disconnect(&id).await?;
        }

        Ok(())
    }

    /// Downgrade a connection after a transport failure or failed probe
    pub(crate) async fn mark_error(&self, id: &str, reason: impl Into<String>) {
        let Some(entry) = self.entries.get(id).map(|e| Arc::clone(e.value())) else {
            return;
        };
        let reason = reason.into();
        warn!(server = %id, error = %reason, "Connection downgraded to error");

        let client = entry.client.write().take();
        if let Some(client) = client {
            let _ = client.close().await;
        }
        entry.tools.write().clear();
        *entry.last_error.write() = Some(reason.clone());
        self.set_state(id, &entry, ConnectionState::Error(reason));
    }

    /// Live client for a connected server
    pub(crate) fn client(&self, id: &str) -> Option<Arc<CapClient>> {
        let entry = self.entries.get(id)?;
        if *entry.state.read() != ConnectionState::Connected {
            return None;
        }
        let client = entry.client.read().clone();
        client
    }

    pub(crate) fn entry(&self, id: &str) -> Option<Arc<ServerEntry>> {
        self.entries.get(id).map(|e| Arc::clone(e.value()))
    }

    /// Snapshot of one server's status; never blocks on I/O
    pub fn status(&self, id: &str) -> Option<ServerStatus> {
        let config = self.registry.get(id)?;
        Some(self.status_for(&config))
    }

    /// Snapshot of every configured server; never blocks on I/O
    pub fn all_servers(&self) -> Vec<ServerStatus> {
        let mut statuses: Vec<ServerStatus> = self
            .registry
            .all()
            .iter()
            .map(|c| self.status_for(c))
            .collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    fn status_for(&self, config: &ServerConfig) -> ServerStatus {
        let entry = self.entries.get(&config.id);
        let (state, tool_count, last_error, last_health_check) = match &entry {
            Some(e) => (
                e.state.read().clone(),
                e.tools.read().len(),
                e.last_error.read().clone(),
                *e.last_health_check.read(),
            ),
            None => (ConnectionState::Disconnected, 0, None, None),
        };

        ServerStatus {
            id: config.id.clone(),
            display_name: config.display_name.clone(),
            command: config.command.clone(),
            enabled: config.enabled,
            state,
            tool_count,
            last_error,
            last_health_check,
        }
    }

    /// Cached tool lists of all connected, enabled servers
    pub(crate) fn connected_tools(&self) -> Vec<(String, Vec<ToolInfo>)> {
        self.entries
            .iter()
            .filter(|e| {
                *e.value().state.read() == ConnectionState::Connected
                    && e.value().config.read().enabled
            })
            .map(|e| (e.key().clone(), e.value().tools.read().clone()))
            .collect()
    }

    /// Ids of servers currently connected
    pub fn connected_servers(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| *e.value().state.read() == ConnectionState::Connected)
            .map(|e| e.key().clone())
            .collect()
    }

    pub(crate) fn registry(&self) -> &ServerRegistry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigStore, MemoryConfigStore};
    use crate::transport::testing::ScriptedTransport;

    fn tool(name: &str) -> ToolInfo {
        ToolInfo {
            name: name.to_string(),
            description: None,
            input_schema: serde_json::json!({"type": "object"}),
        }
    }

    async fn manager_with(configs: Vec<ServerConfig>) -> Arc<ConnectionManager> {
        let store = Arc::new(MemoryConfigStore::new(configs));
        let registry = Arc::new(ServerRegistry::load(store).await.unwrap());
        Arc::new(ConnectionManager::new(registry, EventBus::default()))
    }

    #[tokio::test]
    async fn test_loaded_servers_start_disconnected() {
        let manager = manager_with(vec![
            ServerConfig::new("a", "cmd-a"),
            ServerConfig::new("b", "cmd-b"),
        ])
        .await;

        let servers = manager.all_servers();
        assert_eq!(servers.len(), 2);
        assert!(servers
            .iter()
            .all(|s| s.state == ConnectionState::Disconnected));
    }

    #[tokio::test]
    async fn test_connect_with_scripted_transport() {
        let manager = manager_with(vec![ServerConfig::new("weather", "weather-mcp")]).await;

        let transport = ScriptedTransport::new(vec![tool("get_weather")]);
        manager
            .connect_inner("weather", Some(Box::new(transport)))
            .await
            .unwrap();

        let status = manager.status("weather").unwrap();
        assert_eq!(status.state, ConnectionState::Connected);
        assert_eq!(status.tool_count, 1);
        assert!(manager.client("weather").is_some());
    }

    #[tokio::test]
    async fn test_connect_idempotent() {
        let manager = manager_with(vec![ServerConfig::new("weather", "weather-mcp")]).await;

        let transport = ScriptedTransport::new(vec![tool("get_weather")]);
        manager
            .connect_inner("weather", Some(Box::new(transport)))
            .await
            .unwrap();

        // Second connect must not need a transport at all
        manager.connect("weather").await.unwrap();
        assert_eq!(manager.connected_servers(), vec!["weather".to_string()]);
    }

    #[tokio::test]
    async fn test_concurrent_connects_collapse() {
        let manager = manager_with(vec![ServerConfig::new("slow", "slow-mcp")]).await;
        let events = EventBus::default();
        let manager = Arc::new(ConnectionManager::new(
            Arc::clone(&manager.registry),
            events.clone(),
        ));
        let mut rx = events.subscribe();

        let t1 = Box::new(
            ScriptedTransport::new(vec![tool("x")])
                .with_call_delay(Duration::from_millis(50)),
        );
        let t2 = Box::new(ScriptedTransport::new(vec![tool("x")]));

        let m1 = Arc::clone(&manager);
        let m2 = Arc::clone(&manager);
        let (r1, r2) = tokio::join!(
            m1.connect_inner("slow", Some(t1)),
            m2.connect_inner("slow", Some(t2)),
        );
        r1.unwrap();
        r2.unwrap();

        // Exactly one attempt went through the connecting state
        let mut connecting_events = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(
                event,
                CoreEvent::ServerStateChanged {
                    state: ConnectionState::Connecting,
                    ..
                }
            ) {
                connecting_events += 1;
            }
        }
        assert_eq!(connecting_events, 1);
    }

    #[tokio::test]
    async fn test_connect_unknown_server() {
        let manager = manager_with(vec![]).await;
        let result = manager.connect("ghost").await;
        assert!(matches!(result, Err(CoreError::ServerNotFound(_))));
    }

    #[tokio::test]
    async fn test_connect_disabled_server() {
        let manager =
            manager_with(vec![ServerConfig::new("off", "cmd").with_enabled(false)]).await;
        let result = manager.connect("off").await;
        assert!(matches!(result, Err(CoreError::Config(_))));
    }

    #[tokio::test]
    async fn test_connect_bad_command_sets_error_state() {
        let manager =
            manager_with(vec![ServerConfig::new("bad", "caplink-no-such-binary-xyz")]).await;

        let result = manager.connect("bad").await;
        assert!(result.is_err());

        // Server stays listed with a diagnostic, not removed
        let status = manager.status("bad").unwrap();
        assert!(matches!(status.state, ConnectionState::Error(_)));
        assert!(status.last_error.is_some());
        assert!(!status.last_error.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_is_tolerant() {
        let manager = manager_with(vec![ServerConfig::new("a", "cmd")]).await;
        manager.disconnect("a").await.unwrap();
        manager.disconnect("never-existed").await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_discards_tools() {
        let manager = manager_with(vec![ServerConfig::new("weather", "weather-mcp")]).await;
        let transport = ScriptedTransport::new(vec![tool("get_weather")]);
        manager
            .connect_inner("weather", Some(Box::new(transport)))
            .await
            .unwrap();

        manager.disconnect("weather").await.unwrap();

        let status = manager.status("weather").unwrap();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert_eq!(status.tool_count, 0);
        assert!(manager.client("weather").is_none());
    }

    #[tokio::test]
    async fn test_reload_disconnects_changed_servers() {
        let store = Arc::new(MemoryConfigStore::new(vec![
            ServerConfig::new("stable", "cmd-a"),
            ServerConfig::new("changed", "cmd-b"),
        ]));
        let registry = Arc::new(
            ServerRegistry::load(store.clone() as Arc<dyn crate::config::ConfigStore>)
                .await
                .unwrap(),
        );
        let manager = ConnectionManager::new(registry, EventBus::default());

        manager
            .connect_inner(
                "stable",
                Some(Box::new(ScriptedTransport::new(vec![tool("s")]))),
            )
            .await
            .unwrap();
        manager
            .connect_inner(
                "changed",
                Some(Box::new(ScriptedTransport::new(vec![tool("c")]))),
            )
            .await
            .unwrap();

        // Rewrite the store: "changed" gets a new command, "stable" untouched
        store
            .save(&[
                ServerConfig::new("stable", "cmd-a"),
                ServerConfig::new("changed", "cmd-b-v2"),
            ])
            .await
            .unwrap();

        manager.reload_config().await.unwrap();

        assert_eq!(
            manager.status("stable").unwrap().state,
            ConnectionState::Connected
        );
        assert_eq!(
            manager.status("changed").unwrap().state,
            ConnectionState::Disconnected
        );
    }

    #[tokio::test]
    async fn test_mark_error_drops_client() {
        let manager = manager_with(vec![ServerConfig::new("weather", "weather-mcp")]).await;
        manager
            .connect_inner(
                "weather",
                Some(Box::new(ScriptedTransport::new(vec![tool("t")]))),
            )
            .await
            .unwrap();

        manager.mark_error("weather", "probe failed").await;

        let status = manager.status("weather").unwrap();
        assert!(matches!(status.state, ConnectionState::Error(_)));
        assert!(manager.client("weather").is_none());
    }
}
