//! Core façade
//!
//! Owns the registry, connection manager, tool catalog, execution engine and
//! health monitor, and exposes the operations a front-end consumes. Cheap to
//! share: clone the `Arc<CapCore>` and call from any task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

use crate::catalog::{ToolCatalog, ToolDescriptor};
use crate::config::{ConfigStore, ServerConfig};
use crate::connection::{ConnectionManager, ServerStatus};
use crate::error::Result;
use crate::events::{CoreEvent, EventBus};
use crate::execution::{ExecutionEngine, ExecutionRecord, ExecutionStatistics};
use crate::health::{HealthMonitor, HealthSummary};
use crate::registry::ServerRegistry;

/// Connection and execution core for capability servers
pub struct CapCore {
    registry: Arc<ServerRegistry>,
    connections: Arc<ConnectionManager>,
    catalog: Arc<ToolCatalog>,
    engine: Arc<ExecutionEngine>,
    health: HealthMonitor,
    events: EventBus,
}

impl CapCore {
    /// Load server configuration from the store and assemble the core.
    ///
    /// No connections are opened; call [`CapCore::connect_server`] or
    /// [`CapCore::auto_connect_all`] afterwards.
    pub async fn new(store: Arc<dyn ConfigStore>) -> Result<Self> {
        let registry = Arc::new(ServerRegistry::load(store).await?);
        let events = EventBus::default();
        let connections = Arc::new(ConnectionManager::new(
            Arc::clone(&registry),
            events.clone(),
        ));
        let catalog = Arc::new(ToolCatalog::new(Arc::clone(&connections)));
        let engine = Arc::new(ExecutionEngine::new(
            Arc::clone(&connections),
            Arc::clone(&catalog),
            events.clone(),
        ));
        let health = HealthMonitor::new(Arc::clone(&connections));

        info!(servers = registry.all().len(), "Core initialized");
        Ok(Self {
            registry,
            connections,
            catalog,
            engine,
            health,
            events,
        })
    }

    /// Subscribe to connection and execution lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    // ----- server configuration -----

    /// Add a server definition and persist it. Does not connect.
    pub async fn add_server(&self, config: ServerConfig) -> Result<()> {
        self.registry.add(config).await
    }

    /// Replace a server definition and persist it.
    ///
    /// An active connection to the old definition is torn down; the next
    /// connect uses the new one.
    pub async fn update_server(&self, config: ServerConfig) -> Result<()> {
        let id = config.id.clone();
        self.registry.update(config).await?;
        self.connections.disconnect(&id).await
    }

    /// Remove a server definition, disconnecting it first
    pub async fn remove_server(&self, id: &str) -> Result<()> {
        self.connections.disconnect(id).await?;
        self.registry.remove(id).await
    }

    /// Status snapshot of every configured server
    pub fn list_servers(&self) -> Vec<ServerStatus> {
        self.connections.all_servers()
    }

    /// Status snapshot of one server
    pub fn server_status(&self, id: &str) -> Option<ServerStatus> {
        self.connections.status(id)
    }

    /// Re-read the config store and reconcile connections: servers whose
    /// definition changed or vanished are disconnected, the rest stay up.
    pub async fn reload_config(&self) -> Result<()> {
        self.connections.reload_config().await
    }

    // ----- connection lifecycle -----

    /// Connect to a configured server (idempotent)
    pub async fn connect_server(&self, id: &str) -> Result<()> {
        self.connections.connect(id).await
    }

    /// Disconnect a server, discarding its cached tools
    pub async fn disconnect_server(&self, id: &str) -> Result<()> {
        self.connections.disconnect(id).await
    }

    /// Connect every enabled server that is not already connected; returns
    /// `(server id, reason)` for each failed attempt
    pub async fn auto_connect_all(&self) -> Vec<(String, String)> {
        self.health.auto_connect_all().await
    }

    /// Probe one connected server, downgrading it on failure
    pub async fn check_health(&self, id: &str) -> Result<bool> {
        self.health.check_server(id).await
    }

    /// Probe every configured server
    pub async fn check_all_health(&self) -> HealthSummary {
        self.health.check_all().await
    }

    /// Disconnect all servers; the core remains usable afterwards
    pub async fn shutdown(&self) {
        info!("Shutting down core");
        self.connections.disconnect_all().await;
    }

    // ----- tools and execution -----

    /// Tools of every connected, enabled server, keyed by server id
    pub fn list_tools(&self) -> HashMap<String, Vec<ToolDescriptor>> {
        self.catalog.all_enabled_tools()
    }

    /// Resolve a bare or qualified tool name without executing it
    pub fn resolve_tool(&self, name: &str) -> Result<ToolDescriptor> {
        self.catalog.resolve(name)
    }

    /// Execute a tool and wait for its terminal record.
    ///
    /// Resolution failures are returned as errors; once a record is created,
    /// the terminal record is returned whatever the outcome.
    pub async fn execute_tool(
        &self,
        tool_name: &str,
        arguments: Value,
        session_id: &str,
    ) -> Result<ExecutionRecord> {
        self.engine.execute(tool_name, arguments, session_id).await
    }

    /// Request cancellation of an in-flight invocation (idempotent)
    pub fn cancel_execution(&self, invocation_id: Uuid) -> bool {
        self.engine.cancel(invocation_id)
    }

    /// Snapshot of in-flight invocations
    pub fn active_executions(&self) -> Vec<ExecutionRecord> {
        self.engine.active_executions()
    }

    /// Terminal invocation records, optionally filtered by session
    pub fn execution_history(&self, session_id: Option<&str>) -> Vec<ExecutionRecord> {
        self.engine.history(session_id)
    }

    /// Aggregate statistics over the execution history
    pub fn execution_statistics(&self, session_id: Option<&str>) -> ExecutionStatistics {
        self.engine.statistics(session_id)
    }

    /// Drop terminal records older than `max_age`; returns how many
    pub fn prune_history(&self, max_age: Duration) -> usize {
        self.engine.prune_history(max_age)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfigStore;
    use crate::connection::ConnectionState;
    use crate::execution::ExecutionStatus;
    use crate::transport::testing::ScriptedTransport;
    use serde_json::json;

    fn tool(name: &str) -> crate::client::ToolInfo {
        crate::client::ToolInfo {
            name: name.to_string(),
            description: None,
            input_schema: json!({"type": "object"}),
        }
    }

    async fn core_with(configs: Vec<ServerConfig>) -> CapCore {
        CapCore::new(Arc::new(MemoryConfigStore::new(configs)))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_full_lifecycle_through_facade() {
        let core = core_with(vec![ServerConfig::new("weather", "cmd")]).await;
        let mut rx = core.subscribe();

        core.connections
            .connect_inner(
                "weather",
                Some(Box::new(ScriptedTransport::new(vec![tool("get_weather")]))),
            )
            .await
            .unwrap();

        assert_eq!(
            core.server_status("weather").unwrap().state,
            ConnectionState::Connected
        );
        assert_eq!(core.list_tools()["weather"].len(), 1);

        let record = core
            .execute_tool("get_weather", json!({"city": "Oslo"}), "s1")
            .await
            .unwrap();
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(core.execution_history(Some("s1")).len(), 1);
        assert_eq!(core.execution_statistics(None).succeeded, 1);

        // Events flowed for both the connection and the execution
        let mut saw_connected = false;
        let mut saw_completed = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                CoreEvent::ServerStateChanged {
                    state: ConnectionState::Connected,
                    ..
                } => saw_connected = true,
                CoreEvent::ExecutionCompleted { .. } => saw_completed = true,
                _ => {}
            }
        }
        assert!(saw_connected);
        assert!(saw_completed);

        core.shutdown().await;
        assert_eq!(
            core.server_status("weather").unwrap().state,
            ConnectionState::Disconnected
        );
        // History survives shutdown
        assert_eq!(core.execution_history(None).len(), 1);
    }

    #[tokio::test]
    async fn test_add_update_remove_server() {
        let core = core_with(vec![]).await;

        core.add_server(ServerConfig::new("files", "npx"))
            .await
            .unwrap();
        assert_eq!(core.list_servers().len(), 1);

        core.update_server(ServerConfig::new("files", "npx").with_arg("-y"))
            .await
            .unwrap();
        assert_eq!(
            core.server_status("files").unwrap().state,
            ConnectionState::Disconnected
        );

        core.remove_server("files").await.unwrap();
        assert!(core.list_servers().is_empty());
    }

    #[tokio::test]
    async fn test_update_disconnects_live_server() {
        let core = core_with(vec![ServerConfig::new("srv", "cmd")]).await;
        core.connections
            .connect_inner("srv", Some(Box::new(ScriptedTransport::new(vec![]))))
            .await
            .unwrap();

        core.update_server(ServerConfig::new("srv", "cmd-v2"))
            .await
            .unwrap();

        assert_eq!(
            core.server_status("srv").unwrap().state,
            ConnectionState::Disconnected
        );
        assert_eq!(core.server_status("srv").unwrap().command, "cmd-v2");
    }
}
