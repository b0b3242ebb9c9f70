//! Connection and execution core for capability servers
//!
//! Capability servers are external processes (or HTTP endpoints) that expose
//! tools over line-delimited JSON-RPC. This crate manages their lifecycle and
//! executes tools against them on behalf of a front-end.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                        CapCore                          │
//! │  - Server registry (persisted via a ConfigStore)        │
//! │  - Execution engine (active set + bounded history)      │
//! │  - Tool catalog (qualified names across servers)        │
//! │  - Health monitor (probe, downgrade, auto-connect)      │
//! └─────────────────┬───────────────────────────────────────┘
//!                   │
//!          ┌────────┴────────┐
//!          │                 │
//!          ▼                 ▼
//! ┌─────────────────┐ ┌─────────────────┐
//! │  CapClient      │ │  CapClient      │
//! │  (weather)      │ │  (filesystem)   │
//! └────────┬────────┘ └────────┬────────┘
//!          │                   │
//!          ▼                   ▼
//! ┌─────────────────┐ ┌─────────────────┐
//! │  StdioTransport │ │  HttpTransport  │
//! └────────┬────────┘ └────────┬────────┘
//!          │                   │
//!          ▼                   ▼
//! ┌─────────────────┐ ┌─────────────────┐
//! │  child process  │ │  remote server  │
//! └─────────────────┘ └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use caplink_core::{CapCore, ServerConfig, TomlConfigStore};
//!
//! let store = Arc::new(TomlConfigStore::default_path()?);
//! let core = CapCore::new(store).await?;
//!
//! core.add_server(
//!     ServerConfig::new("github", "npx")
//!         .with_args(["-y", "@modelcontextprotocol/server-github"])
//!         .with_env("GITHUB_TOKEN", "${GITHUB_TOKEN}"),
//! )
//! .await?;
//!
//! core.connect_server("github").await?;
//! let record = core
//!     .execute_tool("github_search_issues", json!({"query": "is:open"}), "session-1")
//!     .await?;
//!
//! core.shutdown().await;
//! ```

pub mod catalog;
pub mod client;
pub mod config;
pub mod connection;
pub mod core;
pub mod error;
pub mod events;
pub mod execution;
pub mod health;
pub mod registry;
pub mod transport;
pub mod watcher;

// Re-exports
pub use catalog::{qualified_name, ToolCatalog, ToolDescriptor, ToolSchema};
pub use client::{CapClient, CallToolResult, ServerInfo, ToolInfo};
pub use config::{ConfigStore, MemoryConfigStore, ServerConfig, TomlConfigStore};
pub use connection::{ConnectionManager, ConnectionState, ServerStatus};
pub use self::core::CapCore;
pub use error::{CoreError, Result};
pub use events::{CoreEvent, EventBus};
pub use execution::{ExecutionEngine, ExecutionRecord, ExecutionStatistics, ExecutionStatus};
pub use health::{HealthMonitor, HealthSummary};
pub use registry::ServerRegistry;
pub use transport::{HttpTransport, StdioTransport, Transport};
pub use watcher::{ConfigChangeEvent, ConfigWatcher};
