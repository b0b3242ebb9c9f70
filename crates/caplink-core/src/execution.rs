//! Tool execution engine
//!
//! Resolves tool names through the catalog, dispatches calls to the owning
//! server, and owns the full lifecycle of every invocation: an active set of
//! in-flight records and a bounded in-memory history of terminal ones. The
//! two sets are disjoint; a record lives in exactly one.
//!
//! Record status moves `pending → running → {completed | failed | cancelled}`
//! and never re-enters a non-terminal state. A dispatch timeout terminates
//! the record as cancelled, exactly like an explicit cancellation.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::ToolCatalog;
use crate::connection::ConnectionManager;
use crate::error::{CoreError, Result};
use crate::events::{CoreEvent, EventBus};

const DEFAULT_HISTORY_LIMIT: usize = 500;
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Status of an invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

/// In-flight or terminal record of one tool invocation
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub invocation_id: Uuid,
    /// Fully-qualified tool name
    pub tool: String,
    /// Owning server id
    pub server: String,
    pub arguments: Value,
    pub session_id: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub duration_ms: Option<i64>,
}

/// Aggregate statistics computed from history
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionStatistics {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total_duration_ms: i64,
    pub average_duration_ms: f64,
}

struct ActiveExecution {
    record: ExecutionRecord,
    /// Present until the invocation is cancelled or reaches a terminal state
    cancel_tx: Option<oneshot::Sender<()>>,
}

/// Dispatches tool calls and tracks their lifecycle
pub struct ExecutionEngine {
    connections: Arc<ConnectionManager>,
    catalog: Arc<ToolCatalog>,
    events: EventBus,
    active: DashMap<Uuid, ActiveExecution>,
    history: Mutex<VecDeque<ExecutionRecord>>,
    history_limit: usize,
    call_timeout: Duration,
}

impl ExecutionEngine {
    pub fn new(
        connections: Arc<ConnectionManager>,
        catalog: Arc<ToolCatalog>,
        events: EventBus,
    ) -> Self {
        Self {
            connections,
            catalog,
            events,
            active: DashMap::new(),
            history: Mutex::new(VecDeque::new()),
            history_limit: DEFAULT_HISTORY_LIMIT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Execute a tool by bare or qualified name.
    ///
    /// Resolution failures return an error without creating a record. Once a
    /// record exists, every outcome (success, failure, timeout, cancellation)
    /// terminates it and returns the terminal record.
    pub async fn execute(
        &self,
        tool_name: &str,
        arguments: Value,
        session_id: &str,
    ) -> Result<ExecutionRecord> {
        // Fail fast before any record exists
        let descriptor = self.catalog.resolve(tool_name)?;
        if let crate::catalog::ToolSchema::Invalid { reason } = &descriptor.schema {
            return Err(CoreError::ToolNotCallable {
                name: descriptor.qualified_name.clone(),
                reason: reason.clone(),
            });
        }

        let invocation_id = Uuid::new_v4();
        let record = ExecutionRecord {
            invocation_id,
            tool: descriptor.qualified_name.clone(),
            server: descriptor.server.clone(),
            arguments: arguments.clone(),
            session_id: session_id.to_string(),
            status: ExecutionStatus::Pending,
            started_at: Utc::now(),
            ended_at: None,
            result: None,
            error: None,
            duration_ms: None,
        };
        let initial = record.clone();

        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        self.active.insert(
            invocation_id,
            ActiveExecution {
                record,
                cancel_tx: Some(cancel_tx),
            },
        );
        self.events.publish(CoreEvent::ExecutionStarted {
            invocation_id,
            tool: descriptor.qualified_name.clone(),
            session_id: session_id.to_string(),
        });
        info!(
            invocation = %invocation_id,
            tool = %descriptor.qualified_name,
            session = %session_id,
            "Execution started"
        );

        self.set_running(invocation_id);

        // The connection may have dropped between resolution and dispatch
        let client = match self.connections.client(&descriptor.server) {
            Some(client) if client.is_alive() => client,
            Some(_) => {
                self.connections
                    .mark_error(&descriptor.server, "transport died before dispatch")
                    .await;
                let record = self.finish(
                    invocation_id,
                    ExecutionStatus::Failed,
                    None,
                    Some(CoreError::ServerUnavailable(descriptor.server.clone()).to_string()),
                );
                return Ok(record.unwrap_or(initial));
            }
            None => {
                let record = self.finish(
                    invocation_id,
                    ExecutionStatus::Failed,
                    None,
                    Some(CoreError::ServerUnavailable(descriptor.server.clone()).to_string()),
                );
                return Ok(record.unwrap_or(initial));
            }
        };

        let call = client.call_tool(&descriptor.name, arguments, self.call_timeout);
        tokio::pin!(call);

        let outcome = tokio::select! {
            result = &mut call => Some(result),
            _ = &mut cancel_rx => None,
        };

        let record = match outcome {
            // Cancelled: the dispatched call is abandoned, its result discarded
            None => self.finish(
                invocation_id,
                ExecutionStatus::Cancelled,
                None,
                Some("cancelled by request".to_string()),
            ),
            Some(Ok(result)) => {
                if result.is_error {
                    self.finish(
                        invocation_id,
                        ExecutionStatus::Failed,
                        None,
                        Some(result.text()),
                    )
                } else {
                    self.finish(
                        invocation_id,
                        ExecutionStatus::Completed,
                        Some(result.text()),
                        None,
                    )
                }
            }
            // Timeout is a cancellation variant, not a failure
            Some(Err(e)) if e.is_timeout() => self.finish(
                invocation_id,
                ExecutionStatus::Cancelled,
                None,
                Some(e.to_string()),
            ),
            Some(Err(e)) => self.finish(
                invocation_id,
                ExecutionStatus::Failed,
                None,
                Some(e.to_string()),
            ),
        };

        Ok(record.unwrap_or(initial))
    }

    /// Request cancellation of an active invocation.
    ///
    /// Idempotent: unknown or already-terminal invocations are a no-op.
    /// Returns whether a cancellation signal was delivered.
    pub fn cancel(&self, invocation_id: Uuid) -> bool {
        if let Some(mut active) = self.active.get_mut(&invocation_id) {
            if let Some(tx) = active.cancel_tx.take() {
                info!(invocation = %invocation_id, "Cancellation requested");
                let _ = tx.send(());
                return true;
            }
        }
        debug!(invocation = %invocation_id, "Cancel is a no-op");
        false
    }

    /// Snapshot of all in-flight invocations
    pub fn active_executions(&self) -> Vec<ExecutionRecord> {
        let mut records: Vec<ExecutionRecord> =
            self.active.iter().map(|e| e.value().record.clone()).collect();
        records.sort_by_key(|r| r.started_at);
        records
    }

    /// Terminal records, optionally filtered by session id
    pub fn history(&self, session_id: Option<&str>) -> Vec<ExecutionRecord> {
        self.history
            .lock()
            .iter()
            .filter(|r| session_id.map(|s| r.session_id == s).unwrap_or(true))
            .cloned()
            .collect()
    }

    /// Aggregate counts and durations over history
    pub fn statistics(&self, session_id: Option<&str>) -> ExecutionStatistics {
        let history = self.history(session_id);

        let total = history.len();
        let succeeded = history
            .iter()
            .filter(|r| r.status == ExecutionStatus::Completed)
            .count();
        let failed = history
            .iter()
            .filter(|r| r.status == ExecutionStatus::Failed)
            .count();
        let cancelled = history
            .iter()
            .filter(|r| r.status == ExecutionStatus::Cancelled)
            .count();
        let total_duration_ms: i64 = history.iter().filter_map(|r| r.duration_ms).sum();
        let average_duration_ms = if total > 0 {
            total_duration_ms as f64 / total as f64
        } else {
            0.0
        };

        ExecutionStatistics {
            total,
            succeeded,
            failed,
            cancelled,
            total_duration_ms,
            average_duration_ms,
        }
    }

    /// Drop terminal records older than `max_age`. Active records are
    /// untouched by construction; they live in a different set.
    pub fn prune_history(&self, max_age: Duration) -> usize {
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return 0;
        };
        let cutoff = Utc::now() - max_age;

        let mut history = self.history.lock();
        let before = history.len();
        history.retain(|r| r.ended_at.map(|t| t > cutoff).unwrap_or(true));
        before - history.len()
    }

    fn set_running(&self, invocation_id: Uuid) {
        if let Some(mut active) = self.active.get_mut(&invocation_id) {
            active.record.status = ExecutionStatus::Running;
        }
    }

    /// Atomically move an invocation from the active set into history
    fn finish(
        &self,
        invocation_id: Uuid,
        status: ExecutionStatus,
        result: Option<String>,
        error: Option<String>,
    ) -> Option<ExecutionRecord> {
        let (_, active) = self.active.remove(&invocation_id)?;
        let mut record = active.record;

        let ended_at = Utc::now();
        record.status = status;
        record.ended_at = Some(ended_at);
        record.duration_ms = Some((ended_at - record.started_at).num_milliseconds());
        record.result = result;
        record.error = error;

        match status {
            ExecutionStatus::Completed => {
                info!(
                    invocation = %invocation_id,
                    tool = %record.tool,
                    duration_ms = record.duration_ms,
                    "Execution completed"
                );
                self.events.publish(CoreEvent::ExecutionCompleted {
                    invocation_id,
                    tool: record.tool.clone(),
                });
            }
            ExecutionStatus::Failed => {
                warn!(
                    invocation = %invocation_id,
                    tool = %record.tool,
                    error = ?record.error,
                    "Execution failed"
                );
                self.events.publish(CoreEvent::ExecutionFailed {
                    invocation_id,
                    tool: record.tool.clone(),
                    error: record.error.clone().unwrap_or_default(),
                });
            }
            ExecutionStatus::Cancelled => {
                info!(
                    invocation = %invocation_id,
                    tool = %record.tool,
                    "Execution cancelled"
                );
                self.events.publish(CoreEvent::ExecutionCancelled {
                    invocation_id,
                    tool: record.tool.clone(),
                });
            }
            ExecutionStatus::Pending | ExecutionStatus::Running => {
                debug!(invocation = %invocation_id, "Finish called with non-terminal status");
            }
        }

        let mut history = self.history.lock();
        history.push_back(record.clone());
        while history.len() > self.history_limit {
            history.pop_front();
        }

        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ToolInfo;
    use crate::config::{MemoryConfigStore, ServerConfig};
    use crate::connection::ConnectionState;
    use crate::registry::ServerRegistry;
    use crate::transport::testing::ScriptedTransport;
    use serde_json::json;

    fn tool(name: &str) -> ToolInfo {
        ToolInfo {
            name: name.to_string(),
            description: None,
            input_schema: json!({"type": "object", "properties": {}}),
        }
    }

    fn schemaless_tool(name: &str) -> ToolInfo {
        ToolInfo {
            name: name.to_string(),
            description: None,
            input_schema: Value::Null,
        }
    }

    struct Fixture {
        manager: Arc<ConnectionManager>,
        engine: Arc<ExecutionEngine>,
        events: EventBus,
    }

    async fn fixture(servers: Vec<(&str, Arc<ScriptedTransport>)>) -> Fixture {
        let configs = servers
            .iter()
            .map(|(id, _)| ServerConfig::new(*id, "cmd"))
            .collect();
        let store = Arc::new(MemoryConfigStore::new(configs));
        let registry = Arc::new(ServerRegistry::load(store).await.unwrap());
        let events = EventBus::default();
        let manager = Arc::new(ConnectionManager::new(registry, events.clone()));

        for (id, transport) in servers {
            manager
                .connect_inner(id, Some(Box::new(transport)))
                .await
                .unwrap();
        }

        let catalog = Arc::new(ToolCatalog::new(Arc::clone(&manager)));
        let engine = Arc::new(ExecutionEngine::new(
            Arc::clone(&manager),
            catalog,
            events.clone(),
        ));

        Fixture {
            manager,
            engine,
            events,
        }
    }

    #[tokio::test]
    async fn test_execute_completes_and_lands_in_history() {
        let transport = Arc::new(ScriptedTransport::new(vec![tool("get_weather")]));
        let fx = fixture(vec![("weather", transport)]).await;

        let record = fx
            .engine
            .execute("get_weather", json!({"location": "NYC"}), "session-1")
            .await
            .unwrap();

        assert_eq!(record.status, ExecutionStatus::Completed);
        assert!(record.result.as_deref().unwrap().contains("NYC"));
        assert!(record.duration_ms.is_some());

        let history = fx.engine.history(Some("session-1"));
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].invocation_id, record.invocation_id);
        assert!(fx.engine.active_executions().is_empty());
    }

    #[tokio::test]
    async fn test_unresolvable_tool_creates_no_record() {
        let transport = Arc::new(ScriptedTransport::new(vec![tool("get_weather")]));
        let fx = fixture(vec![("weather", transport)]).await;

        let result = fx.engine.execute("no_such_tool", json!({}), "s").await;
        assert!(matches!(result, Err(CoreError::ToolNotFound(_))));

        assert!(fx.engine.active_executions().is_empty());
        assert!(fx.engine.history(None).is_empty());
    }

    #[tokio::test]
    async fn test_non_callable_tool_creates_no_record() {
        let transport = Arc::new(ScriptedTransport::new(vec![schemaless_tool("broken")]));
        let fx = fixture(vec![("srv", transport)]).await;

        let result = fx.engine.execute("broken", json!({}), "s").await;
        assert!(matches!(result, Err(CoreError::ToolNotCallable { .. })));
        assert!(fx.engine.history(None).is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_executions_match_results() {
        let transport = Arc::new(
            ScriptedTransport::new(vec![tool("echo")])
                .with_call_delay(Duration::from_millis(20)),
        );
        let fx = fixture(vec![("srv", transport)]).await;

        let e1 = Arc::clone(&fx.engine);
        let e2 = Arc::clone(&fx.engine);
        let (r1, r2) = tokio::join!(
            e1.execute("echo", json!({"n": 1}), "s"),
            e2.execute("echo", json!({"n": 2}), "s"),
        );
        let r1 = r1.unwrap();
        let r2 = r2.unwrap();

        assert_eq!(r1.status, ExecutionStatus::Completed);
        assert_eq!(r2.status, ExecutionStatus::Completed);
        assert_ne!(r1.invocation_id, r2.invocation_id);
        assert!(r1.result.as_deref().unwrap().contains("\"n\":1"));
        assert!(r2.result.as_deref().unwrap().contains("\"n\":2"));
    }

    #[tokio::test]
    async fn test_cancel_mid_flight() {
        let transport = Arc::new(
            ScriptedTransport::new(vec![tool("slow")])
                .with_call_delay(Duration::from_millis(500)),
        );
        let fx = fixture(vec![("srv", transport)]).await;
        let mut rx = fx.events.subscribe();

        let engine = Arc::clone(&fx.engine);
        let handle =
            tokio::spawn(async move { engine.execute("slow", json!({}), "s").await });

        // Learn the invocation id from the started event
        let invocation_id = loop {
            match rx.recv().await.unwrap() {
                CoreEvent::ExecutionStarted { invocation_id, .. } => break invocation_id,
                _ => continue,
            }
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(fx.engine.cancel(invocation_id));

        let record = handle.await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Cancelled);
        assert_eq!(record.invocation_id, invocation_id);

        // No completed record exists for the same invocation
        let history = fx.engine.history(None);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, ExecutionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_after_completion_is_noop() {
        let transport = Arc::new(ScriptedTransport::new(vec![tool("echo")]));
        let fx = fixture(vec![("srv", transport)]).await;

        let record = fx
            .engine
            .execute("echo", json!({"x": 1}), "s")
            .await
            .unwrap();
        assert_eq!(record.status, ExecutionStatus::Completed);

        assert!(!fx.engine.cancel(record.invocation_id));

        let history = fx.engine.history(None);
        assert_eq!(history[0].status, ExecutionStatus::Completed);
        assert_eq!(history[0].result, record.result);
    }

    #[tokio::test]
    async fn test_cancel_unknown_invocation_is_noop() {
        let transport = Arc::new(ScriptedTransport::new(vec![tool("echo")]));
        let fx = fixture(vec![("srv", transport)]).await;
        assert!(!fx.engine.cancel(Uuid::new_v4()));
    }

    #[tokio::test]
    async fn test_timeout_terminates_as_cancelled() {
        let transport = Arc::new(
            ScriptedTransport::new(vec![tool("stuck")])
                .with_call_delay(Duration::from_secs(3600)),
        );
        let fx = fixture(vec![("srv", transport)]).await;
        let engine = ExecutionEngine::new(
            Arc::clone(&fx.manager),
            Arc::new(ToolCatalog::new(Arc::clone(&fx.manager))),
            fx.events.clone(),
        )
        .with_call_timeout(Duration::from_millis(50));

        let record = engine.execute("stuck", json!({}), "s").await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Cancelled);
        assert!(record.error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_dead_transport_fails_record_and_downgrades_server() {
        let transport = Arc::new(ScriptedTransport::new(vec![tool("echo")]));
        let fx = fixture(vec![("srv", Arc::clone(&transport))]).await;

        transport.kill();

        let record = fx.engine.execute("echo", json!({}), "s").await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert!(record.error.as_deref().unwrap().contains("not available"));

        let status = fx.manager.status("srv").unwrap();
        assert!(matches!(status.state, ConnectionState::Error(_)));
    }

    #[tokio::test]
    async fn test_active_and_history_are_disjoint_and_prune_spares_running() {
        let transport = Arc::new(
            ScriptedTransport::new(vec![tool("slow"), tool("fast")])
                .with_call_delay(Duration::from_millis(200)),
        );
        let fx = fixture(vec![("srv", transport)]).await;
        let mut rx = fx.events.subscribe();

        let engine = Arc::clone(&fx.engine);
        let handle =
            tokio::spawn(async move { engine.execute("slow", json!({}), "s").await });
        let invocation_id = loop {
            match rx.recv().await.unwrap() {
                CoreEvent::ExecutionStarted { invocation_id, .. } => break invocation_id,
                _ => continue,
            }
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Running record is active, not in history, and survives pruning
        assert_eq!(fx.engine.active_executions().len(), 1);
        assert!(fx.engine.history(None).is_empty());
        assert_eq!(fx.engine.prune_history(Duration::ZERO), 0);
        assert_eq!(fx.engine.active_executions().len(), 1);

        fx.engine.cancel(invocation_id);
        handle.await.unwrap().unwrap();

        // Terminal record moved to history, then pruned by max_age 0
        assert!(fx.engine.active_executions().is_empty());
        assert_eq!(fx.engine.history(None).len(), 1);
        assert_eq!(fx.engine.prune_history(Duration::ZERO), 1);
        assert!(fx.engine.history(None).is_empty());
    }

    #[tokio::test]
    async fn test_statistics_match_history() {
        let transport = Arc::new(ScriptedTransport::new(vec![tool("echo")]));
        let fx = fixture(vec![("srv", Arc::clone(&transport))]).await;

        fx.engine
            .execute("echo", json!({"a": 1}), "s1")
            .await
            .unwrap();
        transport
            .fail_calls
            .store(true, std::sync::atomic::Ordering::SeqCst);
        fx.engine.execute("echo", json!({}), "s1").await.unwrap();
        transport
            .fail_calls
            .store(false, std::sync::atomic::Ordering::SeqCst);
        fx.engine
            .execute("echo", json!({"b": 2}), "s2")
            .await
            .unwrap();

        let stats = fx.engine.statistics(None);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.succeeded, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.cancelled, 0);
        let reconstructed = stats.average_duration_ms * stats.total as f64;
        assert!((reconstructed - stats.total_duration_ms as f64).abs() < 1e-6);

        let s1 = fx.engine.statistics(Some("s1"));
        assert_eq!(s1.total, 2);
        assert_eq!(s1.succeeded, 1);
        assert_eq!(s1.failed, 1);
    }

    #[tokio::test]
    async fn test_history_bound_evicts_oldest() {
        let transport = Arc::new(ScriptedTransport::new(vec![tool("echo")]));
        let fx = fixture(vec![("srv", transport)]).await;
        let engine = ExecutionEngine::new(
            Arc::clone(&fx.manager),
            Arc::new(ToolCatalog::new(Arc::clone(&fx.manager))),
            fx.events.clone(),
        )
        .with_history_limit(2);

        for i in 0..3 {
            engine.execute("echo", json!({"i": i}), "s").await.unwrap();
        }

        let history = engine.history(None);
        assert_eq!(history.len(), 2);
        assert!(history[0].arguments["i"] == json!(1));
        assert!(history[1].arguments["i"] == json!(2));
    }
}
