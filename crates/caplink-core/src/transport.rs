//! Transport layer for capability servers
//!
//! Line-delimited JSON-RPC 2.0 over a child process's standard streams, plus
//! an HTTP transport for remote servers. Requests are routed back to their
//! callers through a pending-request map, so any number of calls can be
//! outstanding on one transport at a time.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::config::ServerConfig;
use crate::error::{CoreError, Result};

/// JSON-RPC 2.0 request
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

/// Transport trait for capability server communication
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for its matching response, bounded by `timeout`
    async fn request(&self, method: &str, params: Option<Value>, timeout: Duration)
        -> Result<Value>;

    /// Send a notification (no response expected)
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()>;

    /// Whether the transport is still usable
    fn is_alive(&self) -> bool;

    /// Close the transport, terminating any owned process
    async fn close(&self) -> Result<()>;
}

/// Stdio transport for servers running as child processes
pub struct StdioTransport {
    server_id: String,
    writer_tx: mpsc::Sender<String>,
    pending: Arc<DashMap<u64, oneshot::Sender<JsonRpcResponse>>>,
    child: Arc<tokio::sync::Mutex<tokio::process::Child>>,
    request_id: AtomicU64,
    alive: Arc<AtomicBool>,
    last_stderr: Arc<Mutex<Option<String>>>,
}

impl StdioTransport {
    /// Spawn the configured command and wire up its streams.
    ///
    /// The child's stderr is the diagnostic channel; it is drained to the log
    /// on a background task and never mixed into the protocol stream.
    pub fn spawn(config: &ServerConfig) -> Result<Self> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Env values merge over the inherited host environment
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        if let Some(dir) = &config.cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| CoreError::Connection {
            server: config.id.clone(),
            reason: format!("failed to spawn '{}': {}", config.command, e),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| CoreError::Connection {
            server: config.id.clone(),
            reason: "failed to capture stdin".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| CoreError::Connection {
            server: config.id.clone(),
            reason: "failed to capture stdout".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| CoreError::Connection {
            server: config.id.clone(),
            reason: "failed to capture stderr".to_string(),
        })?;

        let server_id = config.id.clone();
        let pending: Arc<DashMap<u64, oneshot::Sender<JsonRpcResponse>>> =
            Arc::new(DashMap::new());
        let alive = Arc::new(AtomicBool::new(true));
        let last_stderr = Arc::new(Mutex::new(None));

        // Writer task
        let (writer_tx, mut writer_rx) = mpsc::channel::<String>(32);
        let mut stdin = stdin;
        tokio::spawn(async move {
            while let Some(msg) = writer_rx.recv().await {
                if stdin.write_all(msg.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        // Reader task: route responses to their pending callers by id
        let pending_reader = Arc::clone(&pending);
        let alive_reader = Arc::clone(&alive);
        let reader_id = server_id.clone();
        let mut reader = BufReader::new(stdout);
        tokio::spawn(async move {
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => break, // EOF
                    Ok(_) => {
                        let Ok(response) = serde_json::from_str::<JsonRpcResponse>(&line) else {
                            debug!(server = %reader_id, "Skipping unparseable message");
                            continue;
                        };
                        match response.id {
                            Some(id) => {
                                if let Some((_, tx)) = pending_reader.remove(&id) {
                                    let _ = tx.send(response);
                                }
                            }
                            // Server-initiated notification
                            None => debug!(server = %reader_id, "Ignoring server notification"),
                        }
                    }
                    Err(_) => break,
                }
            }
            alive_reader.store(false, Ordering::SeqCst);
            // Wake any callers still waiting on a dead transport
            pending_reader.clear();
        });

        // Stderr drain task: diagnostics only, kept out of the protocol stream
        let stderr_id = server_id.clone();
        let stderr_last = Arc::clone(&last_stderr);
        let mut err_reader = BufReader::new(stderr);
        tokio::spawn(async move {
            let mut line = String::new();
            loop {
                line.clear();
                match err_reader.read_line(&mut line).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        let trimmed = line.trim_end();
                        if !trimmed.is_empty() {
                            debug!(server = %stderr_id, "server stderr: {}", trimmed);
                            *stderr_last.lock() = Some(trimmed.to_string());
                        }
                    }
                }
            }
        });

        Ok(Self {
            server_id,
            writer_tx,
            pending,
            child: Arc::new(tokio::sync::Mutex::new(child)),
            request_id: AtomicU64::new(1),
            alive,
            last_stderr,
        })
    }

    /// Most recent line the server wrote to stderr, if any
    pub fn last_stderr(&self) -> Option<String> {
        self.last_stderr.lock().clone()
    }

    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::SeqCst)
    }
}

/// Clears a request's pending entry however its future ends.
///
/// A cancelled caller drops the request future mid-await; without this the
/// entry would sit in the map until the server answered or the transport
/// died. Already-routed entries are gone from the map, so the remove is a
/// no-op in the success path.
struct PendingGuard<'a> {
    pending: &'a DashMap<u64, oneshot::Sender<JsonRpcResponse>>,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        if !self.is_alive() {
            return Err(CoreError::Connection {
                server: self.server_id.clone(),
                reason: "transport closed".to_string(),
            });
        }

        let id = self.next_id();
        let request = JsonRpcRequest::new(id, method, params);

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        let _guard = PendingGuard {
            pending: &*self.pending,
            id,
        };

        let msg = serde_json::to_string(&request)
            .map_err(|e| CoreError::Protocol(format!("failed to encode request: {}", e)))?
            + "\n";
        if self.writer_tx.send(msg).await.is_err() {
            return Err(CoreError::Connection {
                server: self.server_id.clone(),
                reason: "transport write channel closed".to_string(),
            });
        }

        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                return Err(CoreError::Connection {
                    server: self.server_id.clone(),
                    reason: self
                        .last_stderr()
                        .map(|s| format!("server closed connection: {}", s))
                        .unwrap_or_else(|| "server closed connection".to_string()),
                });
            }
            Err(_) => {
                return Err(CoreError::ExecutionTimeout(timeout));
            }
        };

        if let Some(error) = response.error {
            return Err(CoreError::Protocol(error.to_string()));
        }

        Ok(response.result.unwrap_or(Value::Null))
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params
        });

        let msg = notification.to_string() + "\n";
        self.writer_tx
            .send(msg)
            .await
            .map_err(|_| CoreError::Connection {
                server: self.server_id.clone(),
                reason: "transport write channel closed".to_string(),
            })
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.alive.store(false, Ordering::SeqCst);

        let mut child = self.child.lock().await;
        if let Err(e) = child.kill().await {
            warn!(server = %self.server_id, error = %e, "Failed to kill server process");
        }
        Ok(())
    }
}

/// HTTP transport for remote capability servers
pub struct HttpTransport {
    base_url: String,
    client: reqwest::Client,
    request_id: AtomicU64,
    alive: AtomicBool,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
            request_id: AtomicU64::new(1),
            alive: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest::new(id, method, params);

        let response = self
            .client
            .post(&self.base_url)
            .json(&request)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CoreError::ExecutionTimeout(timeout)
                } else {
                    CoreError::Connection {
                        server: self.base_url.clone(),
                        reason: e.to_string(),
                    }
                }
            })?;

        if !response.status().is_success() {
            return Err(CoreError::Protocol(format!(
                "server returned status {}",
                response.status()
            )));
        }

        let rpc: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| CoreError::Protocol(format!("failed to parse response: {}", e)))?;

        if let Some(error) = rpc.error {
            return Err(CoreError::Protocol(error.to_string()));
        }

        Ok(rpc.result.unwrap_or(Value::Null))
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params
        });

        self.client
            .post(&self.base_url)
            .json(&notification)
            .send()
            .await
            .map_err(|e| CoreError::Connection {
                server: self.base_url.clone(),
                reason: e.to_string(),
            })?;

        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.alive.store(false, Ordering::SeqCst);
        Ok(())
    }
}
