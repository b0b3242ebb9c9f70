//! Capability server protocol client
//!
//! Drives the handshake and the tool catalog/call methods over a
//! [`Transport`]. A client is only handed out after a successful handshake,
//! so every method can take `&self` and run concurrently.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::transport::Transport;

/// Protocol version exchanged during the handshake
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Client capabilities sent during initialization
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClientCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roots: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling: Option<Value>,
}

/// Client info for initialization
#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            name: "caplink".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Server capabilities returned during initialization
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerCapabilities {
    #[serde(default)]
    pub tools: Option<Value>,
    #[serde(default)]
    pub logging: Option<Value>,
}

/// Server info returned during initialization
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// Initialize result
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    pub capabilities: ServerCapabilities,
    pub server_info: ServerInfo,
}

/// Tool definition as declared by the server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Value,
}

/// Tool list result (paginated)
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsResult {
    pub tools: Vec<ToolInfo>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// One piece of tool call output
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultContent {
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

/// Tool call result
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    pub content: Vec<ToolResultContent>,
    #[serde(default)]
    pub is_error: bool,
}

impl CallToolResult {
    /// Flatten the content items into a single text blob
    pub fn text(&self) -> String {
        let mut parts = Vec::new();
        for content in &self.content {
            match content.content_type.as_str() {
                "image" => parts.push("[image data]".to_string()),
                _ => {
                    if let Some(text) = &content.text {
                        parts.push(text.clone());
                    }
                }
            }
        }
        parts.join("\n")
    }
}

/// Protocol client bound to one capability server
pub struct CapClient {
    transport: Box<dyn Transport>,
    server_info: ServerInfo,
    capabilities: ServerCapabilities,
    request_timeout: Duration,
}

impl CapClient {
    /// Perform the handshake over the given transport and return a live client.
    ///
    /// Sends `initialize`, checks the declared protocol version, then emits
    /// the `initialized` notification.
    pub async fn connect(transport: Box<dyn Transport>, timeout: Duration) -> Result<Self> {
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": ClientCapabilities::default(),
            "clientInfo": ClientInfo::default()
        });

        let result = transport.request("initialize", Some(params), timeout).await?;
        let init: InitializeResult = serde_json::from_value(result)
            .map_err(|e| CoreError::Protocol(format!("malformed initialize result: {}", e)))?;

        debug!(
            server = %init.server_info.name,
            version = init.server_info.version.as_deref().unwrap_or("unknown"),
            protocol = %init.protocol_version,
            "Handshake complete"
        );

        transport
            .notify("notifications/initialized", None)
            .await?;

        Ok(Self {
            transport,
            server_info: init.server_info,
            capabilities: init.capabilities,
            request_timeout: timeout,
        })
    }

    /// Server info from the handshake
    pub fn server_info(&self) -> &ServerInfo {
        &self.server_info
    }

    /// Server capabilities from the handshake
    pub fn capabilities(&self) -> &ServerCapabilities {
        &self.capabilities
    }

    /// Whether the underlying transport is still usable
    pub fn is_alive(&self) -> bool {
        self.transport.is_alive()
    }

    async fn request<T: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<T> {
        let result = self.transport.request(method, params, timeout).await?;
        serde_json::from_value(result)
            .map_err(|e| CoreError::Protocol(format!("malformed {} result: {}", method, e)))
    }

    /// Fetch the full tool catalog, following pagination cursors
    pub async fn list_tools(&self) -> Result<Vec<ToolInfo>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let params = cursor
                .as_ref()
                .map(|c| serde_json::json!({ "cursor": c }));

            let result: ListToolsResult = self
                .request("tools/list", params, self.request_timeout)
                .await?;

            tools.extend(result.tools);

            if result.next_cursor.is_none() {
                break;
            }
            cursor = result.next_cursor;
        }

        Ok(tools)
    }

    /// Call a tool by its server-local name
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<CallToolResult> {
        let params = serde_json::json!({
            "name": name,
            "arguments": arguments
        });

        self.request("tools/call", Some(params), timeout).await
    }

    /// Lightweight health probe
    pub async fn ping(&self, timeout: Duration) -> Result<()> {
        let _: Value = self.request("ping", None, timeout).await?;
        Ok(())
    }

    /// Close the underlying transport
    pub async fn close(&self) -> Result<()> {
        self.transport.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::ScriptedTransport;

    fn echo_tool() -> ToolInfo {
        ToolInfo {
            name: "echo".to_string(),
            description: Some("Echoes input".to_string()),
            input_schema: serde_json::json!({"type": "object", "properties": {}}),
        }
    }

    #[test]
    fn test_client_info_default() {
        let info = ClientInfo::default();
        assert_eq!(info.name, "caplink");
    }

    #[test]
    fn test_call_result_text_flattening() {
        let result = CallToolResult {
            content: vec![
                ToolResultContent {
                    content_type: "text".to_string(),
                    text: Some("line one".to_string()),
                    data: None,
                    mime_type: None,
                },
                ToolResultContent {
                    content_type: "image".to_string(),
                    text: None,
                    data: Some("...".to_string()),
                    mime_type: Some("image/png".to_string()),
                },
            ],
            is_error: false,
        };

        assert_eq!(result.text(), "line one\n[image data]");
    }

    #[tokio::test]
    async fn test_connect_and_list_tools() {
        let transport = ScriptedTransport::new(vec![echo_tool()]);
        let client = CapClient::connect(Box::new(transport), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(client.server_info().name, "scripted");
        assert!(client.capabilities().tools.is_some());

        let tools = client.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");
    }

    #[tokio::test]
    async fn test_call_tool_echoes_arguments() {
        let transport = ScriptedTransport::new(vec![echo_tool()]);
        let client = CapClient::connect(Box::new(transport), Duration::from_secs(5))
            .await
            .unwrap();

        let result = client
            .call_tool(
                "echo",
                serde_json::json!({"text": "hello"}),
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        assert!(!result.is_error);
        assert!(result.text().contains("hello"));
    }

    #[tokio::test]
    async fn test_ping_failure_surfaces() {
        let transport = ScriptedTransport::new(vec![]);
        transport.set_ping_failure(true);
        let client = CapClient::connect(Box::new(transport), Duration::from_secs(5))
            .await
            .unwrap();

        assert!(client.ping(Duration::from_secs(1)).await.is_err());
    }
}
