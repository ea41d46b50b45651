// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! A connected MCP client for a single server: initialize handshake,
//! `tools/list` with caching, `tools/call`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, info};

use harbor_config::McpServerConfig;

use crate::transport::{HttpTransport, McpTransport, StdioTransport};
use crate::types::{
    extract_text_content, InitializeParams, InitializeResult, JsonRpcRequest, McpError,
    McpToolDef, ToolCallParams, ToolCallResult, ToolsListResult, PROTOCOL_VERSION,
};

pub struct McpClient {
    name: String,
    transport: McpTransport,
    next_id: AtomicU64,
    request_timeout: Duration,
    /// Cached descriptors from the last `tools/list`.
    tools: Mutex<Vec<McpToolDef>>,
}

impl McpClient {
    /// Connect, run the `initialize` handshake, send the initialized
    /// notification, and prime the tool cache.
    pub async fn connect(name: &str, cfg: &McpServerConfig) -> Result<Self, McpError> {
        info!(server = %name, transport = %cfg.transport, "connecting to MCP server");

        let transport = match cfg.transport.as_str() {
            "stdio" => {
                if cfg.command.is_empty() {
                    return Err(McpError::Protocol("stdio transport needs a command".into()));
                }
                McpTransport::Stdio(StdioTransport::spawn(&cfg.command, &cfg.args, &cfg.env).await?)
            }
            "http" => {
                if cfg.url.is_empty() {
                    return Err(McpError::Protocol("http transport needs a url".into()));
                }
                McpTransport::Http(HttpTransport::new(&cfg.url, cfg.env.clone()))
            }
            other => {
                return Err(McpError::Protocol(format!("unknown transport '{other}'")))
            }
        };

        let client = Self {
            name: name.to_string(),
            transport,
            next_id: AtomicU64::new(1),
            request_timeout: Duration::from_secs(cfg.request_timeout_secs),
            tools: Mutex::new(Vec::new()),
        };

        client.initialize().await?;
        client.refresh_tools().await?;
        Ok(client)
    }

    async fn initialize(&self) -> Result<(), McpError> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.into(),
            capabilities: json!({}),
            client_info: crate::types::ClientInfo {
                name: "harbor".into(),
                version: env!("CARGO_PKG_VERSION").into(),
            },
        };

        let req = JsonRpcRequest::new(
            self.next_id(),
            "initialize",
            Some(serde_json::to_value(&params).map_err(|e| McpError::Protocol(e.to_string()))?),
        );
        let resp = self.transport.send_request(req, self.request_timeout).await?;

        if let Some(err) = resp.error {
            return Err(McpError::Rpc {
                code: err.code,
                message: format!("initialize failed: {}", err.message),
            });
        }
        if let Some(result) = resp.result {
            let init: InitializeResult = serde_json::from_value(result)
                .map_err(|e| McpError::Protocol(format!("initialize result: {e}")))?;
            info!(
                server = %self.name,
                protocol = %init.protocol_version,
                "MCP server initialized"
            );
        }

        // MCP requires the initialized notification before normal traffic.
        self.transport
            .send_notification(JsonRpcRequest::notification(
                "notifications/initialized",
                None,
            ))
            .await
    }

    /// Fetch (or refresh) the tool list and update the cache.
    pub async fn refresh_tools(&self) -> Result<Vec<McpToolDef>, McpError> {
        let req = JsonRpcRequest::new(self.next_id(), "tools/list", None);
        let resp = self.transport.send_request(req, self.request_timeout).await?;

        if let Some(err) = resp.error {
            // Method-not-found means the server exposes no tools; fine.
            if err.code == -32601 {
                debug!(server = %self.name, "server exposes no tools");
                self.tools.lock().unwrap().clear();
                return Ok(Vec::new());
            }
            return Err(McpError::Rpc {
                code: err.code,
                message: format!("tools/list failed: {}", err.message),
            });
        }

        let tools = match resp.result {
            Some(result) => {
                let list: ToolsListResult = serde_json::from_value(result)
                    .map_err(|e| McpError::Protocol(format!("tools/list result: {e}")))?;
                list.tools
            }
            None => Vec::new(),
        };
        info!(server = %self.name, count = tools.len(), "MCP tools listed");
        *self.tools.lock().unwrap() = tools.clone();
        Ok(tools)
    }

    /// Cached descriptors from the last `tools/list`.
    pub fn cached_tools(&self) -> Vec<McpToolDef> {
        self.tools.lock().unwrap().clone()
    }

    /// Call a tool and concatenate the text content of the response.
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<String, McpError> {
        let params = ToolCallParams {
            name: tool_name.into(),
            arguments,
        };
        let req = JsonRpcRequest::new(
            self.next_id(),
            "tools/call",
            Some(serde_json::to_value(&params).map_err(|e| McpError::Protocol(e.to_string()))?),
        );
        let resp = self.transport.send_request(req, self.request_timeout).await?;

        if let Some(err) = resp.error {
            return Err(McpError::Rpc {
                code: err.code,
                message: format!("tools/call '{tool_name}' failed: {}", err.message),
            });
        }

        let result = resp
            .result
            .ok_or_else(|| McpError::Protocol(format!("tools/call '{tool_name}': empty result")))?;
        let call_result: ToolCallResult = serde_json::from_value(result)
            .map_err(|e| McpError::Protocol(format!("tools/call result: {e}")))?;

        let text = extract_text_content(&call_result.content);
        if call_result.is_error {
            return Err(McpError::Rpc {
                code: 0,
                message: text,
            });
        }
        Ok(text)
    }

    pub async fn shutdown(&self) {
        info!(server = %self.name, "shutting down MCP server");
        self.transport.shutdown().await;
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}
