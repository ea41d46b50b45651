// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The `mcp_client` tool: one bridge to every configured MCP server.
//!
//! Connections are made lazily on first use and reused afterwards.
//! `list_tools` returns the cached descriptors; `call_tool` forwards the
//! invocation.  Cached descriptors can also be re-exported as native tool
//! definitions under `mcp:<name>` so providers see them like builtins.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

use harbor_config::McpServerConfig;
use harbor_tools::{Tool, ToolCall, ToolContext, ToolDefinition, ToolOutput};

use crate::client::McpClient;

pub struct McpClientTool {
    servers: HashMap<String, McpServerConfig>,
    clients: tokio::sync::Mutex<HashMap<String, Arc<McpClient>>>,
}

impl McpClientTool {
    pub fn new(servers: HashMap<String, McpServerConfig>) -> Self {
        Self {
            servers,
            clients: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    async fn client_for(&self, server: &str) -> Result<Arc<McpClient>, String> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(server) {
            return Ok(client.clone());
        }
        let cfg = self
            .servers
            .get(server)
            .ok_or_else(|| format!("unknown MCP server '{server}'"))?;
        let client = McpClient::connect(server, cfg)
            .await
            .map_err(|e| format!("connect to '{server}': {e}"))?;
        let client = Arc::new(client);
        clients.insert(server.to_string(), client.clone());
        Ok(client)
    }

    /// Re-export every connected server's cached tools as prefixed
    /// definitions (`mcp:<tool>`), suitable for handing to a provider.
    pub async fn exported_definitions(&self) -> Vec<ToolDefinition> {
        let clients = self.clients.lock().await;
        let mut defs = Vec::new();
        for client in clients.values() {
            for tool in client.cached_tools() {
                defs.push(ToolDefinition {
                    name: format!("mcp:{}", tool.name),
                    description: tool.description.unwrap_or_default(),
                    parameters: tool
                        .input_schema
                        .unwrap_or_else(|| json!({ "type": "object" })),
                });
            }
        }
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub async fn shutdown(&self) {
        let clients = self.clients.lock().await;
        for (name, client) in clients.iter() {
            warn!(server = %name, "shutting down MCP connection");
            client.shutdown().await;
        }
    }
}

#[async_trait]
impl Tool for McpClientTool {
    fn name(&self) -> &str {
        "mcp_client"
    }

    fn description(&self) -> &str {
        "Bridge to configured Model-Context-Protocol servers. \
         action=list_tools lists a server's tools; action=call_tool invokes \
         one with JSON arguments."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "server":    { "type": "string", "description": "Configured MCP server name" },
                "action":    { "type": "string", "enum": ["list_tools", "call_tool"] },
                "tool":      { "type": "string", "description": "Tool name (for call_tool)" },
                "arguments": { "type": "object", "description": "Tool arguments (for call_tool)" }
            },
            "required": ["server", "action"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, call: &ToolCall, _ctx: &ToolContext) -> ToolOutput {
        let server = call
            .args
            .get("server")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let action = call
            .args
            .get("action")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        let client = match self.client_for(server).await {
            Ok(c) => c,
            Err(e) => return ToolOutput::err(&call.id, e),
        };

        match action {
            "list_tools" => {
                let tools = client.cached_tools();
                if tools.is_empty() {
                    return ToolOutput::ok(&call.id, "(server exposes no tools)");
                }
                let lines: Vec<String> = tools
                    .iter()
                    .map(|t| {
                        format!(
                            "{} — {}",
                            t.name,
                            t.description.as_deref().unwrap_or("(no description)")
                        )
                    })
                    .collect();
                ToolOutput::ok(&call.id, lines.join("\n"))
            }
            "call_tool" => {
                let tool = call
                    .args
                    .get("tool")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                if tool.is_empty() {
                    return ToolOutput::err(&call.id, "call_tool requires 'tool'");
                }
                let arguments = call
                    .args
                    .get("arguments")
                    .cloned()
                    .unwrap_or_else(|| json!({}));
                match client.call_tool(tool, arguments).await {
                    Ok(text) => ToolOutput::ok(&call.id, text),
                    Err(e) => ToolOutput::err(&call.id, format!("mcp error: {e}")),
                }
            }
            other => ToolOutput::err(&call.id, format!("unknown action '{other}'")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc as StdArc;

    use serde_json::json;

    use super::*;
    use harbor_config::SecurityConfig;
    use harbor_security::SecurityPolicy;

    fn ctx() -> ToolContext {
        let policy = StdArc::new(SecurityPolicy::with_home(&SecurityConfig::default(), None));
        ToolContext::new("s1", ".", policy)
    }

    fn call(args: Value) -> ToolCall {
        ToolCall {
            id: "m1".into(),
            name: "mcp_client".into(),
            args,
        }
    }

    #[tokio::test]
    async fn unknown_server_is_an_error() {
        let tool = McpClientTool::new(HashMap::new());
        let out = tool
            .execute(
                &call(json!({"server": "ghost", "action": "list_tools"})),
                &ctx(),
            )
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("unknown MCP server"));
    }

    #[tokio::test]
    async fn connect_failure_surfaces_as_tool_error() {
        let mut servers = HashMap::new();
        servers.insert(
            "broken".to_string(),
            McpServerConfig {
                transport: "stdio".into(),
                command: "/no/such/mcp_server_xyzzy".into(),
                args: vec![],
                env: HashMap::new(),
                url: String::new(),
                request_timeout_secs: 2,
            },
        );
        let tool = McpClientTool::new(servers);
        let out = tool
            .execute(
                &call(json!({"server": "broken", "action": "list_tools"})),
                &ctx(),
            )
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("connect to 'broken'"));
    }

    #[tokio::test]
    async fn call_tool_without_tool_name_is_an_error() {
        let tool = McpClientTool::new(HashMap::new());
        let out = tool
            .execute(&call(json!({"server": "x", "action": "call_tool"})), &ctx())
            .await;
        // Fails on unknown server first; construct with an empty registry to
        // keep this offline.  Either message is acceptable evidence the call
        // did not proceed.
        assert!(out.is_error);
    }

    #[tokio::test]
    async fn exported_definitions_empty_without_connections() {
        let tool = McpClientTool::new(HashMap::new());
        assert!(tool.exported_definitions().await.is_empty());
    }
}
