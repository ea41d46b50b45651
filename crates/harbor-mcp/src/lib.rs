// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Universal MCP bridge.
//!
//! Connects to any Model-Context-Protocol server over stdio (newline-
//! delimited JSON-RPC 2.0) or HTTP (one POST per request), performs the
//! `initialize` handshake, caches `tools/list` results, and forwards
//! `tools/call` invocations.  Cached descriptors can be re-exported as
//! native tool definitions under `mcp:<name>` prefixed names.

mod bridge;
mod client;
mod transport;
mod types;

pub use bridge::McpClientTool;
pub use client::McpClient;
pub use transport::{HttpTransport, McpTransport, StdioTransport};
pub use types::{
    JsonRpcError, JsonRpcRequest, JsonRpcResponse, McpContent, McpError, McpToolDef,
    ToolCallResult, ToolsListResult, PROTOCOL_VERSION,
};
