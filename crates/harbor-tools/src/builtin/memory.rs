// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Memory tools — the agent's interface to the hybrid store.
//!
//! Keys follow the colon-hierarchical convention: `u:<channel>:<user>:<subkey>`
//! for per-user data, `global:<subkey>` for shared facts.  Recall accepts a
//! `key_prefix` so a channel bridge can scope the agent to one user's
//! memories.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use harbor_memory::RecallOptions;

use crate::context::ToolContext;
use crate::tool::{Tool, ToolCall, ToolOutput};

pub struct MemoryStoreTool;

#[async_trait]
impl Tool for MemoryStoreTool {
    fn name(&self) -> &str {
        "memory_store"
    }

    fn description(&self) -> &str {
        "Store a memory under a hierarchical key (e.g. 'u:telegram:42:pref' or 'global:team'). \
         Storing under an existing key replaces it."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "key":      { "type": "string", "description": "Colon-hierarchical key" },
                "content":  { "type": "string", "description": "The fact to remember" },
                "metadata": { "type": "object", "description": "Optional key-value tags" }
            },
            "required": ["key", "content"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutput {
        let key = call.args.get("key").and_then(|v| v.as_str()).unwrap_or_default();
        let content = call
            .args
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let metadata = call.args.get("metadata").cloned();

        let Some(memory) = &ctx.memory else {
            return ToolOutput::err(&call.id, "no memory backend configured");
        };

        debug!(key = %key, "memory_store");
        match memory.store(key, content, metadata).await {
            Ok(()) => ToolOutput::ok(&call.id, format!("stored '{key}'")),
            Err(e) => ToolOutput::err(&call.id, format!("memory error: {e}")),
        }
    }
}

pub struct MemoryRecallTool;

#[async_trait]
impl Tool for MemoryRecallTool {
    fn name(&self) -> &str {
        "memory_recall"
    }

    fn description(&self) -> &str {
        "Recall memories matching a query (hybrid keyword + semantic search). \
         Pass key_prefix to restrict the search to one namespace."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query":      { "type": "string" },
                "limit":      { "type": "integer", "description": "Maximum results (default 5)" },
                "key_prefix": { "type": "string", "description": "Namespace scope, e.g. 'u:telegram:42:'" },
                "min_score":  { "type": "number", "description": "Minimum merged score" }
            },
            "required": ["query"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutput {
        let query = call
            .args
            .get("query")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        let Some(memory) = &ctx.memory else {
            return ToolOutput::err(&call.id, "no memory backend configured");
        };

        let opts = RecallOptions {
            limit: call
                .args
                .get("limit")
                .and_then(|v| v.as_u64())
                .map(|l| l as usize)
                .or(Some(5)),
            min_score: call.args.get("min_score").and_then(|v| v.as_f64()),
            key_prefix: call
                .args
                .get("key_prefix")
                .and_then(|v| v.as_str())
                .map(String::from),
            filter: None,
        };

        debug!(query = %query, prefix = ?opts.key_prefix, "memory_recall");
        match memory.recall(query, &opts).await {
            Ok(results) if results.is_empty() => ToolOutput::ok(&call.id, "(no memories found)"),
            Ok(results) => {
                let lines: Vec<String> = results
                    .iter()
                    .map(|r| format!("[{}] (score {:.2}) {}", r.entry.key, r.score, r.entry.content))
                    .collect();
                ToolOutput::ok(&call.id, lines.join("\n"))
            }
            Err(e) => ToolOutput::err(&call.id, format!("memory error: {e}")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use harbor_config::{MemoryConfig, SecurityConfig};
    use harbor_memory::SqliteMemoryStore;
    use harbor_security::SecurityPolicy;

    fn ctx_with_memory() -> ToolContext {
        let policy = Arc::new(SecurityPolicy::with_home(&SecurityConfig::default(), None));
        let store = SqliteMemoryStore::open_in_memory(&MemoryConfig::default(), None).unwrap();
        ToolContext::new("s1", ".", policy).with_memory(Arc::new(store))
    }

    fn call(name: &str, args: serde_json::Value) -> ToolCall {
        ToolCall {
            id: "m1".into(),
            name: name.into(),
            args,
        }
    }

    #[tokio::test]
    async fn store_then_recall() {
        let ctx = ctx_with_memory();
        let out = MemoryStoreTool
            .execute(
                &call("memory_store", json!({"key": "u:term:1:pref", "content": "prefers short answers"})),
                &ctx,
            )
            .await;
        assert!(!out.is_error, "{}", out.content);

        let out = MemoryRecallTool
            .execute(&call("memory_recall", json!({"query": "short answers"})), &ctx)
            .await;
        assert!(out.content.contains("u:term:1:pref"));
        assert!(out.content.contains("prefers short answers"));
    }

    #[tokio::test]
    async fn recall_respects_key_prefix() {
        let ctx = ctx_with_memory();
        MemoryStoreTool
            .execute(
                &call("memory_store", json!({"key": "u:a:1:x", "content": "topic alpha"})),
                &ctx,
            )
            .await;
        MemoryStoreTool
            .execute(
                &call("memory_store", json!({"key": "u:b:2:x", "content": "topic alpha too"})),
                &ctx,
            )
            .await;

        let out = MemoryRecallTool
            .execute(
                &call("memory_recall", json!({"query": "alpha", "key_prefix": "u:a:"})),
                &ctx,
            )
            .await;
        assert!(out.content.contains("u:a:1:x"));
        assert!(!out.content.contains("u:b:2:x"));
    }

    #[tokio::test]
    async fn missing_backend_is_an_error() {
        let policy = Arc::new(SecurityPolicy::with_home(&SecurityConfig::default(), None));
        let ctx = ToolContext::new("s1", ".", policy);
        let out = MemoryRecallTool
            .execute(&call("memory_recall", json!({"query": "x"})), &ctx)
            .await;
        assert!(out.is_error);
    }

    #[tokio::test]
    async fn recall_with_no_hits_says_so() {
        let ctx = ctx_with_memory();
        let out = MemoryRecallTool
            .execute(&call("memory_recall", json!({"query": "nothing stored"})), &ctx)
            .await;
        assert_eq!(out.content, "(no memories found)");
    }
}
