// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::context::{SearchBackend, SearchHit, ToolContext};
use crate::tool::{Tool, ToolCall, ToolOutput};

pub struct WebSearchTool;

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web via the configured search backend. Returns titles, URLs, and snippets."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Search query" },
                "limit": { "type": "integer", "description": "Maximum results (default 5)" }
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
        let limit = call.args.get("limit").and_then(|v| v.as_u64()).unwrap_or(5) as usize;

        let Some(backend) = &ctx.search else {
            return ToolOutput::err(&call.id, "no search backend configured");
        };

        debug!(query = %query, limit, "web_search");
        match backend.search(query, limit).await {
            Ok(hits) if hits.is_empty() => ToolOutput::ok(&call.id, "(no results)"),
            Ok(hits) => ToolOutput::ok(&call.id, format_hits(&hits)),
            Err(e) => ToolOutput::err(&call.id, format!("search error: {e}")),
        }
    }
}

fn format_hits(hits: &[SearchHit]) -> String {
    hits.iter()
        .enumerate()
        .map(|(i, h)| format!("{}. {}\n   {}\n   {}", i + 1, h.title, h.url, h.snippet))
        .collect::<Vec<_>>()
        .join("\n")
}

/// JSON-over-HTTP search backend: POSTs `{query, limit}` and expects
/// `{results: [{title, url, snippet}]}`.
pub struct HttpSearchBackend {
    url: String,
    client: reqwest::Client,
}

impl HttpSearchBackend {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl SearchBackend for HttpSearchBackend {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, String> {
        let resp = self
            .client
            .post(&self.url)
            .json(&json!({ "query": query, "limit": limit }))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("search backend returned {}", resp.status()));
        }
        let body: Value = resp.json().await.map_err(|e| e.to_string())?;
        let hits = body["results"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .take(limit)
                    .map(|r| SearchHit {
                        title: r["title"].as_str().unwrap_or("").to_string(),
                        url: r["url"].as_str().unwrap_or("").to_string(),
                        snippet: r["snippet"].as_str().unwrap_or("").to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(hits)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
