// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::Value;

use crate::context::ToolContext;

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier returned by the model (forwarded verbatim)
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments
    pub args: Value,
}

/// Whether a tool is cheap enough to run in-process or should be dispatched
/// to the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolWeight {
    #[default]
    Lightweight,
    /// Candidates for out-of-process execution (subprocess spawning,
    /// long-running scans).
    Heavyweight,
}

/// Validation or dispatch failure, distinct from a tool's own runtime
/// failure which travels as [`ToolOutput::err`].
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("invalid arguments: {}", .0.join("; "))]
    InvalidArgs(Vec<String>),
    #[error("tool execution cancelled")]
    Cancelled,
    #[error("tool execution timed out")]
    Timeout,
}

/// The result of executing a tool.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub call_id: String,
    pub content: String,
    /// If true, the tool failed non-fatally; `content` carries the message.
    pub is_error: bool,
    /// Structured side-channel data (e.g. x402 challenge details).
    pub metadata: Option<Value>,
}

impl ToolOutput {
    pub fn ok(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: content.into(),
            is_error: false,
            metadata: None,
        }
    }

    pub fn err(call_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: msg.into(),
            is_error: true,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Trait every builtin and bridged tool implements.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn weight(&self) -> ToolWeight {
        ToolWeight::Lightweight
    }
    /// JSON Schema for the parameters object.
    fn parameters_schema(&self) -> Value;

    /// Check `args` against the schema's `required` list and property types.
    /// Tools with constraints the schema cannot express override this.
    fn validate(&self, args: &Value) -> Result<(), Vec<String>> {
        validate_against_schema(&self.parameters_schema(), args)
    }

    /// Execute the tool.  Runtime failures are wrapped in [`ToolOutput::err`];
    /// `Err` is reserved for the dispatch layer (cancellation, timeout).
    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutput;

    /// Current state of whatever this tool mutates, for stateful tools
    /// (e.g. the canvas).  `None` for the stateless majority.
    fn state_snapshot(&self, _ctx: &ToolContext) -> Option<Value> {
        None
    }
}

/// Minimal JSON-Schema check: required keys present, declared property
/// types match.  Enough for provider-emitted arguments; full schema
/// validation is not worth a dependency here.
pub fn validate_against_schema(schema: &Value, args: &Value) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    let obj = match args.as_object() {
        Some(o) => o,
        None => return Err(vec!["arguments must be a JSON object".into()]),
    };

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for key in required.iter().filter_map(|k| k.as_str()) {
            if !obj.contains_key(key) {
                errors.push(format!("missing required parameter '{key}'"));
            }
        }
    }

    if let Some(props) = schema.get("properties").and_then(|p| p.as_object()) {
        for (key, value) in obj {
            let Some(decl) = props.get(key) else { continue };
            let Some(expected) = decl.get("type").and_then(|t| t.as_str()) else {
                continue;
            };
            let ok = match expected {
                "string" => value.is_string(),
                "integer" => value.is_i64() || value.is_u64(),
                "number" => value.is_number(),
                "boolean" => value.is_boolean(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                _ => true,
            };
            if !ok {
                errors.push(format!("parameter '{key}' must be of type {expected}"));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "limit": { "type": "integer" }
            },
            "required": ["path"]
        })
    }

    #[test]
    fn valid_args_pass() {
        assert!(validate_against_schema(&schema(), &json!({"path": "a", "limit": 3})).is_ok());
    }

    #[test]
    fn missing_required_is_reported() {
        let errs = validate_against_schema(&schema(), &json!({})).unwrap_err();
        assert!(errs[0].contains("path"));
    }

    #[test]
    fn wrong_type_is_reported() {
        let errs = validate_against_schema(&schema(), &json!({"path": 42})).unwrap_err();
        assert!(errs.iter().any(|e| e.contains("string")));
    }

    #[test]
    fn non_object_args_rejected() {
        assert!(validate_against_schema(&schema(), &json!("nope")).is_err());
    }

    #[test]
    fn unknown_keys_are_tolerated() {
        assert!(
            validate_against_schema(&schema(), &json!({"path": "a", "extra": true})).is_ok(),
            "providers send extra keys; they are not an error"
        );
    }

    #[test]
    fn output_constructors_set_error_flag() {
        assert!(!ToolOutput::ok("1", "x").is_error);
        assert!(ToolOutput::err("1", "x").is_error);
    }

    #[test]
    fn metadata_attaches() {
        let out = ToolOutput::ok("1", "x").with_metadata(json!({"k": 1}));
        assert_eq!(out.metadata.unwrap()["k"], json!(1));
    }
}
