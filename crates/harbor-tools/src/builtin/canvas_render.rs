// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The agent's write access to the session canvas.  Arguments are a
//! [`harbor_canvas::CanvasOp`] in JSON form; the applied change comes back
//! as metadata so the channel can broadcast it to connected clients.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use harbor_canvas::CanvasOp;

use crate::context::ToolContext;
use crate::tool::{Tool, ToolCall, ToolOutput};

pub struct CanvasRenderTool;

#[async_trait]
impl Tool for CanvasRenderTool {
    fn name(&self) -> &str {
        "canvas_render"
    }

    fn description(&self) -> &str {
        "Mutate the session canvas: add/update/remove/move components, \
         connect/disconnect them, or clear everything. Component payloads \
         are passed through to the front-end untouched."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["add", "update", "remove", "move", "connect", "disconnect", "clear"],
                    "description": "The mutation to apply"
                },
                "component": { "type": "object", "description": "For add: {id, kind, payload}" },
                "position":  { "type": "object", "description": "For add/move: {x, y, w?, h?}" },
                "id":        { "type": "string", "description": "Target node or connection id" },
                "payload":   { "type": "object", "description": "For update: replacement payload" },
                "from_id":   { "type": "string", "description": "For connect" },
                "to_id":     { "type": "string", "description": "For connect" },
                "label":     { "type": "string" },
                "style":     { "type": "string" }
            },
            "required": ["action"],
            "additionalProperties": false
        })
    }

    fn state_snapshot(&self, ctx: &ToolContext) -> Option<Value> {
        let canvas = ctx.canvas.as_ref()?;
        let snapshot = canvas.lock().unwrap().snapshot();
        serde_json::to_value(snapshot).ok()
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutput {
        let Some(canvas) = &ctx.canvas else {
            return ToolOutput::err(&call.id, "no canvas attached to this session");
        };

        let op: CanvasOp = match serde_json::from_value(call.args.clone()) {
            Ok(op) => op,
            Err(e) => return ToolOutput::err(&call.id, format!("invalid canvas op: {e}")),
        };

        debug!(session = %ctx.session_id, "canvas_render");
        let result = {
            let mut state = canvas.lock().unwrap();
            state.apply(op)
        };

        match result {
            Ok(change) => {
                let change_json = serde_json::to_value(&change).unwrap_or(Value::Null);
                ToolOutput::ok(&call.id, format!("canvas updated: {}", change_label(&change_json)))
                    .with_metadata(json!({ "canvas_change": change_json }))
            }
            Err(e) => ToolOutput::err(&call.id, format!("canvas error: {e}")),
        }
    }
}

fn change_label(change: &Value) -> String {
    change["change"].as_str().unwrap_or("unknown").to_string()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::*;
    use harbor_canvas::CanvasState;
    use harbor_config::SecurityConfig;
    use harbor_security::SecurityPolicy;

    fn ctx_with_canvas(cap: usize) -> (ToolContext, Arc<Mutex<CanvasState>>) {
        let policy = Arc::new(SecurityPolicy::with_home(&SecurityConfig::default(), None));
        let canvas = Arc::new(Mutex::new(CanvasState::new(cap)));
        let ctx = ToolContext::new("s1", ".", policy).with_canvas(canvas.clone());
        (ctx, canvas)
    }

    fn call(args: serde_json::Value) -> ToolCall {
        ToolCall {
            id: "c1".into(),
            name: "canvas_render".into(),
            args,
        }
    }

    #[tokio::test]
    async fn add_node_updates_state_and_reports_change() {
        let (ctx, canvas) = ctx_with_canvas(10);
        let out = CanvasRenderTool
            .execute(
                &call(json!({
                    "action": "add",
                    "component": { "id": "n1", "kind": "text", "payload": {"text": "hi"} },
                    "position": { "x": 0.0, "y": 0.0 }
                })),
                &ctx,
            )
            .await;
        assert!(!out.is_error, "{}", out.content);
        assert_eq!(canvas.lock().unwrap().node_count(), 1);
        assert_eq!(
            out.metadata.unwrap()["canvas_change"]["change"],
            json!("node_added")
        );
    }

    #[tokio::test]
    async fn node_cap_propagates_as_tool_error() {
        let (ctx, _) = ctx_with_canvas(1);
        let add = |id: &str| {
            call(json!({
                "action": "add",
                "component": { "id": id, "kind": "text", "payload": {} }
            }))
        };
        let _ = CanvasRenderTool.execute(&add("a"), &ctx).await;
        let out = CanvasRenderTool.execute(&add("b"), &ctx).await;
        assert!(out.is_error);
        assert!(out.content.contains("canvas is full"));
    }

    #[tokio::test]
    async fn connect_and_cascade_via_tool() {
        let (ctx, canvas) = ctx_with_canvas(10);
        for id in ["a", "b"] {
            CanvasRenderTool
                .execute(
                    &call(json!({
                        "action": "add",
                        "component": { "id": id, "kind": "text", "payload": {} }
                    })),
                    &ctx,
                )
                .await;
        }
        let out = CanvasRenderTool
            .execute(&call(json!({"action": "connect", "from_id": "a", "to_id": "b"})), &ctx)
            .await;
        assert!(!out.is_error, "{}", out.content);
        assert_eq!(canvas.lock().unwrap().connection_count(), 1);

        let out = CanvasRenderTool
            .execute(&call(json!({"action": "remove", "id": "a"})), &ctx)
            .await;
        assert!(!out.is_error);
        assert_eq!(canvas.lock().unwrap().connection_count(), 0);
    }

    #[tokio::test]
    async fn missing_canvas_is_an_error() {
        let policy = Arc::new(SecurityPolicy::with_home(&SecurityConfig::default(), None));
        let ctx = ToolContext::new("s1", ".", policy);
        let out = CanvasRenderTool
            .execute(&call(json!({"action": "clear"})), &ctx)
            .await;
        assert!(out.is_error);
    }

    #[tokio::test]
    async fn state_snapshot_reflects_canvas() {
        let (ctx, _) = ctx_with_canvas(10);
        assert_eq!(
            CanvasRenderTool.state_snapshot(&ctx).unwrap()["nodes"]
                .as_array()
                .unwrap()
                .len(),
            0
        );
        CanvasRenderTool
            .execute(
                &call(json!({
                    "action": "add",
                    "component": { "id": "n1", "kind": "text", "payload": {} }
                })),
                &ctx,
            )
            .await;
        let snap = CanvasRenderTool.state_snapshot(&ctx).unwrap();
        assert_eq!(snap["nodes"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn bad_op_shape_is_an_error() {
        let (ctx, _) = ctx_with_canvas(10);
        let out = CanvasRenderTool
            .execute(&call(json!({"action": "add"})), &ctx)
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("invalid canvas op"));
    }
}
