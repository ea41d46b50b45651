// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use crate::context::ToolContext;
use crate::tool::{Tool, ToolCall, ToolOutput, ToolWeight};

/// A tool descriptor for providers – mirrors the model crate's shape but
/// keeps this crate independent from it.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Central registry holding all available tools.  Populated at startup,
/// read-only afterwards; the engine borrows tools, never owns them.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn weight(&self, name: &str) -> ToolWeight {
        self.tools
            .get(name)
            .map(|t| t.weight())
            .unwrap_or_default()
    }

    /// Produce definitions for all registered tools, name-sorted for a
    /// stable provider-facing order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutput {
        match self.tools.get(&call.name) {
            Some(tool) => {
                if let Err(errors) = tool.validate(&call.args) {
                    let err = crate::tool::ToolError::InvalidArgs(errors);
                    return ToolOutput::err(&call.id, err.to_string());
                }
                tool.execute(call, ctx).await
            }
            None => {
                let err = crate::tool::ToolError::UnknownTool(call.name.clone());
                ToolOutput::err(&call.id, err.to_string())
            }
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The standard tool set.  MCP bridging and anything needing backends the
/// tools crate cannot construct (worker pool, provider) is registered by
/// the gateway on top of this.
pub fn create_default(tools_cfg: &harbor_config::ToolsConfig) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(crate::builtin::fs::FileReadTool);
    registry.register(crate::builtin::fs::FileWriteTool);
    registry.register(crate::builtin::fs::FileEditTool);
    registry.register(crate::builtin::fs::FileAppendTool);
    registry.register(crate::builtin::fs::ListDirTool);
    registry.register(crate::builtin::fs::StatTool);
    registry.register(crate::builtin::grep::GrepTool);
    registry.register(crate::builtin::bash::BashTool {
        timeout: std::time::Duration::from_secs(tools_cfg.timeout_secs),
    });
    registry.register(crate::builtin::web_fetch::WebFetchTool::default());
    registry.register(crate::builtin::web_search::WebSearchTool);
    registry.register(crate::builtin::memory::MemoryStoreTool);
    registry.register(crate::builtin::memory::MemoryRecallTool);
    registry.register(crate::builtin::load_skill::LoadSkillTool);
    registry.register(crate::builtin::canvas_render::CanvasRenderTool);
    registry
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::Arc;

    use super::*;
    use harbor_config::SecurityConfig;
    use harbor_security::SecurityPolicy;

    struct EchoTool {
        name: &'static str,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "echoes its input"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object", "properties": {}, "required": [] })
        }
        async fn execute(&self, call: &ToolCall, _ctx: &ToolContext) -> ToolOutput {
            ToolOutput::ok(&call.id, format!("echo:{}", call.args))
        }
    }

    fn ctx() -> ToolContext {
        let policy = Arc::new(SecurityPolicy::with_home(&SecurityConfig::default(), None));
        ToolContext::new("s", ".", policy)
    }

    #[test]
    fn register_and_get() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "echo" });
        assert!(reg.get("echo").is_some());
        assert!(reg.get("nope").is_none());
    }

    #[test]
    fn definitions_are_sorted_by_name() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "zeta" });
        reg.register(EchoTool { name: "alpha" });
        let names: Vec<String> = reg.definitions().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[tokio::test]
    async fn execute_unknown_tool_errors() {
        let reg = ToolRegistry::new();
        let call = ToolCall {
            id: "1".into(),
            name: "missing".into(),
            args: json!({}),
        };
        let out = reg.execute(&call, &ctx()).await;
        assert!(out.is_error);
        assert!(out.content.contains("unknown tool"));
    }

    #[tokio::test]
    async fn execute_validates_before_running() {
        struct Strict;
        #[async_trait]
        impl Tool for Strict {
            fn name(&self) -> &str {
                "strict"
            }
            fn description(&self) -> &str {
                "requires x"
            }
            fn parameters_schema(&self) -> Value {
                json!({ "type": "object", "properties": { "x": { "type": "string" } }, "required": ["x"] })
            }
            async fn execute(&self, call: &ToolCall, _ctx: &ToolContext) -> ToolOutput {
                ToolOutput::ok(&call.id, "ran")
            }
        }
        let mut reg = ToolRegistry::new();
        reg.register(Strict);
        let out = reg
            .execute(
                &ToolCall {
                    id: "1".into(),
                    name: "strict".into(),
                    args: json!({}),
                },
                &ctx(),
            )
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("missing required parameter 'x'"));
    }

    #[test]
    fn default_registry_has_the_standard_set() {
        let reg = create_default(&harbor_config::ToolsConfig::default());
        for name in [
            "file_read",
            "file_write",
            "file_edit",
            "file_append",
            "ls",
            "stat",
            "grep",
            "bash",
            "web_fetch",
            "web_search",
            "memory_store",
            "memory_recall",
            "load_skill",
            "canvas_render",
        ] {
            assert!(reg.get(name).is_some(), "missing builtin tool {name}");
        }
    }

    #[test]
    fn bash_is_heavyweight_others_light() {
        let reg = create_default(&harbor_config::ToolsConfig::default());
        assert_eq!(reg.weight("bash"), ToolWeight::Heavyweight);
        assert_eq!(reg.weight("file_read"), ToolWeight::Lightweight);
    }

    #[test]
    fn registering_same_name_twice_overwrites() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "t" });
        reg.register(EchoTool { name: "t" });
        assert_eq!(reg.names().len(), 1);
    }
}
