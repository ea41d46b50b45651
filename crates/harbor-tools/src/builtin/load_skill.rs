// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Progressive capability disclosure: named instruction blocks loaded on
//! demand from the skills directory, so the base system prompt stays small.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::context::ToolContext;
use crate::tool::{Tool, ToolCall, ToolOutput};

pub struct LoadSkillTool;

#[async_trait]
impl Tool for LoadSkillTool {
    fn name(&self) -> &str {
        "load_skill"
    }

    fn description(&self) -> &str {
        "Load the named skill's instruction block. Use when a task needs a \
         capability whose detailed instructions are not in the base prompt."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": { "type": "string", "description": "Skill name (file stem in the skills directory)" }
            },
            "required": ["name"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutput {
        let name = call
            .args
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        // Skill names are file stems, never paths.
        if name.is_empty()
            || name.contains('/')
            || name.contains('\\')
            || name.contains("..")
        {
            return ToolOutput::err(&call.id, "invalid skill name");
        }

        let Some(dir) = &ctx.skills_dir else {
            return ToolOutput::err(&call.id, "no skills directory configured");
        };

        let path = dir.join(format!("{name}.md"));
        debug!(skill = %name, path = %path.display(), "load_skill");
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => ToolOutput::ok(&call.id, text),
            Err(_) => ToolOutput::err(&call.id, format!("unknown skill '{name}'")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use harbor_config::SecurityConfig;
    use harbor_security::SecurityPolicy;

    fn ctx_with_skills(dir: &std::path::Path) -> ToolContext {
        let policy = Arc::new(SecurityPolicy::with_home(&SecurityConfig::default(), None));
        ToolContext::new("s1", ".", policy).with_skills_dir(dir)
    }

    fn call(args: serde_json::Value) -> ToolCall {
        ToolCall {
            id: "k1".into(),
            name: "load_skill".into(),
            args,
        }
    }

    #[tokio::test]
    async fn loads_named_skill() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("deploy.md"), "# Deploy\nSteps here.").unwrap();
        let out = LoadSkillTool
            .execute(&call(json!({"name": "deploy"})), &ctx_with_skills(dir.path()))
            .await;
        assert!(out.content.contains("Steps here."));
    }

    #[tokio::test]
    async fn unknown_skill_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let out = LoadSkillTool
            .execute(&call(json!({"name": "ghost"})), &ctx_with_skills(dir.path()))
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("unknown skill"));
    }

    #[tokio::test]
    async fn path_traversal_names_are_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        for bad in ["../secrets", "a/b", "a\\b", ""] {
            let out = LoadSkillTool
                .execute(&call(json!({"name": bad})), &ctx_with_skills(dir.path()))
                .await;
            assert!(out.is_error, "name {bad:?} must be rejected");
        }
    }

    #[tokio::test]
    async fn missing_skills_dir_is_an_error() {
        let policy = Arc::new(SecurityPolicy::with_home(&SecurityConfig::default(), None));
        let ctx = ToolContext::new("s1", ".", policy);
        let out = LoadSkillTool.execute(&call(json!({"name": "x"})), &ctx).await;
        assert!(out.is_error);
    }
}
