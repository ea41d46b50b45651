// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Filesystem tools.  Every path goes through the security policy before
//! any I/O happens; a refusal surfaces as a tool error carrying only the
//! categorical reason.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::debug;

use harbor_security::{PathOp, SecurityError};

use crate::context::ToolContext;
use crate::tool::{Tool, ToolCall, ToolOutput};

fn arg_str<'a>(call: &'a ToolCall, key: &str) -> Option<&'a str> {
    call.args.get(key).and_then(|v| v.as_str())
}

fn resolve(ctx: &ToolContext, raw: &str, op: PathOp) -> Result<PathBuf, SecurityError> {
    let candidate = Path::new(raw);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        ctx.cwd.join(candidate)
    };
    ctx.security.validate_path(&joined, op)
}

fn security_err(call_id: &str, e: &SecurityError) -> ToolOutput {
    ToolOutput::err(call_id, format!("security violation: {e}"))
        .with_metadata(json!({ "security_code": e.code() }))
}

// ─── file_read ────────────────────────────────────────────────────────────────

pub struct FileReadTool;

#[async_trait]
impl Tool for FileReadTool {
    fn name(&self) -> &str {
        "file_read"
    }
    fn description(&self) -> &str {
        "Read a file from the workspace. Supports optional offset/limit line windows for large files."
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path":   { "type": "string", "description": "File path (relative to the session cwd)" },
                "offset": { "type": "integer", "description": "1-based first line to return" },
                "limit":  { "type": "integer", "description": "Maximum number of lines to return" }
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutput {
        let raw = arg_str(call, "path").unwrap_or_default();
        let path = match resolve(ctx, raw, PathOp::Read) {
            Ok(p) => p,
            Err(e) => return security_err(&call.id, &e),
        };
        debug!(path = %path.display(), "file_read");

        let text = match tokio::fs::read_to_string(&path).await {
            Ok(t) => t,
            Err(e) => return ToolOutput::err(&call.id, format!("read error: {e}")),
        };

        let offset = call.args.get("offset").and_then(|v| v.as_u64()).unwrap_or(1) as usize;
        let limit = call.args.get("limit").and_then(|v| v.as_u64()).map(|l| l as usize);

        let out = match limit {
            None if offset <= 1 => text,
            _ => {
                let lines: Vec<&str> = text.lines().collect();
                let start = offset.saturating_sub(1).min(lines.len());
                let end = match limit {
                    Some(l) => (start + l).min(lines.len()),
                    None => lines.len(),
                };
                lines[start..end].join("\n")
            }
        };
        ToolOutput::ok(&call.id, out)
    }
}

// ─── file_write ───────────────────────────────────────────────────────────────

pub struct FileWriteTool;

#[async_trait]
impl Tool for FileWriteTool {
    fn name(&self) -> &str {
        "file_write"
    }
    fn description(&self) -> &str {
        "Write content to a file, replacing it if it exists. Parent directories are created."
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path":    { "type": "string" },
                "content": { "type": "string" }
            },
            "required": ["path", "content"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutput {
        let raw = arg_str(call, "path").unwrap_or_default();
        let content = arg_str(call, "content").unwrap_or_default();
        let path = match resolve(ctx, raw, PathOp::Write) {
            Ok(p) => p,
            Err(e) => return security_err(&call.id, &e),
        };
        debug!(path = %path.display(), bytes = content.len(), "file_write");

        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return ToolOutput::err(&call.id, format!("mkdir error: {e}"));
            }
        }
        match tokio::fs::write(&path, content).await {
            Ok(()) => ToolOutput::ok(&call.id, format!("wrote {} bytes", content.len())),
            Err(e) => ToolOutput::err(&call.id, format!("write error: {e}")),
        }
    }
}

// ─── file_edit ────────────────────────────────────────────────────────────────

pub struct FileEditTool;

#[async_trait]
impl Tool for FileEditTool {
    fn name(&self) -> &str {
        "file_edit"
    }
    fn description(&self) -> &str {
        "Replace an exact string in a file. The target must be unique unless replace_all is set."
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path":        { "type": "string" },
                "old_string":  { "type": "string" },
                "new_string":  { "type": "string" },
                "replace_all": { "type": "boolean" }
            },
            "required": ["path", "old_string", "new_string"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutput {
        let raw = arg_str(call, "path").unwrap_or_default();
        let old = arg_str(call, "old_string").unwrap_or_default();
        let new = arg_str(call, "new_string").unwrap_or_default();
        let replace_all = call
            .args
            .get("replace_all")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        if old == new {
            return ToolOutput::err(&call.id, "old_string and new_string are identical");
        }

        let path = match resolve(ctx, raw, PathOp::Write) {
            Ok(p) => p,
            Err(e) => return security_err(&call.id, &e),
        };

        let text = match tokio::fs::read_to_string(&path).await {
            Ok(t) => t,
            Err(e) => return ToolOutput::err(&call.id, format!("read error: {e}")),
        };

        let count = text.matches(old).count();
        if count == 0 {
            return ToolOutput::err(&call.id, "old_string not found in file");
        }
        if count > 1 && !replace_all {
            return ToolOutput::err(
                &call.id,
                format!("old_string matches {count} times; pass replace_all or make it unique"),
            );
        }

        let updated = if replace_all {
            text.replace(old, new)
        } else {
            text.replacen(old, new, 1)
        };

        match tokio::fs::write(&path, &updated).await {
            Ok(()) => {
                let replaced = if replace_all { count } else { 1 };
                ToolOutput::ok(&call.id, format!("replaced {replaced} occurrence(s)"))
            }
            Err(e) => ToolOutput::err(&call.id, format!("write error: {e}")),
        }
    }
}

// ─── file_append ──────────────────────────────────────────────────────────────

pub struct FileAppendTool;

#[async_trait]
impl Tool for FileAppendTool {
    fn name(&self) -> &str {
        "file_append"
    }
    fn description(&self) -> &str {
        "Append content to the end of a file, creating it if missing."
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path":    { "type": "string" },
                "content": { "type": "string" }
            },
            "required": ["path", "content"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutput {
        let raw = arg_str(call, "path").unwrap_or_default();
        let content = arg_str(call, "content").unwrap_or_default();
        let path = match resolve(ctx, raw, PathOp::Write) {
            Ok(p) => p,
            Err(e) => return security_err(&call.id, &e),
        };

        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return ToolOutput::err(&call.id, format!("mkdir error: {e}"));
            }
        }

        let existing = tokio::fs::read_to_string(&path).await.unwrap_or_default();
        let combined = format!("{existing}{content}");
        match tokio::fs::write(&path, &combined).await {
            Ok(()) => ToolOutput::ok(&call.id, format!("appended {} bytes", content.len())),
            Err(e) => ToolOutput::err(&call.id, format!("append error: {e}")),
        }
    }
}

// ─── ls ───────────────────────────────────────────────────────────────────────

pub struct ListDirTool;

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "ls"
    }
    fn description(&self) -> &str {
        "List a directory. Directories are suffixed with '/'; entries are name-sorted."
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Directory to list (default: cwd)" }
            },
            "required": [],
            "additionalProperties": false
        })
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutput {
        let raw = arg_str(call, "path").unwrap_or(".");
        let path = match resolve(ctx, raw, PathOp::Read) {
            Ok(p) => p,
            Err(e) => return security_err(&call.id, &e),
        };

        let mut rd = match tokio::fs::read_dir(&path).await {
            Ok(rd) => rd,
            Err(e) => return ToolOutput::err(&call.id, format!("ls error: {e}")),
        };

        let mut entries = Vec::new();
        while let Ok(Some(entry)) = rd.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            entries.push(if is_dir { format!("{name}/") } else { name });
        }
        entries.sort();
        if entries.is_empty() {
            ToolOutput::ok(&call.id, "(empty directory)")
        } else {
            ToolOutput::ok(&call.id, entries.join("\n"))
        }
    }
}

// ─── stat ─────────────────────────────────────────────────────────────────────

pub struct StatTool;

#[async_trait]
impl Tool for StatTool {
    fn name(&self) -> &str {
        "stat"
    }
    fn description(&self) -> &str {
        "Report size, kind, and modification time for a path."
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" }
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutput {
        let raw = arg_str(call, "path").unwrap_or_default();
        let path = match resolve(ctx, raw, PathOp::Read) {
            Ok(p) => p,
            Err(e) => return security_err(&call.id, &e),
        };

        let meta = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) => return ToolOutput::err(&call.id, format!("stat error: {e}")),
        };

        let kind = if meta.is_dir() {
            "directory"
        } else if meta.is_symlink() {
            "symlink"
        } else {
            "file"
        };
        let modified = meta
            .modified()
            .ok()
            .map(|t| chrono::DateTime::<chrono::Utc>::from(t).to_rfc3339())
            .unwrap_or_else(|| "unknown".into());

        ToolOutput::ok(
            &call.id,
            format!("kind: {kind}\nsize: {} bytes\nmodified: {modified}", meta.len()),
        )
        .with_metadata(json!({ "kind": kind, "size": meta.len() }))
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

    fn ctx_in(dir: &Path) -> ToolContext {
        let cfg = SecurityConfig {
            workspace_root: dir.to_path_buf(),
            ..SecurityConfig::default()
        };
        let policy = Arc::new(SecurityPolicy::with_home(&cfg, None));
        ToolContext::new("s1", dir, policy)
    }

    fn call(name: &str, args: serde_json::Value) -> ToolCall {
        ToolCall {
            id: "t1".into(),
            name: name.into(),
            args,
        }
    }

    #[tokio::test]
    async fn write_then_read_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = ctx_in(dir.path());

        let out = FileWriteTool
            .execute(&call("file_write", json!({"path": "a.txt", "content": "hello"})), &ctx)
            .await;
        assert!(!out.is_error, "{}", out.content);

        let out = FileReadTool
            .execute(&call("file_read", json!({"path": "a.txt"})), &ctx)
            .await;
        assert_eq!(out.content, "hello");
    }

    #[tokio::test]
    async fn read_outside_workspace_is_denied() {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = ctx_in(dir.path());
        let out = FileReadTool
            .execute(&call("file_read", json!({"path": "/etc/passwd"})), &ctx)
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("security violation"));
        assert_eq!(out.metadata.unwrap()["security_code"], json!("path_blocked"));
    }

    #[tokio::test]
    async fn read_with_offset_and_limit() {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = ctx_in(dir.path());
        std::fs::write(dir.path().join("n.txt"), "one\ntwo\nthree\nfour").unwrap();

        let out = FileReadTool
            .execute(
                &call("file_read", json!({"path": "n.txt", "offset": 2, "limit": 2})),
                &ctx,
            )
            .await;
        assert_eq!(out.content, "two\nthree");
    }

    #[tokio::test]
    async fn edit_requires_unique_match() {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = ctx_in(dir.path());
        std::fs::write(dir.path().join("e.txt"), "aaa bbb aaa").unwrap();

        let out = FileEditTool
            .execute(
                &call("file_edit", json!({"path": "e.txt", "old_string": "aaa", "new_string": "x"})),
                &ctx,
            )
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("2 times"));

        let out = FileEditTool
            .execute(
                &call(
                    "file_edit",
                    json!({"path": "e.txt", "old_string": "aaa", "new_string": "x", "replace_all": true}),
                ),
                &ctx,
            )
            .await;
        assert!(!out.is_error);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("e.txt")).unwrap(),
            "x bbb x"
        );
    }

    #[tokio::test]
    async fn edit_missing_target_is_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = ctx_in(dir.path());
        std::fs::write(dir.path().join("e.txt"), "content").unwrap();
        let out = FileEditTool
            .execute(
                &call("file_edit", json!({"path": "e.txt", "old_string": "nope", "new_string": "x"})),
                &ctx,
            )
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("not found"));
    }

    #[tokio::test]
    async fn append_creates_and_extends() {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = ctx_in(dir.path());
        FileAppendTool
            .execute(&call("file_append", json!({"path": "log.txt", "content": "a"})), &ctx)
            .await;
        FileAppendTool
            .execute(&call("file_append", json!({"path": "log.txt", "content": "b"})), &ctx)
            .await;
        assert_eq!(
            std::fs::read_to_string(dir.path().join("log.txt")).unwrap(),
            "ab"
        );
    }

    #[tokio::test]
    async fn ls_marks_directories() {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = ctx_in(dir.path());
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("f.txt"), "x").unwrap();

        let out = ListDirTool
            .execute(&call("ls", json!({"path": "."})), &ctx)
            .await;
        assert_eq!(out.content, "f.txt\nsub/");
    }

    #[tokio::test]
    async fn stat_reports_kind_and_size() {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = ctx_in(dir.path());
        std::fs::write(dir.path().join("s.txt"), "12345").unwrap();

        let out = StatTool
            .execute(&call("stat", json!({"path": "s.txt"})), &ctx)
            .await;
        assert!(out.content.contains("kind: file"));
        assert!(out.content.contains("size: 5 bytes"));
    }
}
