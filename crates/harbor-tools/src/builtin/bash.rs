// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Allowlist-gated command execution.
//!
//! The command string is split into argv (quote-aware, no shell involved)
//! and checked by the security policy before anything is spawned.  The
//! child runs directly — metacharacters in arguments are data unless the
//! operator opted into them, in which case the policy already allowed them.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::context::{ProgressUpdate, ToolContext};
use crate::tool::{Tool, ToolCall, ToolOutput, ToolWeight};

const MAX_OUTPUT_BYTES: usize = 100 * 1024;

pub struct BashTool {
    pub timeout: Duration,
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Run an allowlisted command in the session working directory. \
         No shell is involved; pipes and substitutions are rejected unless \
         the operator has opted in."
    }

    fn weight(&self) -> ToolWeight {
        ToolWeight::Heavyweight
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": { "type": "string", "description": "The command line to run" }
            },
            "required": ["command"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutput {
        let command = call
            .args
            .get("command")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        let argv = match split_command(command) {
            Ok(argv) if !argv.is_empty() => argv,
            Ok(_) => return ToolOutput::err(&call.id, "empty command"),
            Err(e) => return ToolOutput::err(&call.id, format!("parse error: {e}")),
        };

        if let Err(e) = ctx.security.validate_command(&argv) {
            return ToolOutput::err(&call.id, format!("security violation: {e}"))
                .with_metadata(json!({ "security_code": e.code() }));
        }

        if ctx.cancel.is_cancelled() {
            return ToolOutput::err(&call.id, "cancelled");
        }

        debug!(program = %argv[0], "bash tool spawning");
        ctx.report_progress(ProgressUpdate::progress(format!("running {}", argv[0])));

        let mut cmd = tokio::process::Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .current_dir(&ctx.cwd)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => return ToolOutput::err(&call.id, format!("spawn error: {e}")),
        };

        let output = tokio::select! {
            out = child.wait_with_output() => match out {
                Ok(o) => o,
                Err(e) => return ToolOutput::err(&call.id, format!("wait error: {e}")),
            },
            _ = ctx.cancel.cancelled() => {
                warn!(program = %argv[0], "bash tool cancelled");
                return ToolOutput::err(&call.id, "cancelled");
            }
            _ = tokio::time::sleep(self.timeout) => {
                warn!(program = %argv[0], timeout_secs = self.timeout.as_secs(), "bash tool timed out");
                return ToolOutput::err(&call.id, format!(
                    "timed out after {}s", self.timeout.as_secs()
                ));
            }
        };

        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            text.push_str("\n[stderr]\n");
            text.push_str(&stderr);
        }
        if text.len() > MAX_OUTPUT_BYTES {
            text.truncate(MAX_OUTPUT_BYTES);
            text.push_str("\n...[output truncated]");
        }

        let sanitized = ctx.security.sanitize_output(&text);
        if output.status.success() {
            ToolOutput::ok(&call.id, sanitized.clean)
        } else {
            ToolOutput::err(
                &call.id,
                format!(
                    "exit status {}\n{}",
                    output.status.code().unwrap_or(-1),
                    sanitized.clean
                ),
            )
        }
    }
}

/// Quote-aware argv splitting.  Supports single and double quotes and
/// backslash escapes inside double quotes; no expansion of any kind.
pub fn split_command(command: &str) -> Result<Vec<String>, String> {
    let mut argv = Vec::new();
    let mut current = String::new();
    let mut chars = command.chars().peekable();
    let mut in_word = false;

    while let Some(c) = chars.next() {
        match c {
            ' ' | '\t' => {
                if in_word {
                    argv.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => return Err("unterminated single quote".into()),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(e) => current.push(e),
                            None => return Err("trailing backslash".into()),
                        },
                        Some(c) => current.push(c),
                        None => return Err("unterminated double quote".into()),
                    }
                }
            }
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some(e) => current.push(e),
                    None => return Err("trailing backslash".into()),
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        argv.push(current);
    }
    Ok(argv)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
