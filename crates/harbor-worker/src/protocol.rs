// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Parent↔worker wire protocol: newline-delimited JSON objects over the
//! child's stdin/stdout.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The minimal serialisable subset of a tool context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskContext {
    pub session_id: String,
    pub cwd: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerTask {
    pub tool: String,
    pub args: Value,
    pub context: TaskContext,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Parent → worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParentMessage {
    Execute { task_id: u64, task: WorkerTask },
    Cancel { task_id: u64 },
    Shutdown,
}

/// Worker → parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Progress { task_id: u64, message: String },
    Result { task_id: u64, result: TaskResult },
    Error { task_id: u64, message: String },
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn execute_message_round_trips() {
        let msg = ParentMessage::Execute {
            task_id: 3,
            task: WorkerTask {
                tool: "bash".into(),
                args: json!({"command": "ls"}),
                context: TaskContext {
                    session_id: "s1".into(),
                    cwd: "/tmp".into(),
                },
            },
        };
        let line = serde_json::to_string(&msg).unwrap();
        assert!(line.contains("\"type\":\"execute\""));
        let back: ParentMessage = serde_json::from_str(&line).unwrap();
        match back {
            ParentMessage::Execute { task_id, task } => {
                assert_eq!(task_id, 3);
                assert_eq!(task.tool, "bash");
                assert_eq!(task.context.session_id, "s1");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn result_message_round_trips() {
        let msg = WorkerMessage::Result {
            task_id: 1,
            result: TaskResult {
                success: false,
                output: String::new(),
                error: Some("boom".into()),
                metadata: None,
            },
        };
        let line = serde_json::to_string(&msg).unwrap();
        let back: WorkerMessage = serde_json::from_str(&line).unwrap();
        match back {
            WorkerMessage::Result { result, .. } => {
                assert!(!result.success);
                assert_eq!(result.error.as_deref(), Some("boom"));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn wire_lines_carry_no_embedded_newlines() {
        let msg = WorkerMessage::Progress {
            task_id: 1,
            message: "multi\nline".into(),
        };
        let line = serde_json::to_string(&msg).unwrap();
        assert!(!line.contains('\n'), "JSON string escapes newlines");
    }
}
