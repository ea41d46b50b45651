// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The engine's outward surface: steering messages in, a totally ordered
//! event stream out, plus the serialisable resume token.
//!
//! Event order law: `Started` is always first; exactly one terminal event
//! (`Completed` or `Error`) ends the stream; for every tool-call id,
//! `ToolStart` precedes any `ToolProgress` which precede `ToolEnd`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use harbor_model::{Message, Usage};
use harbor_tools::ProgressUpdate;

// ─── Steering ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SteeringKind {
    /// Appended as a user message at the next turn boundary.
    Inject,
    /// Appended as a bracketed reminder; softer than a full user turn.
    Reminder,
    /// Ends the run with a cancellation error at the next boundary.
    Abort,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SteeringMessage {
    pub kind: SteeringKind,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl SteeringMessage {
    pub fn inject(content: impl Into<String>) -> Self {
        Self {
            kind: SteeringKind::Inject,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn reminder(content: impl Into<String>) -> Self {
        Self {
            kind: SteeringKind::Reminder,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn abort(reason: impl Into<String>) -> Self {
        Self {
            kind: SteeringKind::Abort,
            content: reason.into(),
            timestamp: Utc::now(),
        }
    }
}

pub type SteeringQueue = Arc<Mutex<VecDeque<SteeringMessage>>>;

// ─── Resume token ─────────────────────────────────────────────────────────────

/// Everything needed to continue a conversation on the same engine kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub messages: Vec<Message>,
    /// Tool names active for the run; `None` means the full registry.
    pub tools: Option<Vec<String>>,
    pub system_prompt: Option<String>,
    pub model: String,
    pub session_id: String,
    pub cwd: std::path::PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeToken {
    pub engine_id: String,
    pub ref_id: String,
    pub state: RunSnapshot,
}

// ─── Events ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ErrorReason {
    Cancelled,
    Timeout,
    Provider { message: String },
    Engine { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResultSummary {
    pub success: bool,
    pub output: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    Started {
        resume_token: ResumeToken,
    },
    TextDelta {
        delta: String,
    },
    ToolStart {
        id: String,
        tool: String,
        args: serde_json::Value,
    },
    ToolProgress {
        id: String,
        update: ProgressUpdate,
    },
    ToolEnd {
        id: String,
        result: ToolResultSummary,
    },
    Completed {
        answer: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
    Error {
        error: ErrorReason,
    },
}

impl EngineEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Error { .. })
    }
}

// ─── Run handle ───────────────────────────────────────────────────────────────

/// Live connection to a run: the event stream plus cancel and steer.
/// Lives from `start_run` until the terminal event is consumed.
#[derive(Debug)]
pub struct RunHandle {
    pub ref_id: String,
    events: mpsc::Receiver<EngineEvent>,
    cancel: CancellationToken,
    steering: SteeringQueue,
}

impl RunHandle {
    pub(crate) fn new(
        ref_id: String,
        events: mpsc::Receiver<EngineEvent>,
        cancel: CancellationToken,
        steering: SteeringQueue,
    ) -> Self {
        Self {
            ref_id,
            events,
            cancel,
            steering,
        }
    }

    /// Pull the next event; `None` after the terminal event.
    pub async fn next_event(&mut self) -> Option<EngineEvent> {
        self.events.recv().await
    }

    /// Abort the run.  In-flight provider streams and tool invocations
    /// observe the cancellation at their next suspension point.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Enqueue a steering message; it takes effect at the next turn boundary.
    pub fn steer(&self, msg: SteeringMessage) {
        self.steering.lock().unwrap().push_back(msg);
    }

    /// Drain all remaining events into a vector (test helper).
    pub async fn collect_events(&mut self) -> Vec<EngineEvent> {
        let mut out = Vec::new();
        while let Some(ev) = self.next_event().await {
            out.push(ev);
        }
        out
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
