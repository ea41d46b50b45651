// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The session: a long-lived conversational vessel.
//!
//! State machine:
//!
//! ```text
//! created ──activate──▶ active ─pause──▶ paused
//!             ▲                              │
//!             └──────── resume ──────────────┘
//!  active|paused ──complete──▶ completed (terminal)
//!  any ──fail(err)──▶ failed (terminal)
//! ```
//!
//! Terminal transitions stamp `ended_at` and clear the steering queue.
//! The session exclusively owns its message log and steering queue; the
//! engine borrows the queue for the duration of a run.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use harbor_config::AutonomyLevel;
use harbor_model::Message;
use harbor_security::TurnContext;

use crate::error::EngineError;
use crate::events::{SteeringMessage, SteeringQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Created,
    Active,
    Paused,
    Completed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Per-session run configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfigState {
    pub model: String,
    pub provider: String,
    pub autonomy: AutonomyLevel,
    pub system_prompt: Option<String>,
}

/// Monotonic counters, shared with the engine for the duration of a run.
#[derive(Debug, Default)]
pub struct SessionStats {
    pub iterations: AtomicU32,
    pub tool_invocations: AtomicU32,
    pub llm_calls: AtomicU32,
    pub errors: Mutex<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub iterations: u32,
    pub tool_invocations: u32,
    pub llm_calls: u32,
    pub errors: Vec<String>,
}

impl SessionStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            iterations: self.iterations.load(Ordering::Relaxed),
            tool_invocations: self.tool_invocations.load(Ordering::Relaxed),
            llm_calls: self.llm_calls.load(Ordering::Relaxed),
            errors: self.errors.lock().unwrap().clone(),
        }
    }

    pub fn record_error(&self, message: impl Into<String>) {
        self.errors.lock().unwrap().push(message.into());
    }
}

pub struct Session {
    pub id: String,
    pub channel_id: String,
    pub user_id: String,
    state: SessionState,
    pub config: SessionConfigState,
    messages: Vec<Message>,
    steering: SteeringQueue,
    pub stats: Arc<SessionStats>,
    /// Multi-turn threat counters fed to the input validator.
    pub turn_context: TurnContext,
    /// Root abort source for everything this session runs.
    pub cancel: CancellationToken,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(
        channel_id: impl Into<String>,
        user_id: impl Into<String>,
        config: SessionConfigState,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            channel_id: channel_id.into(),
            user_id: user_id.into(),
            state: SessionState::Created,
            config,
            messages: Vec::new(),
            steering: Arc::new(Mutex::new(VecDeque::new())),
            stats: Arc::new(SessionStats::default()),
            turn_context: TurnContext::default(),
            cancel: CancellationToken::new(),
            created_at: now,
            last_active_at: now,
            ended_at: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Append to the message log.  Append-only: there is no removal API
    /// apart from `dispose`.
    pub fn push_message(&mut self, msg: Message) {
        self.messages.push(msg);
    }

    pub fn extend_messages(&mut self, msgs: impl IntoIterator<Item = Message>) {
        self.messages.extend(msgs);
    }

    /// The steering queue handle shared with an active run.
    pub fn steering_queue(&self) -> SteeringQueue {
        self.steering.clone()
    }

    pub fn steer(&self, msg: SteeringMessage) {
        self.steering.lock().unwrap().push_back(msg);
    }

    pub fn touch(&mut self) {
        self.last_active_at = Utc::now();
    }

    // ── Transitions ──────────────────────────────────────────────────────────

    pub fn activate(&mut self) -> Result<(), EngineError> {
        match self.state {
            SessionState::Created | SessionState::Paused | SessionState::Active => {
                self.state = SessionState::Active;
                self.touch();
                Ok(())
            }
            from => Err(EngineError::InvalidTransition {
                from: from.name(),
                to: "active",
            }),
        }
    }

    pub fn pause(&mut self) -> Result<(), EngineError> {
        match self.state {
            SessionState::Active => {
                self.state = SessionState::Paused;
                self.touch();
                Ok(())
            }
            from => Err(EngineError::InvalidTransition {
                from: from.name(),
                to: "paused",
            }),
        }
    }

    pub fn resume_from_pause(&mut self) -> Result<(), EngineError> {
        match self.state {
            SessionState::Paused => {
                self.state = SessionState::Active;
                self.touch();
                Ok(())
            }
            from => Err(EngineError::InvalidTransition {
                from: from.name(),
                to: "active",
            }),
        }
    }

    pub fn complete(&mut self) -> Result<(), EngineError> {
        match self.state {
            SessionState::Active | SessionState::Paused => {
                self.enter_terminal(SessionState::Completed);
                Ok(())
            }
            from => Err(EngineError::InvalidTransition {
                from: from.name(),
                to: "completed",
            }),
        }
    }

    /// Allowed from any state; records the failure on the stats.
    pub fn fail(&mut self, error: impl Into<String>) {
        let message = error.into();
        self.stats.record_error(message);
        self.enter_terminal(SessionState::Failed);
    }

    fn enter_terminal(&mut self, state: SessionState) {
        debug!(session = %self.id, state = state.name(), "session terminal");
        self.state = state;
        self.ended_at = Some(Utc::now());
        self.steering.lock().unwrap().clear();
        self.cancel.cancel();
    }

    /// Clear context, retaining only the system prompt; also empties the
    /// steering queue.  The session itself stays usable.
    pub fn dispose(&mut self) {
        self.messages.clear();
        self.steering.lock().unwrap().clear();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
