// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod engine;
mod error;
mod events;
mod manager;
mod notes;
mod session;
mod supervisor;

pub use engine::{ConfirmationResolver, Engine, RunJob, StartOptions};
pub use error::EngineError;
pub use events::{
    EngineEvent, ErrorReason, ResumeToken, RunHandle, RunSnapshot, SteeringKind, SteeringMessage,
    ToolResultSummary,
};
pub use manager::{SessionManager, SessionSummary};
pub use notes::{NotesStore, SessionNote};
pub use session::{Session, SessionConfigState, SessionState, SessionStats, StatsSnapshot};
pub use supervisor::{ChildHealth, HealthMonitor, RestartFn, Supervisor, SupervisorEvent};
