// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Heavyweight tool execution on a bounded pool of reusable subprocesses.
//!
//! The parent serialises a minimal task context (session id + cwd) to the
//! worker; the worker reconstructs a full tool context with a fresh
//! security policy at autonomy `full` — the parent already gated the call.
//! Functions never cross the boundary, so context backends that are
//! closures or signers stay parent-side.

pub mod pool;
pub mod protocol;
pub mod runner;

pub use pool::{InlineFallbackExecutor, PoolStats, TaskExecutor, WorkerPool};
pub use protocol::{ParentMessage, TaskContext, TaskResult, WorkerMessage, WorkerTask};

/// Failure from the dispatch layer, not the tool itself.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("worker pool is shutting down")]
    ShuttingDown,
    #[error("task cancelled before execution")]
    Cancelled,
    #[error("failed to spawn worker: {0}")]
    Spawn(String),
    #[error("worker protocol error: {0}")]
    Protocol(String),
    #[error("worker died: {0}")]
    WorkerDied(String),
}
