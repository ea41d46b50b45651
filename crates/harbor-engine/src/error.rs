// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use harbor_model::ProviderError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("run cancelled")]
    Cancelled,
    #[error("no model specified")]
    NoModel,
    #[error("resume token was issued by a different engine")]
    ResumeMismatch,
    #[error("invalid session transition: {from} → {to}")]
    InvalidTransition { from: &'static str, to: &'static str },
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("provider stream terminated: {0}")]
    StreamTerminated(String),
}
