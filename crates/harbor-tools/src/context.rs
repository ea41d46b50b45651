// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Execution context handed to every tool invocation.
//!
//! Carries the session identity, the working directory, the security
//! policy, the cancellation token, and a progress channel — plus optional
//! backends (memory, canvas, payment signer, search) that only some tools
//! need.  Workers rebuild one of these from the minimal serialisable task
//! context; closures never cross the worker boundary, so worker-side
//! contexts have no payment signer.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use harbor_canvas::CanvasState;
use harbor_memory::MemoryBackend;
use harbor_security::SecurityPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    /// Incremental status from a running tool.
    Progress,
    /// The policy wants an operator decision before the tool proceeds.
    ConfirmationRequested,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub kind: ProgressKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ProgressUpdate {
    pub fn progress(message: impl Into<String>) -> Self {
        Self {
            kind: ProgressKind::Progress,
            message: message.into(),
            data: None,
        }
    }
}

/// Signs x402 payment authorisations.  Runs in-process only.
pub trait PaymentSigner: Send + Sync {
    /// The payer address advertised in authorisations.
    fn address(&self) -> &str;
    /// Produce a signature over the canonical authorisation JSON.
    fn sign(&self, authorization: &serde_json::Value) -> Result<String, String>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// Pluggable web-search backend for the `web_search` tool.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, String>;
}

#[derive(Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub cwd: PathBuf,
    pub security: Arc<SecurityPolicy>,
    pub cancel: CancellationToken,
    /// Progress sink for the current call; `None` when nobody listens.
    pub progress: Option<mpsc::Sender<ProgressUpdate>>,
    pub memory: Option<Arc<dyn MemoryBackend>>,
    pub canvas: Option<Arc<Mutex<CanvasState>>>,
    pub payment_signer: Option<Arc<dyn PaymentSigner>>,
    pub search: Option<Arc<dyn SearchBackend>>,
    pub skills_dir: Option<PathBuf>,
}

impl ToolContext {
    pub fn new(
        session_id: impl Into<String>,
        cwd: impl Into<PathBuf>,
        security: Arc<SecurityPolicy>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            cwd: cwd.into(),
            security,
            cancel: CancellationToken::new(),
            progress: None,
            memory: None,
            canvas: None,
            payment_signer: None,
            search: None,
            skills_dir: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, tx: mpsc::Sender<ProgressUpdate>) -> Self {
        self.progress = Some(tx);
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryBackend>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_canvas(mut self, canvas: Arc<Mutex<CanvasState>>) -> Self {
        self.canvas = Some(canvas);
        self
    }

    pub fn with_payment_signer(mut self, signer: Arc<dyn PaymentSigner>) -> Self {
        self.payment_signer = Some(signer);
        self
    }

    pub fn with_search(mut self, search: Arc<dyn SearchBackend>) -> Self {
        self.search = Some(search);
        self
    }

    pub fn with_skills_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.skills_dir = Some(dir.into());
        self
    }

    /// Fire-and-forget progress; a full or closed channel never blocks the tool.
    pub fn report_progress(&self, update: ProgressUpdate) {
        if let Some(tx) = &self.progress {
            let _ = tx.try_send(update);
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
