// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The agent run loop: provider streaming → tool execution → provider,
//! repeated until the model answers in plain text.
//!
//! Each run is one spawned task producing a totally ordered event stream
//! through the [`RunHandle`].  Steering messages are observed at turn
//! boundaries; cancellation is observed at every suspension point.
//! Heavyweight tools are dispatched to the worker pool when one is
//! configured.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use harbor_canvas::CanvasState;
use harbor_memory::MemoryBackend;
use harbor_model::{
    CompletionRequest, Message, ModelProvider, ResponseEvent, ToolDefinition, Usage,
};
use harbor_security::{PendingAction, SecurityPolicy};
use harbor_tools::{
    PaymentSigner, ProgressUpdate, SearchBackend, ToolCall, ToolContext, ToolOutput, ToolRegistry,
    ToolWeight,
};
use harbor_worker::{TaskContext, TaskExecutor, WorkerTask};

use crate::error::EngineError;
use crate::events::{
    EngineEvent, ErrorReason, ResumeToken, RunHandle, RunSnapshot, SteeringKind, SteeringQueue,
    ToolResultSummary,
};
use crate::session::SessionStats;

/// Resolves confirmation requests surfaced by the policy.  Wired in at
/// `start_run`; when absent, the engine denies by default.
#[async_trait]
pub trait ConfirmationResolver: Send + Sync {
    async fn confirm(&self, action: &PendingAction) -> bool;
}

/// One unit of engine work: the session state a run starts from.
#[derive(Clone)]
pub struct RunJob {
    pub session_id: String,
    pub messages: Vec<Message>,
    /// Restrict the run to these tool names; `None` exposes the registry.
    pub tools: Option<Vec<String>>,
    pub system_prompt: Option<String>,
    pub model: String,
    pub cwd: PathBuf,
    /// Shared with the owning session so counters survive the run.
    pub stats: Option<Arc<SessionStats>>,
    /// Shared steering queue; a fresh one is created when absent.
    pub steering: Option<SteeringQueue>,
    pub canvas: Option<Arc<Mutex<CanvasState>>>,
}

impl RunJob {
    pub fn new(session_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            messages: Vec::new(),
            tools: None,
            system_prompt: None,
            model: model.into(),
            cwd: PathBuf::from("."),
            stats: None,
            steering: None,
            canvas: None,
        }
    }
}

#[derive(Default)]
pub struct StartOptions {
    /// Caller-supplied abort signal, linked into the run's root token.
    pub cancel: Option<CancellationToken>,
    pub confirm: Option<Arc<dyn ConfirmationResolver>>,
}

pub struct Engine {
    id: String,
    provider: Arc<dyn ModelProvider>,
    registry: Arc<ToolRegistry>,
    security: Arc<SecurityPolicy>,
    executor: Option<Arc<dyn TaskExecutor>>,
    memory: Option<Arc<dyn MemoryBackend>>,
    payment_signer: Option<Arc<dyn PaymentSigner>>,
    search: Option<Arc<dyn SearchBackend>>,
    skills_dir: Option<PathBuf>,
    tool_timeout: Duration,
    max_tool_rounds: u32,
}

impl Engine {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        registry: Arc<ToolRegistry>,
        security: Arc<SecurityPolicy>,
        tool_timeout: Duration,
        max_tool_rounds: u32,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            provider,
            registry,
            security,
            executor: None,
            memory: None,
            payment_signer: None,
            search: None,
            skills_dir: None,
            tool_timeout,
            max_tool_rounds,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn with_executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryBackend>) -> Self {
        self.memory = Some(memory);
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

    pub fn with_skills_dir(mut self, dir: PathBuf) -> Self {
        self.skills_dir = Some(dir);
        self
    }

    /// Start a run.  The returned handle is live until its terminal event.
    pub fn start_run(
        self: &Arc<Self>,
        job: RunJob,
        opts: StartOptions,
    ) -> Result<RunHandle, EngineError> {
        if job.model.is_empty() {
            return Err(EngineError::NoModel);
        }

        let steering = job
            .steering
            .clone()
            .unwrap_or_else(|| Arc::new(Mutex::new(Default::default())));
        let cancel = opts
            .cancel
            .as_ref()
            .map(|t| t.child_token())
            .unwrap_or_default();
        let ref_id = uuid::Uuid::new_v4().to_string();

        let resume_token = ResumeToken {
            engine_id: self.id.clone(),
            ref_id: ref_id.clone(),
            state: RunSnapshot {
                messages: job.messages.clone(),
                tools: job.tools.clone(),
                system_prompt: job.system_prompt.clone(),
                model: job.model.clone(),
                session_id: job.session_id.clone(),
                cwd: job.cwd.clone(),
            },
        };

        let (tx, rx) = mpsc::channel(256);
        let handle = RunHandle::new(ref_id, rx, cancel.clone(), steering.clone());

        let engine = self.clone();
        let confirm = opts.confirm;
        tokio::spawn(async move {
            let _ = tx
                .send(EngineEvent::Started {
                    resume_token: resume_token.clone(),
                })
                .await;

            match engine
                .drive(job, steering, cancel, confirm, tx.clone())
                .await
            {
                Ok((answer, usage)) => {
                    let _ = tx.send(EngineEvent::Completed { answer, usage }).await;
                }
                Err(reason) => {
                    let _ = tx.send(EngineEvent::Error { error: reason }).await;
                }
            }
        });

        Ok(handle)
    }

    /// Continue a snapshotted conversation with one more user message.
    /// The token must have been issued by this engine.
    pub fn resume(
        self: &Arc<Self>,
        token: ResumeToken,
        prompt: &str,
        opts: StartOptions,
    ) -> Result<RunHandle, EngineError> {
        if token.engine_id != self.id {
            return Err(EngineError::ResumeMismatch);
        }
        let mut job = RunJob::new(token.state.session_id, token.state.model);
        job.messages = token.state.messages;
        job.messages.push(Message::user(prompt));
        job.tools = token.state.tools;
        job.system_prompt = token.state.system_prompt;
        job.cwd = token.state.cwd;
        self.start_run(job, opts)
    }

    // ── Run loop ─────────────────────────────────────────────────────────────

    async fn drive(
        &self,
        job: RunJob,
        steering: SteeringQueue,
        cancel: CancellationToken,
        confirm: Option<Arc<dyn ConfirmationResolver>>,
        tx: mpsc::Sender<EngineEvent>,
    ) -> Result<(String, Option<Usage>), ErrorReason> {
        let mut messages = job.messages.clone();
        let mut usage: Option<Usage> = None;
        let mut rounds = 0u32;

        loop {
            // Turn boundary: steering first, abort decides immediately.
            let drained: Vec<_> = steering.lock().unwrap().drain(..).collect();
            for msg in drained {
                match msg.kind {
                    SteeringKind::Inject => messages.push(Message::user(msg.content)),
                    SteeringKind::Reminder => {
                        messages.push(Message::user(format!("(reminder) {}", msg.content)))
                    }
                    SteeringKind::Abort => {
                        debug!(session = %job.session_id, "run aborted by steering");
                        return Err(ErrorReason::Cancelled);
                    }
                }
            }
            if cancel.is_cancelled() {
                return Err(ErrorReason::Cancelled);
            }

            rounds += 1;
            let with_tools = rounds <= self.max_tool_rounds;
            if !with_tools {
                // Budget exhausted: one final tool-free turn so the model can
                // wrap up instead of the run dying mid-task.
                messages.push(Message::user(format!(
                    "You have reached the maximum tool-call budget ({} rounds). \
                     Do not call any more tools; summarise what was done and \
                     what remains.",
                    self.max_tool_rounds
                )));
            }

            let (text, tool_calls, turn_usage) = self
                .stream_one_turn(&job, &messages, with_tools, &cancel, &tx)
                .await?;
            if let Some(u) = turn_usage {
                usage = Some(u);
            }
            if let Some(stats) = &job.stats {
                stats
                    .llm_calls
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                stats
                    .iterations
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }

            if !text.is_empty() {
                messages.push(Message::assistant(&text));
            }

            if tool_calls.is_empty() || !with_tools {
                return Ok((text, usage));
            }

            // All tool-call messages precede any result message: the wire
            // format for parallel calls requires it.
            for tc in &tool_calls {
                messages.push(Message::tool_call(&tc.id, &tc.name, &tc.args));
                let _ = tx
                    .send(EngineEvent::ToolStart {
                        id: tc.id.clone(),
                        tool: tc.name.clone(),
                        args: tc.args.clone(),
                    })
                    .await;
            }

            for tc in tool_calls {
                if cancel.is_cancelled() {
                    return Err(ErrorReason::Cancelled);
                }
                let output = self.execute_one(&job, &tc, &cancel, &confirm, &tx).await;
                if let Some(stats) = &job.stats {
                    stats
                        .tool_invocations
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
                let _ = tx
                    .send(EngineEvent::ToolEnd {
                        id: tc.id.clone(),
                        result: ToolResultSummary {
                            success: !output.is_error,
                            output: output.content.clone(),
                        },
                    })
                    .await;
                let content = if output.is_error {
                    format!("ERROR: {}", output.content)
                } else {
                    output.content
                };
                messages.push(Message::tool_result(&tc.id, content));
            }
        }
    }

    /// One provider call: stream deltas out, collect tool calls.
    async fn stream_one_turn(
        &self,
        job: &RunJob,
        messages: &[Message],
        with_tools: bool,
        cancel: &CancellationToken,
        tx: &mpsc::Sender<EngineEvent>,
    ) -> Result<(String, Vec<ToolCall>, Option<Usage>), ErrorReason> {
        let tools = if with_tools {
            self.tool_definitions(&job.tools)
        } else {
            Vec::new()
        };

        let req = CompletionRequest {
            model: job.model.clone(),
            messages: messages.to_vec(),
            tools,
            system_prompt: job.system_prompt.clone(),
            stream: true,
        };

        let mut stream = tokio::select! {
            r = self.provider.complete(req) => r.map_err(|e| ErrorReason::Provider {
                message: e.to_string(),
            })?,
            _ = cancel.cancelled() => return Err(ErrorReason::Cancelled),
        };

        let mut text = String::new();
        let mut pending: BTreeMap<u32, PendingToolCall> = BTreeMap::new();
        let mut usage = None;

        loop {
            let event = tokio::select! {
                ev = stream.next() => ev,
                _ = cancel.cancelled() => return Err(ErrorReason::Cancelled),
            };
            match event {
                // Stream end counts as done even without a Done marker.
                None => break,
                Some(Err(e)) => {
                    return Err(ErrorReason::Provider {
                        message: e.to_string(),
                    })
                }
                Some(Ok(ResponseEvent::TextDelta(delta))) if !delta.is_empty() => {
                    text.push_str(&delta);
                    let _ = tx.send(EngineEvent::TextDelta { delta }).await;
                }
                Some(Ok(ResponseEvent::TextDelta(_))) => {}
                Some(Ok(ResponseEvent::ToolCall {
                    index,
                    id,
                    name,
                    arguments,
                })) => {
                    let entry = pending.entry(index).or_default();
                    if !id.is_empty() {
                        entry.id = id;
                    }
                    if !name.is_empty() {
                        entry.name = name;
                    }
                    entry.args_buf.push_str(&arguments);
                }
                Some(Ok(ResponseEvent::Usage(u))) => usage = Some(u),
                Some(Ok(ResponseEvent::Done)) => break,
                Some(Ok(ResponseEvent::Error(e))) => warn!("provider stream warning: {e}"),
            }
        }

        let mut tool_calls = Vec::new();
        for (i, (_, ptc)) in pending.into_iter().enumerate() {
            if ptc.name.is_empty() {
                warn!("dropping tool call with empty name from model");
                continue;
            }
            tool_calls.push(ptc.finish(i));
        }

        Ok((text, tool_calls, usage))
    }

    /// Validate, gate, and execute a single tool call.
    async fn execute_one(
        &self,
        job: &RunJob,
        tc: &ToolCall,
        cancel: &CancellationToken,
        confirm: &Option<Arc<dyn ConfirmationResolver>>,
        tx: &mpsc::Sender<EngineEvent>,
    ) -> ToolOutput {
        let Some(tool) = self.registry.get(&tc.name) else {
            return ToolOutput::err(&tc.id, format!("unknown tool: {}", tc.name));
        };
        if job
            .tools
            .as_ref()
            .map(|allowed| !allowed.iter().any(|t| t == &tc.name))
            .unwrap_or(false)
        {
            return ToolOutput::err(&tc.id, format!("tool '{}' not enabled for this run", tc.name));
        }
        if let Err(errors) = tool.validate(&tc.args) {
            return ToolOutput::err(&tc.id, format!("invalid arguments: {}", errors.join("; ")));
        }

        // Autonomy gate.  Deny-by-default when nobody can answer.
        let action = PendingAction {
            kind: tc.name.clone(),
            target: tc.args.to_string(),
            details: None,
        };
        if self.security.requires_confirmation(&action) {
            let _ = tx
                .send(EngineEvent::ToolProgress {
                    id: tc.id.clone(),
                    update: ProgressUpdate {
                        kind: harbor_tools::ProgressKind::ConfirmationRequested,
                        message: format!("confirmation required for {}", tc.name),
                        data: Some(serde_json::json!({ "tool": tc.name })),
                    },
                })
                .await;
            let approved = match confirm {
                Some(resolver) => resolver.confirm(&action).await,
                None => false,
            };
            if !approved {
                return ToolOutput::err(&tc.id, "denied: operator confirmation not granted");
            }
        }

        // Progress forwarding preserves per-call event ordering: the
        // forwarder drains fully before ToolEnd is emitted by the caller.
        let (progress_tx, mut progress_rx) = mpsc::channel::<ProgressUpdate>(32);
        let forward_tx = tx.clone();
        let call_id = tc.id.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(update) = progress_rx.recv().await {
                let _ = forward_tx
                    .send(EngineEvent::ToolProgress {
                        id: call_id.clone(),
                        update,
                    })
                    .await;
            }
        });

        let output = if tool.weight() == ToolWeight::Heavyweight && self.executor.is_some() {
            let executor = self.executor.as_ref().unwrap();
            let task = WorkerTask {
                tool: tc.name.clone(),
                args: tc.args.clone(),
                context: TaskContext {
                    session_id: job.session_id.clone(),
                    cwd: job.cwd.clone(),
                },
            };
            match executor
                .execute(task, Some(cancel.child_token()), Some(progress_tx))
                .await
            {
                Ok(result) => {
                    let mut out = if result.success {
                        ToolOutput::ok(&tc.id, result.output)
                    } else {
                        ToolOutput::err(
                            &tc.id,
                            result.error.unwrap_or_else(|| "task failed".into()),
                        )
                    };
                    out.metadata = result.metadata;
                    out
                }
                Err(e) => ToolOutput::err(&tc.id, format!("worker dispatch failed: {e}")),
            }
        } else {
            let ctx = self.build_tool_context(job, cancel.child_token(), progress_tx);
            match tokio::time::timeout(self.tool_timeout, self.registry.execute(tc, &ctx)).await {
                Ok(output) => output,
                Err(_) => {
                    // Same abort path as cancellation, with a timeout reason.
                    ctx.cancel.cancel();
                    ToolOutput::err(
                        &tc.id,
                        format!("timed out after {}s", self.tool_timeout.as_secs()),
                    )
                }
            }
        };

        let _ = forwarder.await;
        output
    }

    fn build_tool_context(
        &self,
        job: &RunJob,
        cancel: CancellationToken,
        progress: mpsc::Sender<ProgressUpdate>,
    ) -> ToolContext {
        let mut ctx = ToolContext::new(&job.session_id, &job.cwd, self.security.clone())
            .with_cancel(cancel)
            .with_progress(progress);
        if let Some(memory) = &self.memory {
            ctx = ctx.with_memory(memory.clone());
        }
        if let Some(canvas) = &job.canvas {
            ctx = ctx.with_canvas(canvas.clone());
        }
        if let Some(signer) = &self.payment_signer {
            ctx = ctx.with_payment_signer(signer.clone());
        }
        if let Some(search) = &self.search {
            ctx = ctx.with_search(search.clone());
        }
        if let Some(dir) = &self.skills_dir {
            ctx = ctx.with_skills_dir(dir.clone());
        }
        ctx
    }

    fn tool_definitions(&self, filter: &Option<Vec<String>>) -> Vec<ToolDefinition> {
        self.registry
            .definitions()
            .into_iter()
            .filter(|d| match filter {
                Some(names) => names.iter().any(|n| n == &d.name),
                None => true,
            })
            .map(|d| ToolDefinition {
                name: d.name,
                description: d.description,
                parameters: d.parameters,
            })
            .collect()
    }
}

#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    args_buf: String,
}

impl PendingToolCall {
    /// Arguments always resolve to a JSON object; models occasionally send
    /// empty or broken fragments and `{}` keeps the turn alive.
    fn finish(self, ordinal: usize) -> ToolCall {
        let args = if self.args_buf.is_empty() {
            serde_json::Value::Object(Default::default())
        } else {
            serde_json::from_str(&self.args_buf).unwrap_or_else(|e| {
                warn!(tool = %self.name, "invalid tool-call JSON from model: {e}; substituting {{}}");
                serde_json::Value::Object(Default::default())
            })
        };
        let id = if self.id.is_empty() {
            warn!(tool = %self.name, "tool call had empty id; generating synthetic id");
            format!("tc_synthetic_{ordinal}")
        } else {
            self.id
        };
        ToolCall {
            id,
            name: self.name,
            args,
        }
    }
}
