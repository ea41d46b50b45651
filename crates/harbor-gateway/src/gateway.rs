// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Gateway assembly — builds all subsystems and starts them.
//!
//! # Startup sequence
//!
//! [`run`] performs these steps in order:
//!
//! 1. Validate the configuration; any failure refuses startup.
//! 2. Build the security policy and memory backend.
//! 3. Build the tool registry (standard set + MCP bridge).
//! 4. Build the provider, worker executor, and engine.
//! 5. Build the session manager and spawn its eviction sweep.
//! 6. Build the channel registry and wire every inbound handler to the
//!    shared dispatch path.
//! 7. Register children with the health monitor, spawn its check loop
//!    and heartbeat tasks.
//! 8. Start the Axum server (control plane + canvas WebSocket); blocks
//!    until shutdown.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use harbor_canvas::CanvasState;
use harbor_channels::{
    CanvasChannel, Channel, ChannelRegistry, InboundMessage, OutboundMessage, ServerFrame,
    TerminalChannel, WebhookChannel,
};
use harbor_config::Config;
use harbor_engine::{
    Engine, EngineEvent, ErrorReason, HealthMonitor, RunJob, SessionConfigState, SessionManager,
    StartOptions, Supervisor,
};
use harbor_memory::{HttpEmbeddingProvider, MemoryBackend, SqliteMemoryStore};
use harbor_model::build_provider;
use harbor_security::{InputValidator, SecurityPolicy, ThreatSeverity};
use harbor_tools::{create_default, HttpSearchBackend};
use harbor_worker::{TaskExecutor, WorkerPool};

pub struct GatewayState {
    pub cfg: Arc<Config>,
    pub manager: Arc<SessionManager>,
    pub engine: Arc<Engine>,
    pub channels: Arc<ChannelRegistry>,
    pub canvas_channel: Option<Arc<CanvasChannel>>,
    pub monitor: Arc<HealthMonitor>,
    pub validator: InputValidator,
    /// Per-context canvas state, created on first use.
    canvases: Mutex<HashMap<String, Arc<Mutex<CanvasState>>>>,
    /// Abort token of the currently active run per context key.
    active_runs: Mutex<HashMap<String, CancellationToken>>,
}

impl std::fmt::Debug for GatewayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayState").finish_non_exhaustive()
    }
}

impl GatewayState {
    pub fn canvas_for(&self, context_key: &str) -> Arc<Mutex<CanvasState>> {
        self.canvases
            .lock()
            .unwrap()
            .entry(context_key.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(CanvasState::new(self.cfg.engine.canvas_node_cap)))
            })
            .clone()
    }

    pub fn active_run(&self, context_key: &str) -> Option<CancellationToken> {
        self.active_runs.lock().unwrap().get(context_key).cloned()
    }

    pub(crate) fn insert_active_run(&self, context_key: &str, token: CancellationToken) {
        self.active_runs
            .lock()
            .unwrap()
            .insert(context_key.to_string(), token);
    }

    pub(crate) fn remove_active_run(&self, context_key: &str) {
        self.active_runs.lock().unwrap().remove(context_key);
    }
}

/// Build the full gateway state from config.  Fatal misconfiguration
/// errors out before anything is spawned.
pub fn build_state(cfg: Config) -> anyhow::Result<Arc<GatewayState>> {
    cfg.validate().context("configuration rejected")?;
    let cfg = Arc::new(cfg);

    let security = Arc::new(SecurityPolicy::new(&cfg.security));

    // Memory backend; embedding is optional and failure-tolerant.
    let embedder = cfg.memory.embedding_url.as_ref().map(|url| {
        Arc::new(HttpEmbeddingProvider::new(
            url.clone(),
            cfg.memory
                .embedding_model
                .clone()
                .unwrap_or_else(|| "text-embedding-3-small".into()),
            None,
        )) as Arc<dyn harbor_memory::EmbeddingProvider>
    });
    let memory: Arc<dyn MemoryBackend> = Arc::new(
        SqliteMemoryStore::open(&cfg.memory, embedder).context("opening memory store")?,
    );

    // Tool registry: standard set plus the MCP bridge.  web_fetch is
    // re-registered with the configured host blocklist.
    let mut registry = create_default(&cfg.tools);
    if !cfg.security.blocked_hosts.is_empty() {
        registry.register(harbor_tools::WebFetchTool {
            blocked_hosts: cfg.security.blocked_hosts.clone(),
        });
    }
    if !cfg.mcp_servers.is_empty() {
        registry.register(harbor_mcp::McpClientTool::new(cfg.mcp_servers.clone()));
    }
    let registry = Arc::new(registry);

    let provider = build_provider(&cfg.provider).context("building provider")?;

    let mut engine = Engine::new(
        provider,
        registry,
        security,
        Duration::from_secs(cfg.tools.timeout_secs),
        cfg.engine.max_tool_rounds,
    )
    .with_memory(memory);
    if cfg.worker.worker_binary.is_some() {
        let pool: Arc<dyn TaskExecutor> = WorkerPool::new(cfg.worker.clone());
        engine = engine.with_executor(pool);
    }
    if let Some(url) = &cfg.tools.search_url {
        engine = engine.with_search(Arc::new(HttpSearchBackend::new(url.clone())));
    }
    if let Some(dir) = &cfg.tools.skills_dir {
        engine = engine.with_skills_dir(dir.clone());
    }
    let engine = Arc::new(engine);

    let manager = SessionManager::new(cfg.sessions.clone());
    let monitor = HealthMonitor::new(&cfg.supervisor);

    // Assemble channels by hand so the concrete canvas handle stays
    // available to the WebSocket layer; the registry holds the same Arc.
    let mut channels = ChannelRegistry::new();
    match &cfg.channels.terminal {
        Some(c) if !c.enabled => {}
        _ => channels.register(Arc::new(TerminalChannel::new())),
    }
    if let Some(webhook) = &cfg.channels.webhook {
        if webhook.enabled {
            channels.register(Arc::new(WebhookChannel::new(webhook.clone())));
        }
    }
    let canvas_enabled = cfg.channels.canvas.as_ref().map(|c| c.enabled).unwrap_or(true);
    let canvas_channel = if canvas_enabled {
        let canvas = Arc::new(CanvasChannel::new());
        channels.register(canvas.clone());
        Some(canvas)
    } else {
        None
    };
    let channels = Arc::new(channels);

    let state = Arc::new(GatewayState {
        cfg,
        manager,
        engine,
        channels,
        canvas_channel,
        monitor,
        validator: InputValidator::new(),
        canvases: Mutex::new(HashMap::new()),
        active_runs: Mutex::new(HashMap::new()),
    });

    wire_channel_handlers(&state);
    Ok(state)
}

/// Point every channel's inbound handler at the shared dispatch path.
fn wire_channel_handlers(state: &Arc<GatewayState>) {
    for id in state.channels.ids() {
        let Some(channel) = state.channels.get(&id) else {
            continue;
        };
        let dispatch_state = state.clone();
        channel.on_message(Arc::new(move |msg| {
            let state = dispatch_state.clone();
            tokio::spawn(async move {
                handle_inbound(state, msg).await;
            });
        }));
    }
}

/// The shared ingress path: channel message → session → engine run →
/// streamed events back out through the originating channel.
pub async fn handle_inbound(state: Arc<GatewayState>, msg: InboundMessage) {
    let key = msg.from.context_key();
    info!(key = %key, channel = %msg.channel_id, "inbound message");

    let cfg = state.cfg.clone();
    let session = state.manager.get_or_create(&key, || SessionConfigState {
        model: cfg.provider.model.clone(),
        provider: cfg.provider.kind.clone(),
        autonomy: cfg.security.autonomy,
        system_prompt: cfg.sessions.system_prompt.clone(),
    });

    // Threat scan: surface, accumulate, and block only critical findings.
    let (report, blocked) = {
        let mut s = session.lock().unwrap();
        let report = state.validator.validate(&msg.text, &s.turn_context);
        state.validator.accumulate(&mut s.turn_context, &report);
        let blocked = report.max_severity() == Some(ThreatSeverity::Critical);
        (report, blocked)
    };
    if !report.is_clean() {
        warn!(key = %key, threats = report.threats.len(), "inbound threats detected");
    }
    if blocked {
        let _ = state
            .channels
            .send(
                &msg.channel_id,
                msg.from.user_id.as_deref().unwrap_or(""),
                &OutboundMessage::text(
                    "Your message was blocked by the security scanner. Please rephrase.",
                ),
            )
            .await;
        return;
    }

    // Build the run job from the session's log plus this message.
    let (job, run_cancel) = {
        let mut s = session.lock().unwrap();
        if s.activate().is_err() {
            warn!(key = %key, "message for terminal session dropped");
            return;
        }
        s.push_message(harbor_model::Message::user(&msg.text));

        let run_cancel = s.cancel.child_token();
        let mut job = RunJob::new(s.id.clone(), s.config.model.clone());
        job.messages = s.messages().to_vec();
        job.system_prompt = s.config.system_prompt.clone();
        job.cwd = cfg.security.workspace_root.clone();
        job.stats = Some(s.stats.clone());
        job.steering = Some(s.steering_queue());
        job.canvas = Some(state.canvas_for(&key));
        (job, run_cancel)
    };
    state.insert_active_run(&key, run_cancel.clone());

    let opts = StartOptions {
        cancel: Some(run_cancel),
        confirm: None,
    };
    let mut handle = match state.engine.start_run(job, opts) {
        Ok(h) => h,
        Err(e) => {
            error!(key = %key, "run refused: {e}");
            session.lock().unwrap().stats.record_error(e.to_string());
            return;
        }
    };

    let mut answer = None;
    while let Some(event) = handle.next_event().await {
        match &event {
            EngineEvent::TextDelta { delta } => {
                if let Some(canvas) = &state.canvas_channel {
                    canvas.broadcast(ServerFrame::TextDelta {
                        delta: delta.clone(),
                    });
                }
            }
            EngineEvent::Completed { answer: text, .. } => answer = Some(text.clone()),
            EngineEvent::Error { error } => {
                let text = match error {
                    ErrorReason::Cancelled => "(run cancelled)".to_string(),
                    other => format!("run failed: {other:?}"),
                };
                session.lock().unwrap().stats.record_error(text.clone());
                answer = Some(text);
            }
            _ => {}
        }
    }
    state.remove_active_run(&key);

    let Some(answer) = answer else { return };
    {
        let mut s = session.lock().unwrap();
        s.push_message(harbor_model::Message::assistant(&answer));
        s.touch();
    }
    if let Some(notes) = state.manager.notes() {
        let mut note = notes.load(&key).unwrap_or_else(|| {
            harbor_engine::SessionNote::new(
                &key,
                &msg.channel_id,
                msg.from.user_id.as_deref().unwrap_or("anonymous"),
                &msg.text,
            )
        });
        note.request = msg.text.clone();
        note.request_at = chrono::Utc::now();
        note.record_activity(&answer);
        let _ = notes.save(&note);
    }

    let recipient = msg.from.user_id.as_deref().unwrap_or("");
    if let Err(e) = state
        .channels
        .send(&msg.channel_id, recipient, &OutboundMessage::text(&answer))
        .await
    {
        error!(channel = %msg.channel_id, "outbound send failed: {e}");
    }
}

/// Start the gateway and serve until the process is stopped.
pub async fn run(cfg: Config) -> anyhow::Result<()> {
    let state = build_state(cfg)?;

    // Background machinery.
    state.manager.spawn_eviction_sweep();
    state.monitor.spawn_check_loop();

    let supervisor = Supervisor::new(state.cfg.supervisor.clone(), state.monitor.clone());
    supervisor.supervise(
        "session_manager",
        Arc::new(|| Box::pin(async { Ok::<(), anyhow::Error>(()) })),
    );

    // Heartbeat loop for the long-running children we own in-process.
    {
        let monitor = state.monitor.clone();
        let interval = Duration::from_millis(state.cfg.supervisor.heartbeat_interval_ms / 2);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval.max(Duration::from_millis(100)));
            loop {
                tick.tick().await;
                monitor.heartbeat("session_manager");
            }
        });
    }

    // Start channels.
    for id in state.channels.ids() {
        if let Some(channel) = state.channels.get(&id) {
            if let Err(e) = channel.start().await {
                warn!(channel = %id, "channel failed to start: {e}");
            }
        }
    }
    if let Some(canvas) = &state.canvas_channel {
        let _ = canvas.start().await;
    }

    let bind = state.cfg.http.bind.clone();
    let app = crate::http::router(state);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    info!(bind = %bind, "gateway listening");
    axum::serve(listener, app).await.context("server error")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
