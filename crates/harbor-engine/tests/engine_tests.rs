// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! End-to-end engine scenarios driven by scripted providers: no network,
//! no real model, deterministic streams.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use harbor_config::{AutonomyLevel, SecurityConfig, ToolsConfig};
use harbor_engine::{Engine, EngineEvent, ErrorReason, RunJob, StartOptions, SteeringMessage};
use harbor_model::{
    CompletionRequest, Message, MessageContent, ModelProvider, ProviderError, ResponseEvent,
    ScriptedProvider,
};
use harbor_security::SecurityPolicy;
use harbor_tools::create_default;

fn engine_with(
    provider: Arc<dyn ModelProvider>,
    workspace: &std::path::Path,
    autonomy: AutonomyLevel,
) -> Arc<Engine> {
    let registry = Arc::new(create_default(&ToolsConfig::default()));
    let cfg = SecurityConfig {
        workspace_root: workspace.to_path_buf(),
        autonomy,
        ..SecurityConfig::default()
    };
    let security = Arc::new(SecurityPolicy::with_home(&cfg, None));
    Arc::new(Engine::new(
        provider,
        registry,
        security,
        Duration::from_secs(10),
        8,
    ))
}

fn job_in(dir: &std::path::Path, text: &str) -> RunJob {
    let mut job = RunJob::new("session-1", "test-model");
    job.messages.push(Message::user(text));
    job.cwd = dir.to_path_buf();
    job
}

/// Provider that emits text deltas with a pacing delay, for cancellation
/// tests that need to interrupt mid-stream.
struct PacedProvider {
    deltas: Vec<String>,
    delay: Duration,
}

#[async_trait]
impl ModelProvider for PacedProvider {
    fn name(&self) -> &str {
        "paced"
    }
    fn model_name(&self) -> &str {
        "paced-model"
    }

    async fn complete(
        &self,
        _req: CompletionRequest,
    ) -> Result<harbor_model::ResponseStream, ProviderError> {
        let delay = self.delay;
        let mut events: Vec<ResponseEvent> = self
            .deltas
            .iter()
            .cloned()
            .map(ResponseEvent::TextDelta)
            .collect();
        events.push(ResponseEvent::Done);
        let stream = futures::stream::iter(events).then(move |ev| async move {
            tokio::time::sleep(delay).await;
            Ok::<_, ProviderError>(ev)
        });
        Ok(Box::pin(stream))
    }
}

// ── Scenario 1: cold start to first answer ───────────────────────────────────

#[tokio::test]
async fn cold_start_to_first_answer() {
    let dir = tempfile::TempDir::new().unwrap();
    let provider = Arc::new(ScriptedProvider::always_text("Hi there."));
    let engine = engine_with(provider, dir.path(), AutonomyLevel::Supervised);

    let mut job = job_in(dir.path(), "Hello");
    let stats = Arc::new(harbor_engine::SessionStats::default());
    job.stats = Some(stats.clone());

    let mut handle = engine.start_run(job, StartOptions::default()).unwrap();
    let events = handle.collect_events().await;

    assert!(matches!(events.first(), Some(EngineEvent::Started { .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, EngineEvent::TextDelta { .. })));
    match events.last() {
        Some(EngineEvent::Completed { answer, .. }) => assert_eq!(answer, "Hi there."),
        other => panic!("expected Completed, got {other:?}"),
    }

    let snap = stats.snapshot();
    assert_eq!(snap.iterations, 1);
    assert_eq!(snap.llm_calls, 1);
    assert_eq!(snap.tool_invocations, 0);
}

// ── Scenario 2: tool round-trip ──────────────────────────────────────────────

#[tokio::test]
async fn tool_round_trip_appends_result_between_turns() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(dir.path().join("notes.txt"), "x").unwrap();

    let provider = Arc::new(ScriptedProvider::tool_then_text(
        "call-1",
        "ls",
        r#"{"path":"."}"#,
        "The directory contains notes.txt.",
    ));
    let last_request = provider.last_request.clone();
    let engine = engine_with(provider, dir.path(), AutonomyLevel::Supervised);

    let mut job = job_in(dir.path(), "list files");
    let stats = Arc::new(harbor_engine::SessionStats::default());
    job.stats = Some(stats.clone());

    let mut handle = engine.start_run(job, StartOptions::default()).unwrap();
    let events = handle.collect_events().await;

    let start_idx = events
        .iter()
        .position(|e| matches!(e, EngineEvent::ToolStart { tool, .. } if tool == "ls"))
        .expect("ToolStart for ls");
    let end_idx = events
        .iter()
        .position(|e| matches!(e, EngineEvent::ToolEnd { id, .. } if id == "call-1"))
        .expect("ToolEnd for call-1");
    assert!(start_idx < end_idx);

    match events.last() {
        Some(EngineEvent::Completed { answer, .. }) => {
            assert!(answer.contains("notes.txt"))
        }
        other => panic!("expected Completed, got {other:?}"),
    }

    // The second provider call must see the tool-role message in between.
    let req = last_request.lock().unwrap().clone().expect("second request");
    assert!(req.messages.iter().any(|m| matches!(
        &m.content,
        MessageContent::ToolResult { tool_call_id, content }
            if tool_call_id == "call-1" && content.contains("notes.txt")
    )));

    let snap = stats.snapshot();
    assert_eq!(snap.llm_calls, 2);
    assert_eq!(snap.tool_invocations, 1);
}

// ── Scenario 3: cancellation mid-stream ──────────────────────────────────────

#[tokio::test]
async fn cancellation_mid_stream_stops_without_completed() {
    let dir = tempfile::TempDir::new().unwrap();
    let provider = Arc::new(PacedProvider {
        deltas: (0..10).map(|i| format!("chunk{i} ")).collect(),
        delay: Duration::from_millis(30),
    });
    let engine = engine_with(provider, dir.path(), AutonomyLevel::Supervised);

    let mut handle = engine
        .start_run(job_in(dir.path(), "stream please"), StartOptions::default())
        .unwrap();

    let mut deltas_seen = 0;
    let mut events = Vec::new();
    while let Some(ev) = handle.next_event().await {
        if matches!(ev, EngineEvent::TextDelta { .. }) {
            deltas_seen += 1;
            if deltas_seen == 3 {
                handle.cancel();
            }
        }
        events.push(ev);
    }

    let delta_count = events
        .iter()
        .filter(|e| matches!(e, EngineEvent::TextDelta { .. }))
        .count();
    assert!(delta_count <= 4, "expected few deltas, saw {delta_count}");
    assert!(matches!(
        events.last(),
        Some(EngineEvent::Error {
            error: ErrorReason::Cancelled
        })
    ));
    assert!(!events
        .iter()
        .any(|e| matches!(e, EngineEvent::Completed { .. })));
}

// ── Scenario 4: steering between turns ───────────────────────────────────────

/// Two-phase provider with a slow first turn: the first call holds its
/// stream open long enough for a steering message to be enqueued mid-turn,
/// the second call answers in text.  `last_request` records what the
/// second turn actually saw.
struct TwoPhaseProvider {
    calls: std::sync::atomic::AtomicU32,
    first_turn_delay: Duration,
    last_request: std::sync::Mutex<Option<CompletionRequest>>,
}

impl TwoPhaseProvider {
    fn new(first_turn_delay: Duration) -> Self {
        Self {
            calls: std::sync::atomic::AtomicU32::new(0),
            first_turn_delay,
            last_request: std::sync::Mutex::new(None),
        }
    }
}

#[async_trait]
impl ModelProvider for TwoPhaseProvider {
    fn name(&self) -> &str {
        "two-phase"
    }
    fn model_name(&self) -> &str {
        "two-phase-model"
    }

    async fn complete(
        &self,
        req: CompletionRequest,
    ) -> Result<harbor_model::ResponseStream, ProviderError> {
        *self.last_request.lock().unwrap() = Some(req);
        let first = self
            .calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            == 0;
        if first {
            let delay = self.first_turn_delay;
            let events = vec![
                ResponseEvent::ToolCall {
                    index: 0,
                    id: "call-1".into(),
                    name: "ls".into(),
                    arguments: r#"{"path":"."}"#.into(),
                },
                ResponseEvent::Done,
            ];
            let stream = futures::stream::iter(events).then(move |ev| async move {
                tokio::time::sleep(delay).await;
                Ok::<_, ProviderError>(ev)
            });
            Ok(Box::pin(stream))
        } else {
            let events: Vec<Result<ResponseEvent, ProviderError>> = vec![
                Ok(ResponseEvent::TextDelta("Done, and X is mentioned.".into())),
                Ok(ResponseEvent::Done),
            ];
            Ok(Box::pin(futures::stream::iter(events)))
        }
    }
}

#[tokio::test]
async fn steering_appears_before_next_provider_call() {
    let dir = tempfile::TempDir::new().unwrap();
    let provider = Arc::new(TwoPhaseProvider::new(Duration::from_millis(300)));
    let provider_ref = provider.clone();
    let engine = engine_with(provider, dir.path(), AutonomyLevel::Supervised);

    let mut handle = engine
        .start_run(job_in(dir.path(), "list files"), StartOptions::default())
        .unwrap();

    // The first turn streams for ~600ms; enqueue well inside it so the
    // message is observed at the next turn boundary.
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.steer(SteeringMessage::inject("Also mention X"));

    let events = handle.collect_events().await;
    assert!(matches!(events.last(), Some(EngineEvent::Completed { .. })));

    let req = provider_ref
        .last_request
        .lock()
        .unwrap()
        .clone()
        .expect("second request");
    let steer_idx = req
        .messages
        .iter()
        .position(|m| m.as_text() == Some("Also mention X"))
        .expect("steered message present in next turn");
    // It lands after the tool result: the in-flight stream was never spliced.
    let result_idx = req
        .messages
        .iter()
        .position(|m| matches!(m.content, MessageContent::ToolResult { .. }))
        .unwrap();
    assert!(steer_idx > result_idx);
}

// ── Steering abort ───────────────────────────────────────────────────────────

#[tokio::test]
async fn steering_abort_ends_run_with_cancelled() {
    let dir = tempfile::TempDir::new().unwrap();
    let provider = Arc::new(TwoPhaseProvider::new(Duration::from_millis(300)));
    let engine = engine_with(provider, dir.path(), AutonomyLevel::Supervised);

    let mut handle = engine
        .start_run(job_in(dir.path(), "go"), StartOptions::default())
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.steer(SteeringMessage::abort("operator stop"));

    let events = handle.collect_events().await;
    assert!(matches!(
        events.last(),
        Some(EngineEvent::Error {
            error: ErrorReason::Cancelled
        })
    ));
    assert!(!events
        .iter()
        .any(|e| matches!(e, EngineEvent::Completed { .. })));
}

// ── Event order laws ─────────────────────────────────────────────────────────

#[tokio::test]
async fn event_stream_is_well_formed() {
    let dir = tempfile::TempDir::new().unwrap();
    let provider = Arc::new(ScriptedProvider::tool_then_text(
        "call-1",
        "ls",
        r#"{"path":"."}"#,
        "done",
    ));
    let engine = engine_with(provider, dir.path(), AutonomyLevel::Supervised);

    let mut handle = engine
        .start_run(job_in(dir.path(), "x"), StartOptions::default())
        .unwrap();
    let events = handle.collect_events().await;

    // Exactly one Started, first.
    assert!(matches!(events[0], EngineEvent::Started { .. }));
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, EngineEvent::Started { .. }))
            .count(),
        1
    );
    // Exactly one terminal event, last.
    let terminal_count = events.iter().filter(|e| e.is_terminal()).count();
    assert_eq!(terminal_count, 1);
    assert!(events.last().unwrap().is_terminal());
    // ToolStart precedes ToolEnd for every id.
    for (i, ev) in events.iter().enumerate() {
        if let EngineEvent::ToolEnd { id, .. } = ev {
            assert!(events[..i]
                .iter()
                .any(|e| matches!(e, EngineEvent::ToolStart { id: sid, .. } if sid == id)));
        }
    }
}

// ── Resume ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn resume_token_round_trips_and_continues() {
    let dir = tempfile::TempDir::new().unwrap();
    let provider = Arc::new(ScriptedProvider::new(vec![
        vec![
            ResponseEvent::TextDelta("first answer".into()),
            ResponseEvent::Done,
        ],
        vec![
            ResponseEvent::TextDelta("second answer".into()),
            ResponseEvent::Done,
        ],
    ]));
    let last_request = provider.last_request.clone();
    let engine = engine_with(provider, dir.path(), AutonomyLevel::Supervised);

    let mut handle = engine
        .start_run(job_in(dir.path(), "start"), StartOptions::default())
        .unwrap();
    let events = handle.collect_events().await;
    let token = match &events[0] {
        EngineEvent::Started { resume_token } => resume_token.clone(),
        other => panic!("expected Started, got {other:?}"),
    };

    // Serialise round-trip.
    let json = serde_json::to_string(&token).unwrap();
    let token: harbor_engine::ResumeToken = serde_json::from_str(&json).unwrap();

    let mut handle = engine
        .resume(token, "continue please", StartOptions::default())
        .unwrap();
    let first = handle.next_event().await.unwrap();
    assert!(matches!(first, EngineEvent::Started { .. }));
    let rest = handle.collect_events().await;
    assert!(matches!(rest.last(), Some(EngineEvent::Completed { .. })));

    let req = last_request.lock().unwrap().clone().unwrap();
    assert!(req
        .messages
        .iter()
        .any(|m| m.as_text() == Some("continue please")));
}

#[tokio::test]
async fn resume_rejects_foreign_engine_token() {
    let dir = tempfile::TempDir::new().unwrap();
    let provider = Arc::new(ScriptedProvider::always_text("x"));
    let engine = engine_with(provider, dir.path(), AutonomyLevel::Supervised);

    let token = harbor_engine::ResumeToken {
        engine_id: "someone-else".into(),
        ref_id: "r".into(),
        state: harbor_engine::RunSnapshot {
            messages: vec![],
            tools: None,
            system_prompt: None,
            model: "m".into(),
            session_id: "s".into(),
            cwd: dir.path().to_path_buf(),
        },
    };
    let err = engine
        .resume(token, "x", StartOptions::default())
        .unwrap_err();
    assert!(matches!(err, harbor_engine::EngineError::ResumeMismatch));
}

// ── Confirmation gate ────────────────────────────────────────────────────────

#[tokio::test]
async fn confirmation_denied_by_default_without_resolver() {
    let dir = tempfile::TempDir::new().unwrap();
    // Readonly autonomy: file_write requires confirmation.
    let provider = Arc::new(ScriptedProvider::tool_then_text(
        "call-1",
        "file_write",
        r#"{"path":"a.txt","content":"hi"}"#,
        "wrote it",
    ));
    let engine = engine_with(provider, dir.path(), AutonomyLevel::Readonly);

    let mut handle = engine
        .start_run(job_in(dir.path(), "write a file"), StartOptions::default())
        .unwrap();
    let events = handle.collect_events().await;

    assert!(
        events.iter().any(|e| matches!(
            e,
            EngineEvent::ToolProgress { update, .. }
                if update.kind == harbor_tools::ProgressKind::ConfirmationRequested
        )),
        "confirmation request must surface on the event stream"
    );
    let end = events
        .iter()
        .find_map(|e| match e {
            EngineEvent::ToolEnd { result, .. } => Some(result),
            _ => None,
        })
        .expect("tool end");
    assert!(!end.success);
    assert!(end.output.contains("denied"));
    // The file must not exist.
    assert!(!dir.path().join("a.txt").exists());
}

#[tokio::test]
async fn resolver_approval_lets_the_tool_run() {
    struct ApproveAll;
    #[async_trait]
    impl harbor_engine::ConfirmationResolver for ApproveAll {
        async fn confirm(&self, _action: &harbor_security::PendingAction) -> bool {
            true
        }
    }

    let dir = tempfile::TempDir::new().unwrap();
    let provider = Arc::new(ScriptedProvider::tool_then_text(
        "call-1",
        "file_write",
        r#"{"path":"a.txt","content":"hi"}"#,
        "wrote it",
    ));
    let engine = engine_with(provider, dir.path(), AutonomyLevel::Readonly);

    let opts = StartOptions {
        cancel: None,
        confirm: Some(Arc::new(ApproveAll)),
    };
    let mut handle = engine.start_run(job_in(dir.path(), "write"), opts).unwrap();
    let events = handle.collect_events().await;

    assert!(matches!(events.last(), Some(EngineEvent::Completed { .. })));
    assert_eq!(
        std::fs::read_to_string(dir.path().join("a.txt")).unwrap(),
        "hi"
    );
}

// ── Misconfiguration ─────────────────────────────────────────────────────────

#[tokio::test]
async fn empty_model_is_a_startup_error() {
    let dir = tempfile::TempDir::new().unwrap();
    let provider = Arc::new(ScriptedProvider::always_text("x"));
    let engine = engine_with(provider, dir.path(), AutonomyLevel::Supervised);

    let job = RunJob::new("s", "");
    let err = engine.start_run(job, StartOptions::default()).unwrap_err();
    assert!(matches!(err, harbor_engine::EngineError::NoModel));
}

// ── Provider stream without Done marker ──────────────────────────────────────

#[tokio::test]
async fn stream_end_without_done_still_completes() {
    let dir = tempfile::TempDir::new().unwrap();
    // Script ends after the delta — no Done event.
    let provider = Arc::new(ScriptedProvider::new(vec![vec![ResponseEvent::TextDelta(
        "partial but fine".into(),
    )]]));
    let engine = engine_with(provider, dir.path(), AutonomyLevel::Supervised);

    let mut handle = engine
        .start_run(job_in(dir.path(), "x"), StartOptions::default())
        .unwrap();
    let events = handle.collect_events().await;
    match events.last() {
        Some(EngineEvent::Completed { answer, .. }) => {
            assert_eq!(answer, "partial but fine")
        }
        other => panic!("expected Completed, got {other:?}"),
    }
}
