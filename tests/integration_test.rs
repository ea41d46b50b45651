// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// End-to-end gateway tests using the mock model provider: a message
/// arrives on a channel, flows through a session and the engine, and the
/// reply lands back on the channel — no network, no real model.
use harbor_channels::{InboundMessage, SenderRef};
use harbor_gateway::{build_state, handle_inbound};

fn mock_config(dir: &std::path::Path) -> harbor_config::Config {
    let mut cfg = harbor_config::Config::default();
    cfg.provider.kind = "mock".into();
    cfg.provider.model = "mock-model".into();
    cfg.memory.db_path = Some(dir.join("memory.db"));
    cfg.security.workspace_root = dir.to_path_buf();
    cfg.sessions.notes_dir = Some(dir.join("sessions"));
    cfg
}

#[tokio::test]
async fn message_round_trips_through_the_whole_stack() {
    let dir = tempfile::TempDir::new().unwrap();
    let state = build_state(mock_config(dir.path())).unwrap();

    let msg = InboundMessage::text_message(
        "terminal",
        SenderRef::user("terminal", "local"),
        "Hello",
    );
    handle_inbound(state.clone(), msg).await;

    let session = state.manager.get("terminal:local").expect("session created");
    let s = session.lock().unwrap();
    let stats = s.stats.snapshot();
    assert_eq!(stats.llm_calls, 1);
    assert_eq!(stats.tool_invocations, 0);
    assert_eq!(s.messages().len(), 2, "user + assistant in the log");
}

#[tokio::test]
async fn session_notes_are_written_per_context_key() {
    let dir = tempfile::TempDir::new().unwrap();
    let state = build_state(mock_config(dir.path())).unwrap();

    let msg = InboundMessage::text_message(
        "terminal",
        SenderRef::user("terminal", "local"),
        "remember the milk",
    );
    handle_inbound(state.clone(), msg).await;

    let notes = state.manager.notes().expect("notes configured");
    let note = notes.load("terminal:local").expect("note written");
    assert_eq!(note.request, "remember the milk");
    assert!(!note.recent_activity.is_empty());
}

#[tokio::test]
async fn second_message_continues_the_same_session() {
    let dir = tempfile::TempDir::new().unwrap();
    let state = build_state(mock_config(dir.path())).unwrap();

    for text in ["first", "second"] {
        let msg = InboundMessage::text_message(
            "terminal",
            SenderRef::user("terminal", "local"),
            text,
        );
        handle_inbound(state.clone(), msg).await;
    }

    let session = state.manager.get("terminal:local").unwrap();
    let s = session.lock().unwrap();
    assert_eq!(s.stats.snapshot().llm_calls, 2);
    assert_eq!(s.messages().len(), 4);
}

#[tokio::test]
async fn distinct_users_get_distinct_sessions() {
    let dir = tempfile::TempDir::new().unwrap();
    let state = build_state(mock_config(dir.path())).unwrap();

    for user in ["alice", "bob"] {
        let msg = InboundMessage::text_message(
            "terminal",
            SenderRef::user("terminal", user),
            "hi",
        );
        handle_inbound(state.clone(), msg).await;
    }

    assert!(state.manager.get("terminal:alice").is_some());
    assert!(state.manager.get("terminal:bob").is_some());
    assert_eq!(state.manager.list().len(), 2);
}
