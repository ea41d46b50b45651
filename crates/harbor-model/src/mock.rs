// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Test providers.  No network, fully deterministic.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::{
    provider::ResponseStream, CompletionRequest, ProviderError, ResponseEvent, Role, Usage,
};

/// Wrap a finished event list as a provider stream.
fn replay(events: Vec<ResponseEvent>) -> ResponseStream {
    let items: Vec<Result<ResponseEvent, ProviderError>> = events.into_iter().map(Ok).collect();
    Box::pin(stream::iter(items))
}

/// Echo provider: replies `MOCK: <last user text>`.  Selected by
/// configuring `provider.kind = "mock"`, which keeps the whole gateway
/// runnable without an API key.
#[derive(Default)]
pub struct MockProvider;

#[async_trait]
impl crate::ModelProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "mock-model"
    }

    async fn complete(&self, req: CompletionRequest) -> Result<ResponseStream, ProviderError> {
        let last_user = req
            .messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .and_then(|m| m.as_text())
            .unwrap_or("[no input]");

        Ok(replay(vec![
            ResponseEvent::TextDelta(format!("MOCK: {last_user}")),
            ResponseEvent::Usage(Usage {
                input_tokens: 10,
                output_tokens: 10,
            }),
            ResponseEvent::Done,
        ]))
    }
}

/// Replays a queue of event scripts, one script per `complete()` call.
/// Tests use it to drive the engine through exact multi-turn sequences,
/// tool calls included.
pub struct ScriptedProvider {
    queue: Mutex<VecDeque<Vec<ResponseEvent>>>,
    /// Captures the request each `complete()` call received, so a test can
    /// assert on what the engine actually sent (message order, tool
    /// definitions, system prompt).
    pub last_request: Arc<Mutex<Option<CompletionRequest>>>,
}

impl ScriptedProvider {
    pub fn new(scripts: Vec<Vec<ResponseEvent>>) -> Self {
        Self {
            queue: Mutex::new(scripts.into()),
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    /// Single text answer, then done.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![vec![
            ResponseEvent::TextDelta(reply.into()),
            ResponseEvent::Usage(Usage {
                input_tokens: 5,
                output_tokens: 5,
            }),
            ResponseEvent::Done,
        ]])
    }

    /// Two-call script: a tool invocation, then a text answer once the
    /// tool result comes back.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        let call_turn = vec![
            ResponseEvent::ToolCall {
                index: 0,
                id: tool_id.into(),
                name: tool_name.into(),
                arguments: args_json.into(),
            },
            ResponseEvent::Done,
        ];
        let answer_turn = vec![
            ResponseEvent::TextDelta(final_text.into()),
            ResponseEvent::Done,
        ];
        Self::new(vec![call_turn, answer_turn])
    }
}

#[async_trait]
impl crate::ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted-mock"
    }
    fn model_name(&self) -> &str {
        "scripted-mock-model"
    }

    async fn complete(&self, req: CompletionRequest) -> Result<ResponseStream, ProviderError> {
        *self.last_request.lock().unwrap() = Some(req);
        let script = self.queue.lock().unwrap().pop_front().unwrap_or_else(|| {
            vec![
                ResponseEvent::TextDelta("[no more scripts]".into()),
                ResponseEvent::Done,
            ]
        });
        Ok(replay(script))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
