// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! OpenAI-compatible chat completion provider.
//!
//! Many hosted and local model servers speak the same `/chat/completions`
//! SSE streaming wire format; this single provider covers all of them via
//! `base_url`.  Only the message-shape contract is modelled here — provider
//! quirks beyond it (caching markers, reasoning fields) are out of scope.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use harbor_config::ProviderConfig;

use crate::{
    provider::ResponseStream,
    retry::{with_retry, RetryPolicy},
    CompletionRequest, MessageContent, ProviderError, ResponseEvent, Role, Usage,
};

pub struct OpenAiCompatProvider {
    model: String,
    api_key: Option<String>,
    chat_url: String,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl OpenAiCompatProvider {
    pub fn new(cfg: &ProviderConfig) -> anyhow::Result<Self> {
        let api_key = cfg.api_key.clone().or_else(|| {
            cfg.api_key_env
                .as_deref()
                .and_then(|var| std::env::var(var).ok())
        });
        let base = cfg
            .base_url
            .as_deref()
            .unwrap_or("https://api.openai.com/v1")
            .trim_end_matches('/');
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()?;
        Ok(Self {
            model: cfg.model.clone(),
            api_key,
            chat_url: format!("{base}/chat/completions"),
            client,
            retry: RetryPolicy::from_max_retries(cfg.max_retries),
        })
    }
}

#[async_trait]
impl crate::ModelProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        "openai_compat"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, req: CompletionRequest) -> Result<ResponseStream, ProviderError> {
        let mut messages = Vec::new();
        if let Some(sys) = &req.system_prompt {
            messages.push(json!({ "role": "system", "content": sys }));
        }
        messages.extend(build_wire_messages(&req.messages));

        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();

        let model = if req.model.is_empty() {
            self.model.clone()
        } else {
            req.model.clone()
        };

        let mut body = json!({
            "model": model,
            "messages": messages,
            "stream": req.stream,
            "stream_options": { "include_usage": true },
        });
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }

        debug!(
            model = %model,
            tool_count = tools.len(),
            message_count = messages.len(),
            "sending completion request"
        );

        // Retry covers connection + status; once a stream is established,
        // mid-stream failures surface as stream errors instead.  Each
        // attempt owns its request so the retry closure stays borrow-free.
        let resp = with_retry(&self.retry, || {
            let client = self.client.clone();
            let url = self.chat_url.clone();
            let api_key = self.api_key.clone();
            let body = body.clone();
            async move {
                let mut http_req = client.post(&url).json(&body);
                if let Some(key) = &api_key {
                    http_req = http_req.bearer_auth(key);
                }
                let resp = http_req.send().await.map_err(ProviderError::from)?;
                classify_status(resp).await
            }
        })
        .await?;

        let byte_stream = resp.bytes_stream();
        // A network chunk boundary may land in the middle of an SSE line,
        // so carry the partial tail forward and parse whole lines only.
        let event_stream = byte_stream
            .scan(String::new(), |buf, chunk| {
                let events: Vec<Result<ResponseEvent, ProviderError>> = match chunk {
                    Ok(b) => {
                        buf.push_str(&String::from_utf8_lossy(&b));
                        drain_complete_sse_lines(buf)
                    }
                    Err(e) => vec![Err(ProviderError::Transport(e.to_string()))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

/// Map a non-success status to the error taxonomy; pass success through.
async fn classify_status(resp: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    match status.as_u16() {
        401 | 403 => {
            let text = resp.text().await.unwrap_or_default();
            Err(ProviderError::Auth(text))
        }
        429 => {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs);
            Err(ProviderError::RateLimited { retry_after })
        }
        400..=499 => {
            let text = resp.text().await.unwrap_or_default();
            Err(ProviderError::BadRequest(text))
        }
        s => Err(ProviderError::Server { status: s }),
    }
}

/// One whole SSE line → at most one [`ResponseEvent`].  Blank lines,
/// comments and undecodable payloads produce nothing.
fn parse_sse_data_line(line: &str) -> Option<Result<ResponseEvent, ProviderError>> {
    let data = line.strip_prefix("data: ")?.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(Ok(ResponseEvent::Done));
    }
    let v: Value = serde_json::from_str(data).ok()?;
    Some(Ok(parse_sse_chunk(&v)))
}

/// Consume every `\n`-terminated line in `buf`, leaving a partial tail
/// (if any) for the next chunk to complete.
fn drain_complete_sse_lines(buf: &mut String) -> Vec<Result<ResponseEvent, ProviderError>> {
    let mut events = Vec::new();
    while let Some(nl_pos) = buf.find('\n') {
        let line = buf[..nl_pos].trim_end_matches('\r').to_string();
        *buf = buf[nl_pos + 1..].to_string();
        if let Some(ev) = parse_sse_data_line(&line) {
            events.push(ev);
        }
    }
    events
}

fn parse_sse_chunk(v: &Value) -> ResponseEvent {
    // With include_usage set, the final chunk carries usage and no delta.
    if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
        return ResponseEvent::Usage(Usage {
            input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
        });
    }

    let delta = &v["choices"][0]["delta"];

    // Tool call delta — one tool-call delta per chunk in practice; the
    // `index` field routes accumulation for parallel calls.
    if let Some(tc) = delta.get("tool_calls").and_then(|t| t.get(0)) {
        return ResponseEvent::ToolCall {
            index: tc["index"].as_u64().unwrap_or(0) as u32,
            id: tc["id"].as_str().unwrap_or("").to_string(),
            name: tc["function"]["name"].as_str().unwrap_or("").to_string(),
            arguments: tc["function"]["arguments"].as_str().unwrap_or("").to_string(),
        };
    }

    if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
        return ResponseEvent::TextDelta(text.to_string());
    }

    ResponseEvent::TextDelta(String::new())
}

fn role_str(r: &Role) -> &'static str {
    match r {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

/// Convert internal [`crate::Message`]s into the OpenAI wire-format array.
///
/// **Parallel tool call coalescing**: the wire format requires all tool
/// calls of one assistant turn inside a single message's `tool_calls`
/// array, while harbor stores each call as a separate message.  Consecutive
/// ToolCall messages are merged here.
fn build_wire_messages(messages: &[crate::Message]) -> Vec<Value> {
    use crate::ContentBlock;

    fn tool_call_to_json(tool_call_id: &str, function: &crate::FunctionCall) -> Value {
        json!({
            "id": tool_call_id,
            "type": "function",
            "function": {
                "name": function.name,
                "arguments": function.arguments,
            }
        })
    }

    let mut result: Vec<Value> = Vec::with_capacity(messages.len());
    let mut i = 0;

    while i < messages.len() {
        let m = &messages[i];

        if let MessageContent::ToolCall {
            tool_call_id,
            function,
        } = &m.content
        {
            let mut calls = vec![tool_call_to_json(tool_call_id, function)];
            i += 1;
            while i < messages.len() {
                if let MessageContent::ToolCall {
                    tool_call_id,
                    function,
                } = &messages[i].content
                {
                    calls.push(tool_call_to_json(tool_call_id, function));
                    i += 1;
                } else {
                    break;
                }
            }
            result.push(json!({ "role": "assistant", "tool_calls": calls }));
            continue;
        }

        let v = match &m.content {
            MessageContent::Text(t) => json!({
                "role": role_str(&m.role),
                "content": t,
            }),
            MessageContent::Blocks(blocks) => {
                let content: Vec<Value> = blocks
                    .iter()
                    .map(|b| match b {
                        ContentBlock::Text { text } => json!({ "type": "text", "text": text }),
                        ContentBlock::Image { image_url } => json!({
                            "type": "image_url",
                            "image_url": { "url": image_url },
                        }),
                        ContentBlock::ToolInput { name, args } => json!({
                            "type": "text",
                            "text": format!("[tool input {name}] {args}"),
                        }),
                        ContentBlock::ToolOutput { output } => json!({
                            "type": "text",
                            "text": output,
                        }),
                    })
                    .collect();
                json!({ "role": role_str(&m.role), "content": content })
            }
            MessageContent::ToolResult {
                tool_call_id,
                content,
            } => json!({
                "role": "tool",
                "tool_call_id": tool_call_id,
                "content": content,
            }),
            MessageContent::ToolCall { .. } => unreachable!("handled above"),
        };
        result.push(v);
        i += 1;
    }

    result
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Message;

    #[test]
    fn text_message_serialises_role_and_content() {
        let msgs = build_wire_messages(&[Message::user("hello")]);
        assert_eq!(msgs[0]["role"], json!("user"));
        assert_eq!(msgs[0]["content"], json!("hello"));
    }

    #[test]
    fn consecutive_tool_calls_coalesce() {
        let args = json!({"x": 1});
        let msgs = build_wire_messages(&[
            Message::tool_call("a", "ls", &args),
            Message::tool_call("b", "grep", &args),
            Message::tool_result("a", "out-a"),
        ]);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0]["tool_calls"].as_array().unwrap().len(), 2);
        assert_eq!(msgs[1]["role"], json!("tool"));
        assert_eq!(msgs[1]["tool_call_id"], json!("a"));
    }

    #[test]
    fn sse_done_sentinel_is_parsed() {
        let mut buf = String::from("data: [DONE]\n");
        let events = drain_complete_sse_lines(&mut buf);
        assert!(matches!(events.as_slice(), [Ok(ResponseEvent::Done)]));
        assert!(buf.is_empty(), "sentinel line should be fully consumed");
    }

    #[test]
    fn partial_sse_line_stays_buffered() {
        let mut buf = "data: {\"choices\":[{\"delta\":{\"con".to_string();
        let events = drain_complete_sse_lines(&mut buf);
        assert!(events.is_empty());
        assert!(!buf.is_empty());

        buf.push_str("tent\":\"hi\"}}]}\n");
        let events = drain_complete_sse_lines(&mut buf);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            Ok(ResponseEvent::TextDelta(ref t)) if t == "hi"
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn tool_call_chunk_is_parsed() {
        let v: Value = serde_json::from_str(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"ls","arguments":"{\"path"}}]}}]}"#,
        )
        .unwrap();
        match parse_sse_chunk(&v) {
            ResponseEvent::ToolCall {
                index,
                id,
                name,
                arguments,
            } => {
                assert_eq!(index, 0);
                assert_eq!(id, "c1");
                assert_eq!(name, "ls");
                assert_eq!(arguments, "{\"path");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn usage_chunk_is_parsed() {
        let v: Value =
            serde_json::from_str(r#"{"usage":{"prompt_tokens":12,"completion_tokens":5}}"#)
                .unwrap();
        match parse_sse_chunk(&v) {
            ResponseEvent::Usage(u) => {
                assert_eq!(u.input_tokens, 12);
                assert_eq!(u.output_tokens, 5);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn blocks_message_becomes_content_array() {
        let m = Message::user_with_blocks(vec![
            crate::ContentBlock::text("what is this"),
            crate::ContentBlock::image("https://example.com/x.png"),
        ]);
        let msgs = build_wire_messages(&[m]);
        let content = msgs[0]["content"].as_array().unwrap();
        assert_eq!(content.len(), 2);
        assert_eq!(content[1]["type"], json!("image_url"));
    }
}
