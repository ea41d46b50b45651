// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

// ─── Content blocks ───────────────────────────────────────────────────────────

/// A single block in a multi-part message body.
///
/// Provider and channel payloads vary their content shapes; this tagged
/// union is the one internal representation.  Translation to provider wire
/// formats happens inside each provider, never in the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        /// Either an HTTPS URL or an inline `data:image/...;base64,` URL.
        image_url: String,
    },
    /// Structured arguments the assistant fed into a tool.
    ToolInput {
        name: String,
        args: serde_json::Value,
    },
    /// Raw output a tool produced.
    ToolOutput {
        output: String,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image(image_url: impl Into<String>) -> Self {
        Self::Image {
            image_url: image_url.into(),
        }
    }
}

// ─── Messages ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single message in the conversation history.  Append-only within a
/// session's context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

/// Message body.  Plain text covers the common case; `Blocks` carries
/// mixed media, and the two tool variants pair a call with its result
/// through a shared `tool_call_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
    ToolCall {
        tool_call_id: String,
        function: FunctionCall,
    },
    ToolResult {
        tool_call_id: String,
        content: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    /// Argument object as a JSON string, exactly as streamed by the model.
    pub arguments: String,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn tool_call(id: impl Into<String>, name: impl Into<String>, args: &serde_json::Value) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::ToolCall {
                tool_call_id: id.into(),
                function: FunctionCall {
                    name: name.into(),
                    arguments: args.to_string(),
                },
            },
        }
    }

    pub fn tool_result(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: MessageContent::ToolResult {
                tool_call_id: id.into(),
                content: content.into(),
            },
        }
    }

    pub fn user_with_blocks(blocks: Vec<ContentBlock>) -> Self {
        let content = if blocks.len() == 1 {
            if let ContentBlock::Text { text } = &blocks[0] {
                MessageContent::Text(text.clone())
            } else {
                MessageContent::Blocks(blocks)
            }
        } else {
            MessageContent::Blocks(blocks)
        };
        Self {
            role: Role::User,
            content,
        }
    }

    /// Return the plain text of this message, if it has exactly one text body.
    pub fn as_text(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text(t) => Some(t),
            MessageContent::Blocks(blocks) if blocks.len() == 1 => match &blocks[0] {
                ContentBlock::Text { text } => Some(text),
                _ => None,
            },
            _ => None,
        }
    }

    /// Flatten all text blocks into one string (images and tool blocks omitted).
    pub fn text_lossy(&self) -> String {
        match &self.content {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    ContentBlock::ToolOutput { output } => Some(output.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
            MessageContent::ToolCall { function, .. } => function.name.clone(),
            MessageContent::ToolResult { content, .. } => content.clone(),
        }
    }
}

// ─── Tool definitions ─────────────────────────────────────────────────────────

/// A tool descriptor provided to the model.  Read-only once registered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object
    pub parameters: serde_json::Value,
}

// ─── Requests and streamed events ─────────────────────────────────────────────

/// Request sent to a model provider.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    /// Separate from `messages` so providers with native system slots can use
    /// them; others prepend a system-role message.
    pub system_prompt: Option<String>,
    pub stream: bool,
}

/// A single streamed event from the model.
#[derive(Debug, Clone)]
pub enum ResponseEvent {
    /// Incremental assistant text.
    TextDelta(String),
    /// A tool invocation request.  Argument fragments for one call share an
    /// `index` and must be concatenated by the consumer.
    ToolCall {
        index: u32,
        id: String,
        name: String,
        arguments: String,
    },
    /// Token counts, reported once near the end of the stream.
    Usage(Usage),
    /// Normal termination marker.  Optional: a stream that simply ends is
    /// treated the same.
    Done,
    /// Non-fatal provider warning.
    Error(String),
}

/// Token counts for one provider call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_constructor_sets_role_and_text() {
        let m = Message::user("hello");
        assert!(matches!(m.role, Role::User));
        assert_eq!(m.as_text(), Some("hello"));
    }

    #[test]
    fn tool_result_carries_call_id() {
        let m = Message::tool_result("call-1", "output");
        assert_eq!(m.role, Role::Tool);
        match &m.content {
            MessageContent::ToolResult {
                tool_call_id,
                content,
            } => {
                assert_eq!(tool_call_id, "call-1");
                assert_eq!(content, "output");
            }
            _ => panic!("wrong content variant"),
        }
    }

    #[test]
    fn tool_call_serialises_args_as_json_string() {
        let args = serde_json::json!({"path": "."});
        let m = Message::tool_call("c1", "ls", &args);
        match &m.content {
            MessageContent::ToolCall { function, .. } => {
                assert_eq!(function.name, "ls");
                let parsed: serde_json::Value = serde_json::from_str(&function.arguments).unwrap();
                assert_eq!(parsed, args);
            }
            _ => panic!("wrong content variant"),
        }
    }

    #[test]
    fn single_text_block_collapses_to_text() {
        let m = Message::user_with_blocks(vec![ContentBlock::text("hi")]);
        assert_eq!(m.as_text(), Some("hi"));
    }

    #[test]
    fn mixed_blocks_do_not_collapse() {
        let m = Message::user_with_blocks(vec![
            ContentBlock::text("look:"),
            ContentBlock::image("data:image/png;base64,AA"),
        ]);
        assert!(m.as_text().is_none());
        assert_eq!(m.text_lossy(), "look:");
    }

    #[test]
    fn content_block_tagged_encoding() {
        let b = ContentBlock::text("x");
        let json = serde_json::to_string(&b).unwrap();
        assert!(json.contains("\"kind\":\"text\""));
        let b = ContentBlock::ToolInput {
            name: "grep".into(),
            args: serde_json::json!({"pattern": "a"}),
        };
        let json = serde_json::to_string(&b).unwrap();
        assert!(json.contains("\"kind\":\"tool_input\""));
    }

    #[test]
    fn message_round_trips_through_json() {
        let original = Message::tool_call("id-1", "grep", &serde_json::json!({"pattern": "x"}));
        let json = serde_json::to_string(&original).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn role_serialises_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Assistant).unwrap(), "\"assistant\"");
        assert_eq!(serde_json::to_string(&Role::Tool).unwrap(), "\"tool\"");
    }

    #[test]
    fn tool_definition_round_trips() {
        let td = ToolDefinition {
            name: "ls".into(),
            description: "list".into(),
            parameters: serde_json::json!({"type": "object"}),
        };
        let json = serde_json::to_string(&td).unwrap();
        let back: ToolDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(back, td);
    }
}
