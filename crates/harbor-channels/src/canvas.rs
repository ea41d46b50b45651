// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Canvas channel: the realtime pair to a browser front-end.
//!
//! Frames are JSON objects with a `type` field, one object per WebSocket
//! frame (no embedded newlines at the framing level — JSON escapes them).
//! Most client frames translate into bracketed inbound text so a single
//! text-driven agent sees structured UI events uniformly; `drag` and
//! `ping` are handled at transport level and never reach the session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;

use harbor_canvas::{CanvasChange, CanvasSnapshot};

use crate::channel::{Channel, ChannelError, InboundHandler, OutboundMessage, SendReceipt};
use crate::inbound::{InboundMessage, SenderRef};

pub const CHANNEL_ID: &str = "canvas";

// ─── Client → server frames ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ClientFrame {
    #[serde(rename = "c2s:message")]
    Message { text: String },
    #[serde(rename = "c2s:click")]
    Click {
        component_id: String,
        #[serde(default)]
        action: Option<String>,
    },
    #[serde(rename = "c2s:input")]
    Input { component_id: String, value: String },
    #[serde(rename = "c2s:form_submit")]
    FormSubmit {
        form_id: String,
        values: serde_json::Value,
    },
    #[serde(rename = "c2s:select")]
    Select { component_id: String, value: String },
    #[serde(rename = "c2s:steer")]
    Steer {
        #[serde(default = "default_steer_kind")]
        kind: String,
        content: String,
    },
    #[serde(rename = "c2s:abort")]
    Abort {
        #[serde(default)]
        reason: String,
    },
    #[serde(rename = "c2s:drag")]
    Drag { id: String, x: f64, y: f64 },
    #[serde(rename = "c2s:ping")]
    Ping { ts: u64 },
}

fn default_steer_kind() -> String {
    "inject".into()
}

// ─── Server → client frames ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "s2c:agent:status")]
    AgentStatus { status: String },
    #[serde(rename = "s2c:text:delta")]
    TextDelta { delta: String },
    #[serde(rename = "s2c:text:complete")]
    TextComplete { text: String },
    #[serde(rename = "s2c:canvas:snapshot")]
    CanvasSnapshot { snapshot: CanvasSnapshot },
    #[serde(rename = "s2c:canvas:change")]
    CanvasChange { change: CanvasChange },
    #[serde(rename = "s2c:pong")]
    Pong { ts: u64 },
}

/// What the transport should do with one client frame.
#[derive(Debug, Clone, PartialEq)]
pub enum CanvasClientAction {
    /// Deliver as inbound session text.
    Inbound { text: String },
    /// Native steering; `kind` is "inject" or "reminder".
    Steer { kind: String, content: String },
    /// Abort the active run.
    Abort { reason: String },
    /// Apply a node move; no inbound message.
    Drag { id: String, x: f64, y: f64 },
    /// Answer at transport level with a pong echoing the timestamp.
    Pong { ts: u64 },
}

/// Translate a client frame into the action the transport applies.
/// The bracketed prefixes keep structured UI events readable to a single
/// text-driven agent.
pub fn translate(frame: ClientFrame) -> CanvasClientAction {
    match frame {
        ClientFrame::Message { text } => CanvasClientAction::Inbound { text },
        ClientFrame::Click {
            component_id,
            action,
        } => CanvasClientAction::Inbound {
            text: format!(
                "[USER_CLICK] Component: {component_id} Action: {}",
                action.as_deref().unwrap_or("click")
            ),
        },
        ClientFrame::Input {
            component_id,
            value,
        } => CanvasClientAction::Inbound {
            text: format!("[USER_INPUT] Component: {component_id} Value: {value}"),
        },
        ClientFrame::FormSubmit { form_id, values } => CanvasClientAction::Inbound {
            text: format!("[FORM_SUBMIT] Form: {form_id} Values: {values}"),
        },
        ClientFrame::Select {
            component_id,
            value,
        } => CanvasClientAction::Inbound {
            text: format!("[USER_SELECT] Component: {component_id} Value: {value}"),
        },
        ClientFrame::Steer { kind, content } => CanvasClientAction::Steer { kind, content },
        ClientFrame::Abort { reason } => CanvasClientAction::Abort { reason },
        ClientFrame::Drag { id, x, y } => CanvasClientAction::Drag { id, x, y },
        ClientFrame::Ping { ts } => CanvasClientAction::Pong { ts },
    }
}

impl CanvasClientAction {
    /// The bracketed text form, for transports that feed everything —
    /// including steering — through the inbound text path.
    pub fn bracketed_text(&self) -> Option<String> {
        match self {
            Self::Inbound { text } => Some(text.clone()),
            Self::Steer { kind, content } => Some(format!("[STEER:{kind}] {content}")),
            Self::Abort { reason } => Some(format!("[ABORT] {reason}")),
            Self::Drag { .. } | Self::Pong { .. } => None,
        }
    }
}

// ─── The channel ──────────────────────────────────────────────────────────────

pub struct CanvasChannel {
    handler: Mutex<Option<InboundHandler>>,
    frames: broadcast::Sender<ServerFrame>,
    running: AtomicBool,
}

impl CanvasChannel {
    pub fn new() -> Self {
        let (frames, _) = broadcast::channel(256);
        Self {
            handler: Mutex::new(None),
            frames,
            running: AtomicBool::new(false),
        }
    }

    /// Transport subscribes here to relay frames to its socket.
    pub fn subscribe_frames(&self) -> broadcast::Receiver<ServerFrame> {
        self.frames.subscribe()
    }

    /// Broadcast a frame to every connected client.
    pub fn broadcast(&self, frame: ServerFrame) {
        let _ = self.frames.send(frame);
    }

    /// Process one client frame; inbound-producing frames reach the
    /// registered handler, everything else is returned for the transport
    /// to act on.
    pub fn handle_client_frame(&self, user_id: &str, frame: ClientFrame) -> CanvasClientAction {
        let action = translate(frame);
        if let CanvasClientAction::Inbound { text } = &action {
            let handler = self.handler.lock().unwrap().clone();
            if let Some(handler) = handler {
                handler(InboundMessage::text_message(
                    CHANNEL_ID,
                    SenderRef::user(CHANNEL_ID, user_id),
                    text,
                ));
            }
        }
        action
    }
}

impl Default for CanvasChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Channel for CanvasChannel {
    fn id(&self) -> &str {
        CHANNEL_ID
    }

    fn name(&self) -> &str {
        "Canvas"
    }

    async fn start(&self) -> Result<(), ChannelError> {
        self.running.store(true, Ordering::SeqCst);
        info!("canvas channel started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), ChannelError> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send(
        &self,
        _recipient: &str,
        outbound: &OutboundMessage,
    ) -> Result<SendReceipt, ChannelError> {
        self.broadcast(ServerFrame::TextComplete {
            text: outbound.text.clone(),
        });
        Ok(SendReceipt {
            success: true,
            message_id: None,
            error: None,
        })
    }

    fn on_message(&self, handler: InboundHandler) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
