// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The uniform channel contract.  Every transport adapter — terminal,
//! chat-platform webhook, realtime canvas — implements [`Channel`]; the
//! registry maps channel ids to adapters and is populated once at startup.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::inbound::InboundMessage;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel transport error: {0}")]
    Transport(String),
    #[error("channel is not started")]
    NotStarted,
    #[error("signature verification failed")]
    BadSignature,
    #[error("sender not allowed: {0}")]
    AccessDenied(String),
    #[error("unknown channel: {0}")]
    UnknownChannel(String),
}

/// Text the agent wants delivered to a recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub text: String,
    /// Message this one replies to, when the transport supports threading.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

impl OutboundMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            reply_to: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendReceipt {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceEvent {
    pub channel_id: String,
    pub user_id: String,
    pub online: bool,
}

pub type InboundHandler = Arc<dyn Fn(InboundMessage) + Send + Sync>;
pub type PresenceHandler = Arc<dyn Fn(PresenceEvent) + Send + Sync>;

#[async_trait]
pub trait Channel: Send + Sync {
    /// Stable channel id used in context keys ("terminal", "webhook", "canvas").
    fn id(&self) -> &str;
    /// Human-readable name for status output.
    fn name(&self) -> &str;

    async fn start(&self) -> Result<(), ChannelError>;
    async fn stop(&self) -> Result<(), ChannelError>;

    async fn send(
        &self,
        recipient: &str,
        outbound: &OutboundMessage,
    ) -> Result<SendReceipt, ChannelError>;

    fn on_message(&self, handler: InboundHandler);
    fn on_presence(&self, _handler: PresenceHandler) {}

    fn is_healthy(&self) -> bool;
}

/// Registry of started channels, id-keyed.  Read-only after startup.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: HashMap<String, Arc<dyn Channel>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, channel: Arc<dyn Channel>) {
        self.channels.insert(channel.id().to_string(), channel);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Channel>> {
        self.channels.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.channels.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn send(
        &self,
        channel_id: &str,
        recipient: &str,
        outbound: &OutboundMessage,
    ) -> Result<SendReceipt, ChannelError> {
        let channel = self
            .get(channel_id)
            .ok_or_else(|| ChannelError::UnknownChannel(channel_id.to_string()))?;
        channel.send(recipient, outbound).await
    }

    pub async fn stop_all(&self) {
        for channel in self.channels.values() {
            let _ = channel.stop().await;
        }
    }

    /// Build the registry from the typed channel config map.  Only enabled
    /// channels are constructed.
    pub fn from_config(cfg: &harbor_config::ChannelsConfig) -> Self {
        let mut registry = Self::new();
        if let Some(terminal) = &cfg.terminal {
            if terminal.enabled {
                registry.register(Arc::new(crate::terminal::TerminalChannel::new()));
            }
        }
        if let Some(webhook) = &cfg.webhook {
            if webhook.enabled {
                registry.register(Arc::new(crate::webhook::WebhookChannel::new(
                    webhook.clone(),
                )));
            }
        }
        if let Some(canvas) = &cfg.canvas {
            if canvas.enabled {
                registry.register(Arc::new(crate::canvas::CanvasChannel::new()));
            }
        }
        registry
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
