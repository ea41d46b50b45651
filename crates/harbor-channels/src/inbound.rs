// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who sent an inbound message.  Group-vs-DM routing is encoded in
/// `group_id`: `Some` means the message arrived in a group context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderRef {
    pub channel_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
}

impl SenderRef {
    pub fn user(channel_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            user_id: Some(user_id.into()),
            group_id: None,
        }
    }

    pub fn in_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    /// Context key for session routing: `channel:user[:group]`.
    pub fn context_key(&self) -> String {
        let user = self.user_id.as_deref().unwrap_or("anonymous");
        match &self.group_id {
            Some(g) => format!("{}:{}:{}", self.channel_id, user, g),
            None => format!("{}:{}", self.channel_id, user),
        }
    }
}

/// The common normalised shape every channel translates its transport
/// events into.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: String,
    pub channel_id: String,
    pub from: SenderRef,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub attachments: Vec<String>,
    /// The untranslated transport payload, for channel-specific needs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
}

impl InboundMessage {
    pub fn text_message(
        channel_id: impl Into<String>,
        from: SenderRef,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            channel_id: channel_id.into(),
            from,
            text: text.into(),
            timestamp: Utc::now(),
            attachments: Vec::new(),
            raw: None,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
