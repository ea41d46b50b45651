// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Generic chat-platform webhook channel.
//!
//! Inbound: the platform POSTs `{message_id, from:{user_id, username?,
//! group_id?}, text, bot?}` with an HMAC-SHA256 hex signature of the raw
//! body.  The channel verifies the signature, deduplicates by provider
//! message id, drops the bot's own messages, applies the DM policy, and
//! normalises the rest into [`InboundMessage`]s.
//!
//! Outbound: one POST per chunk after splitting at the platform length
//! limit.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

use harbor_config::WebhookChannelConfig;

use crate::access::{check_access, split_message, PendingUser};
use crate::channel::{Channel, ChannelError, InboundHandler, OutboundMessage, SendReceipt};
use crate::inbound::{InboundMessage, SenderRef};

pub const CHANNEL_ID: &str = "webhook";
const DEDUP_WINDOW: usize = 1024;

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    message_id: String,
    from: WebhookSender,
    #[serde(default)]
    text: String,
    /// Set by platforms that echo the bot's own messages back.
    #[serde(default)]
    bot: bool,
}

#[derive(Debug, Deserialize)]
struct WebhookSender {
    user_id: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    group_id: Option<String>,
}

pub struct WebhookChannel {
    cfg: WebhookChannelConfig,
    handler: Mutex<Option<InboundHandler>>,
    running: AtomicBool,
    seen_ids: Mutex<(VecDeque<String>, HashSet<String>)>,
    pending_users: Mutex<Vec<PendingUser>>,
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(cfg: WebhookChannelConfig) -> Self {
        Self {
            cfg,
            handler: Mutex::new(None),
            running: AtomicBool::new(false),
            seen_ids: Mutex::new((VecDeque::new(), HashSet::new())),
            pending_users: Mutex::new(Vec::new()),
            client: reqwest::Client::new(),
        }
    }

    pub fn pending_users(&self) -> Vec<PendingUser> {
        self.pending_users.lock().unwrap().clone()
    }

    /// Process one inbound webhook body.  Returns the normalised message
    /// when it should reach a session; `Ok(None)` for drops (duplicates,
    /// bot echoes).
    pub fn handle_webhook(
        &self,
        body: &str,
        signature: Option<&str>,
    ) -> Result<Option<InboundMessage>, ChannelError> {
        if let Some(secret) = &self.cfg.signing_secret {
            let provided = signature.ok_or(ChannelError::BadSignature)?;
            if !verify_signature(secret, body, provided) {
                warn!("webhook signature mismatch");
                return Err(ChannelError::BadSignature);
            }
        }

        let payload: WebhookPayload = serde_json::from_str(body)
            .map_err(|e| ChannelError::Transport(format!("payload: {e}")))?;

        // Bot-originated messages never loop back into sessions.
        if payload.bot
            || self
                .cfg
                .bot_user_id
                .as_deref()
                .map(|id| id == payload.from.user_id)
                .unwrap_or(false)
        {
            debug!("dropping bot-originated message");
            return Ok(None);
        }

        // Dedup by provider-side message id.
        {
            let mut seen = self.seen_ids.lock().unwrap();
            if seen.1.contains(&payload.message_id) {
                debug!(id = %payload.message_id, "duplicate webhook delivery dropped");
                return Ok(None);
            }
            seen.0.push_back(payload.message_id.clone());
            seen.1.insert(payload.message_id.clone());
            while seen.0.len() > DEDUP_WINDOW {
                if let Some(old) = seen.0.pop_front() {
                    seen.1.remove(&old);
                }
            }
        }

        // DM policy.
        let username = payload.from.username.as_deref().unwrap_or("");
        {
            let mut pending = self.pending_users.lock().unwrap();
            if let Err(denial) = check_access(
                &self.cfg.dm_policy,
                &payload.from.user_id,
                username,
                &self.cfg.allowed_users,
                &mut pending,
            ) {
                return Err(ChannelError::AccessDenied(denial));
            }
        }

        let mut from = SenderRef::user(CHANNEL_ID, &payload.from.user_id);
        if let Some(group) = &payload.from.group_id {
            from = from.in_group(group);
        }
        let raw: serde_json::Value = serde_json::from_str(body).unwrap_or(serde_json::Value::Null);

        let msg = InboundMessage {
            id: payload.message_id,
            channel_id: CHANNEL_ID.to_string(),
            from,
            text: payload.text,
            timestamp: chrono::Utc::now(),
            attachments: Vec::new(),
            raw: Some(raw),
        };

        let handler = self.handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(msg.clone());
        }
        Ok(Some(msg))
    }
}

fn verify_signature(secret: &str, body: &str, provided: &str) -> bool {
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body.as_bytes());
    let expected = hex::encode(mac.finalize().into_bytes());
    // Constant-time comparison — no timing oracle.  ct_eq rejects
    // length mismatches itself.
    expected
        .as_bytes()
        .ct_eq(provided.to_lowercase().as_bytes())
        .unwrap_u8()
        == 1
}

/// Compute the signature a platform (or test) should attach.
pub fn sign_body(secret: &str, body: &str) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(body.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[async_trait]
impl Channel for WebhookChannel {
    fn id(&self) -> &str {
        CHANNEL_ID
    }

    fn name(&self) -> &str {
        "Webhook chat"
    }

    async fn start(&self) -> Result<(), ChannelError> {
        self.running.store(true, Ordering::SeqCst);
        info!("webhook channel started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), ChannelError> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send(
        &self,
        recipient: &str,
        outbound: &OutboundMessage,
    ) -> Result<SendReceipt, ChannelError> {
        let Some(url) = &self.cfg.send_url else {
            return Err(ChannelError::Transport("no send_url configured".into()));
        };

        let chunks = split_message(&outbound.text, self.cfg.message_limit);
        let mut last_id = None;
        for chunk in chunks {
            let resp = self
                .client
                .post(url)
                .json(&serde_json::json!({
                    "recipient": recipient,
                    "text": chunk,
                    "reply_to": outbound.reply_to,
                }))
                .send()
                .await
                .map_err(|e| ChannelError::Transport(e.to_string()))?;
            if !resp.status().is_success() {
                return Ok(SendReceipt {
                    success: false,
                    message_id: None,
                    error: Some(format!("send returned {}", resp.status())),
                });
            }
            last_id = resp
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|v| v["message_id"].as_str().map(String::from));
        }
        Ok(SendReceipt {
            success: true,
            message_id: last_id,
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

#[cfg(test)]
mod tests {
    use super::*;

    fn channel_with(cfg: WebhookChannelConfig) -> WebhookChannel {
        WebhookChannel::new(cfg)
    }

    fn body(message_id: &str, user: &str) -> String {
        format!(
            r#"{{"message_id":"{message_id}","from":{{"user_id":"{user}"}},"text":"hello"}}"#
        )
    }

    #[test]
    fn valid_message_is_normalised() {
        let ch = channel_with(WebhookChannelConfig::default());
        let msg = ch.handle_webhook(&body("m1", "42"), None).unwrap().unwrap();
        assert_eq!(msg.text, "hello");
        assert_eq!(msg.from.context_key(), "webhook:42");
        assert_eq!(msg.id, "m1");
    }

    #[test]
    fn duplicate_delivery_is_dropped() {
        let ch = channel_with(WebhookChannelConfig::default());
        assert!(ch.handle_webhook(&body("m1", "42"), None).unwrap().is_some());
        assert!(ch.handle_webhook(&body("m1", "42"), None).unwrap().is_none());
    }

    #[test]
    fn bot_originated_messages_are_dropped() {
        let cfg = WebhookChannelConfig {
            bot_user_id: Some("bot-7".into()),
            ..Default::default()
        };
        let ch = channel_with(cfg);
        assert!(ch.handle_webhook(&body("m1", "bot-7"), None).unwrap().is_none());

        let explicit = r#"{"message_id":"m2","from":{"user_id":"9"},"text":"x","bot":true}"#;
        assert!(ch.handle_webhook(explicit, None).unwrap().is_none());
    }

    #[test]
    fn signature_is_verified_when_secret_configured() {
        let cfg = WebhookChannelConfig {
            signing_secret: Some("topsecret".into()),
            ..Default::default()
        };
        let ch = channel_with(cfg);
        let b = body("m1", "42");

        // Missing signature.
        assert!(matches!(
            ch.handle_webhook(&b, None),
            Err(ChannelError::BadSignature)
        ));
        // Wrong signature.
        assert!(matches!(
            ch.handle_webhook(&b, Some("deadbeef")),
            Err(ChannelError::BadSignature)
        ));
        // Correct signature.
        let sig = sign_body("topsecret", &b);
        assert!(ch.handle_webhook(&b, Some(&sig)).unwrap().is_some());
    }

    #[test]
    fn group_id_rides_into_context_key() {
        let ch = channel_with(WebhookChannelConfig::default());
        let b = r#"{"message_id":"m1","from":{"user_id":"42","group_id":"team"},"text":"x"}"#;
        let msg = ch.handle_webhook(b, None).unwrap().unwrap();
        assert_eq!(msg.from.context_key(), "webhook:42:team");
    }

    #[test]
    fn allowlist_policy_denies_strangers() {
        let cfg = WebhookChannelConfig {
            dm_policy: "allowlist".into(),
            allowed_users: vec!["42".into()],
            ..Default::default()
        };
        let ch = channel_with(cfg);
        assert!(ch.handle_webhook(&body("m1", "42"), None).unwrap().is_some());
        assert!(matches!(
            ch.handle_webhook(&body("m2", "99"), None),
            Err(ChannelError::AccessDenied(_))
        ));
    }

    #[test]
    fn handler_receives_normalised_messages() {
        let ch = channel_with(WebhookChannelConfig::default());
        let received = std::sync::Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        ch.on_message(std::sync::Arc::new(move |msg| {
            sink.lock().unwrap().push(msg.text);
        }));
        ch.handle_webhook(&body("m1", "42"), None).unwrap();
        assert_eq!(received.lock().unwrap().as_slice(), ["hello"]);
    }

    #[test]
    fn malformed_payload_is_a_transport_error() {
        let ch = channel_with(WebhookChannelConfig::default());
        assert!(matches!(
            ch.handle_webhook("{not json", None),
            Err(ChannelError::Transport(_))
        ));
    }
}
