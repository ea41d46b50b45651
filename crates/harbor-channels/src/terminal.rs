// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Terminal channel: stdin lines in, stdout text out.  The local operator
//! is a single implicit user.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::AsyncBufReadExt;
use tracing::{debug, info};

use crate::channel::{Channel, ChannelError, InboundHandler, OutboundMessage, SendReceipt};
use crate::inbound::{InboundMessage, SenderRef};

pub const CHANNEL_ID: &str = "terminal";
const LOCAL_USER: &str = "local";

pub struct TerminalChannel {
    handler: Mutex<Option<InboundHandler>>,
    running: AtomicBool,
}

impl TerminalChannel {
    pub fn new() -> Self {
        Self {
            handler: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    /// Feed one line as if typed on stdin.  Used by tests and by the CLI
    /// one-shot mode.
    pub fn inject_line(&self, line: &str) {
        let handler = self.handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            let msg = InboundMessage::text_message(
                CHANNEL_ID,
                SenderRef::user(CHANNEL_ID, LOCAL_USER),
                line,
            );
            handler(msg);
        } else {
            debug!("terminal line dropped; no handler registered");
        }
    }
}

impl Default for TerminalChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Channel for TerminalChannel {
    fn id(&self) -> &str {
        CHANNEL_ID
    }

    fn name(&self) -> &str {
        "Terminal"
    }

    async fn start(&self) -> Result<(), ChannelError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("terminal channel started");

        let handler = self.handler.lock().unwrap().clone();
        let Some(handler) = handler else {
            return Err(ChannelError::NotStarted);
        };

        tokio::spawn(async move {
            let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let msg = InboundMessage::text_message(
                    CHANNEL_ID,
                    SenderRef::user(CHANNEL_ID, LOCAL_USER),
                    trimmed,
                );
                handler(msg);
            }
            debug!("terminal stdin closed");
        });
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
        println!("{}", outbound.text);
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
