// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod access;
pub mod canvas;
pub mod channel;
pub mod inbound;
pub mod terminal;
pub mod webhook;

pub use access::{check_access, split_message, PendingUser};
pub use canvas::{CanvasChannel, CanvasClientAction, ClientFrame, ServerFrame};
pub use channel::{
    Channel, ChannelError, ChannelRegistry, InboundHandler, OutboundMessage, PresenceEvent,
    PresenceHandler, SendReceipt,
};
pub use inbound::{InboundMessage, SenderRef};
pub use terminal::TerminalChannel;
pub use webhook::WebhookChannel;
