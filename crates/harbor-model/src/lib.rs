// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod error;
pub mod mock;
mod openai_compat;
mod provider;
pub mod retry;
mod types;

pub use error::ProviderError;
pub use mock::{MockProvider, ScriptedProvider};
pub use openai_compat::OpenAiCompatProvider;
pub use provider::{build_provider, ModelProvider, ResponseStream};
pub use types::{
    CompletionRequest, ContentBlock, FunctionCall, Message, MessageContent, ResponseEvent, Role,
    ToolDefinition, Usage,
};
