// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;

use harbor_config::ProviderConfig;

use crate::{CompletionRequest, ProviderError, ResponseEvent};

pub type ResponseStream =
    Pin<Box<dyn Stream<Item = Result<ResponseEvent, ProviderError>> + Send>>;

/// A stateless language-model client: chat completion with streaming.
///
/// Providers hold no conversation state; everything the model needs travels
/// in the [`CompletionRequest`].
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Human-readable provider name for status display.
    fn name(&self) -> &str;

    /// Model identifier as reported to users.
    fn model_name(&self) -> &str;

    /// Send a completion request and return a streaming response.
    async fn complete(&self, req: CompletionRequest) -> Result<ResponseStream, ProviderError>;
}

/// Construct a provider from config.  Unknown kinds are a startup error.
pub fn build_provider(cfg: &ProviderConfig) -> anyhow::Result<Arc<dyn ModelProvider>> {
    match cfg.kind.as_str() {
        "openai_compat" => Ok(Arc::new(crate::OpenAiCompatProvider::new(cfg)?)),
        "mock" => Ok(Arc::new(crate::MockProvider)),
        other => anyhow::bail!("unknown provider kind '{other}'"),
    }
}
