// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// Failure from a model provider.
///
/// The retry layer keys off [`ProviderError::is_retryable`]: rate limits and
/// server-side failures are retried with backoff, auth and bad-request
/// failures never are.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("rate limited")]
    RateLimited {
        /// Server-suggested wait, when the response carried `Retry-After`.
        retry_after: Option<std::time::Duration>,
    },
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("server error (status {status})")]
    Server { status: u16 },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("model stream ended unexpectedly: {0}")]
    StreamTerminated(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Server { .. } | Self::Transport(_)
        )
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Auth(_) => "auth",
            Self::RateLimited { .. } => "rate_limited",
            Self::BadRequest(_) => "bad_request",
            Self::Server { .. } => "server",
            Self::Protocol(_) => "protocol",
            Self::StreamTerminated(_) => "stream_terminated",
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_and_server_errors_are_retryable() {
        assert!(ProviderError::RateLimited { retry_after: None }.is_retryable());
        assert!(ProviderError::Server { status: 503 }.is_retryable());
        assert!(ProviderError::Transport("reset".into()).is_retryable());
    }

    #[test]
    fn auth_and_bad_request_are_not_retryable() {
        assert!(!ProviderError::Auth("401".into()).is_retryable());
        assert!(!ProviderError::BadRequest("missing field".into()).is_retryable());
        assert!(!ProviderError::Protocol("garbage".into()).is_retryable());
    }
}
